use anyhow::Result;
use nimbus_fs::{AccessLevel, Ctx, Pool};
use tracing::info;

use crate::helpers::resolve;
use crate::{ShareCmd, ShareLevel};

pub async fn run_share(cmd: ShareCmd, pool: &Pool, ctx: &Ctx) -> Result<()> {
    let root = pool.get_root(ctx).await?;
    match cmd {
        ShareCmd::Grant {
            path,
            principal,
            level,
        } => {
            let node = resolve(&root, &path).await?.node().id;
            let level = match level {
                ShareLevel::Read => AccessLevel::Read,
                ShareLevel::Write => AccessLevel::Write,
            };
            let grant = pool
                .vault()
                .grant_access(ctx, node, &principal, level)
                .await?;
            info!("granted {} access on '{path}' to {principal}", grant.level);
        }
        ShareCmd::Revoke { path, principal } => {
            let node = resolve(&root, &path).await?.node().id;
            if pool.vault().revoke_access(ctx, node, &principal).await? {
                info!("revoked access on '{path}' from {principal}");
            } else {
                info!("{principal} had no grant on '{path}'");
            }
        }
        ShareCmd::List => {
            for (grant, node) in pool.vault().shared_with_me(ctx).await? {
                println!("{:>8} {:<5} {}", node.id, grant.level, node.name);
            }
        }
    }
    Ok(())
}
