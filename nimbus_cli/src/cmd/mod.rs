use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use nimbus_fs::{Ctx, FsError};
use tracing::info;

use crate::config::{CliConfig, read_secret};
use crate::helpers::open_pool;
use crate::init_config::CmdConfig;

mod principal;
mod share;
mod snapshots;
mod trash;
mod tree;

pub use principal::run_principal;
pub use share::run_share;
pub use snapshots::run_snapshots;
pub use trash::run_trash;
pub use tree::run_tree;

pub async fn run_command(
    dirs: &ProjectDirs,
    config_file: PathBuf,
    cmd: crate::Commands,
) -> Result<()> {
    if let crate::Commands::Config { cmd } = &cmd {
        cmd.run(&config_file, dirs.data_dir())?;
        let CmdConfig::Init { principal } = cmd;
        return register_identity(&config_file, principal).await;
    }

    let config = CliConfig::load(&config_file)?;
    let pool = open_pool(&config.pool_path(&config_file), config.pool.engine.clone()).await?;

    let result = match cmd {
        crate::Commands::Principal { cmd } => run_principal(cmd, &pool, &config_file).await,
        cmd => {
            let secret = read_secret(&config.secret_key_path(&config_file))?;
            let principal = &config.identity.principal;
            let session = pool
                .unlock(principal, &secret)
                .await
                .with_context(|| format!("could not unlock as '{principal}'"))?;
            let ctx = Ctx::new(session.clone());
            let result = match cmd {
                crate::Commands::Trash { cmd } => run_trash(cmd, &pool, &ctx).await,
                crate::Commands::Snapshots { cmd } => run_snapshots(cmd, &pool, &ctx).await,
                crate::Commands::Share { cmd } => run_share(cmd, &pool, &ctx).await,
                cmd => run_tree(cmd, &pool, &ctx).await,
            };
            session.end();
            result
        }
    };

    pool.shutdown().await?;
    result
}

async fn register_identity(config_file: &std::path::Path, principal: &str) -> Result<()> {
    let config = CliConfig::load(config_file)?;
    let secret = read_secret(&config.secret_key_path(config_file))?;
    let pool = open_pool(&config.pool_path(config_file), config.pool.engine.clone()).await?;
    match pool.register_principal(principal, &secret).await {
        Ok(p) => info!("registered principal {} (id {})", p.name, p.id),
        Err(FsError::NameConflict(_)) => {
            pool.unlock(principal, &secret).await.with_context(|| {
                format!("principal '{principal}' exists with a different secret")
            })?;
            info!("principal {principal} already registered");
        }
        Err(e) => return Err(e.into()),
    }
    pool.shutdown().await?;
    Ok(())
}
