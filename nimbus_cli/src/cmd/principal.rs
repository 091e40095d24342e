use std::path::Path;

use anyhow::{Context, Result};
use nimbus_fs::Pool;
use tracing::info;

use crate::PrincipalCmd;
use crate::init_config::write_new_secret;

pub async fn run_principal(cmd: PrincipalCmd, pool: &Pool, config_file: &Path) -> Result<()> {
    match cmd {
        PrincipalCmd::Add {
            name,
            secret_key_file,
        } => {
            let key_file = secret_key_file
                .unwrap_or_else(|| config_file.with_file_name(format!("{name}.secretkey")));
            if key_file.exists() {
                anyhow::bail!("{} already exists", key_file.display());
            }
            let secret = write_new_secret(&key_file)?;
            let principal = match pool.register_principal(&name, &secret).await {
                Ok(p) => p,
                Err(e) => {
                    // the secret is useless without the principal
                    let _ = std::fs::remove_file(&key_file);
                    return Err(e).with_context(|| format!("could not register '{name}'"));
                }
            };
            info!(
                "registered principal {} (id {}); unlock secret in {}",
                principal.name,
                principal.id,
                key_file.display()
            );
        }
    }
    Ok(())
}
