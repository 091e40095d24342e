use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use nimbus_fs::PoolConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub pool: PoolSection,
    pub identity: IdentitySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    /// directory holding the pool database
    pub path: PathBuf,
    #[serde(default)]
    pub engine: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySection {
    pub principal: String,
    /// Relative paths are resolved against the config file's directory.
    pub secret_key_file: PathBuf,
}

impl CliConfig {
    pub fn load(config_file: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(config_file).with_context(|| {
            format!(
                "could not read {}; run `nimbus config init` first",
                config_file.display()
            )
        })?;
        toml::from_str(&content)
            .with_context(|| format!("could not parse {}", config_file.display()))
    }

    pub fn secret_key_path(&self, config_file: &Path) -> PathBuf {
        resolve_relative(config_file, &self.identity.secret_key_file)
    }

    pub fn pool_path(&self, config_file: &Path) -> PathBuf {
        resolve_relative(config_file, &self.pool.path)
    }
}

fn resolve_relative(config_file: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_owned();
    }
    match config_file.parent() {
        Some(dir) => dir.join(path),
        None => path.to_owned(),
    }
}

pub fn read_secret(path: &Path) -> anyhow::Result<Vec<u8>> {
    let secret = std::fs::read(path)
        .with_context(|| format!("could not read secret key file {}", path.display()))?;
    if secret.is_empty() {
        bail!("secret key file {} is empty", path.display());
    }
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_fs::NameCollation;

    #[test]
    fn engine_section_is_optional() {
        let cfg: CliConfig = toml::from_str(
            r#"
            [pool]
            path = "pool"

            [identity]
            principal = "alice"
            secret_key_file = "alice.secretkey"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.pool.engine, PoolConfig::default());
        assert_eq!(cfg.identity.principal, "alice");
    }

    #[test]
    fn relative_paths_follow_the_config_file() {
        let cfg: CliConfig = toml::from_str(
            r#"
            [pool]
            path = "/var/lib/nimbus/pool"

            [pool.engine]
            collation = "case_insensitive"

            [identity]
            principal = "alice"
            secret_key_file = "keys/alice.secretkey"
            "#,
        )
        .unwrap();
        let config_file = Path::new("/home/alice/.config/nimbus/config.toml");
        assert_eq!(
            cfg.secret_key_path(config_file),
            Path::new("/home/alice/.config/nimbus/keys/alice.secretkey")
        );
        assert_eq!(
            cfg.pool_path(config_file),
            Path::new("/var/lib/nimbus/pool")
        );
        assert_eq!(cfg.pool.engine.collation, NameCollation::CaseInsensitive);
    }
}
