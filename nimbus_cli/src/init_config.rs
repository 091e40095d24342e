use std::{
    fs,
    io::Write,
    path::Path,
};

use anyhow::Context;
use clap::Subcommand;
use rand::RngCore;
use toml_edit::{DocumentMut, Item, Table, value};
use tracing::info;

#[derive(Subcommand)]
pub enum CmdConfig {
    /// Creates the config file if it doesn't exist, generates an unlock
    /// secret and registers the principal in the pool
    Init {
        /// Name of the principal this config unlocks as
        #[arg(short, long, default_value = "owner")]
        principal: String,
    },
}

impl CmdConfig {
    pub fn run(&self, config_file: &Path, local_data_dir: &Path) -> anyhow::Result<()> {
        let mut doc = if config_file.exists() {
            fs::read_to_string(config_file)?
        } else {
            if let Some(dir) = config_file.parent() {
                fs::create_dir_all(dir)?;
            }
            String::new()
        }
        .parse::<DocumentMut>()
        .context("could not parse config file")?;

        match self {
            Self::Init { principal } => {
                let secretkey_file = config_file.with_file_name(format!("{principal}.secretkey"));

                let pool = table_mut(&mut doc, "pool")?;
                if !pool.contains_key("path") {
                    let pool_path = local_data_dir.join("pool");
                    let pool_path = pool_path
                        .to_str()
                        .context("data directory is not valid UTF-8")?;
                    pool.insert("path", value(pool_path));
                }
                let engine = pool
                    .entry("engine")
                    .or_insert(Item::Table(Table::new()))
                    .as_table_mut()
                    .context("[pool.engine] is not a table")?;
                if !engine.contains_key("chunk_size") {
                    engine.insert("chunk_size", value(64 * 1024_i64));
                }
                if !engine.contains_key("collation") {
                    engine.insert("collation", value("binary"));
                }

                let identity = table_mut(&mut doc, "identity")?;
                identity.insert("principal", value(principal.as_str()));
                identity.insert("secret_key_file", value(format!("{principal}.secretkey")));

                if !secretkey_file.exists() {
                    info!("generating secure random unlock secret for {principal}");
                    write_new_secret(&secretkey_file)?;
                }
            }
        }

        info!("writing to config file {config_file:?}");

        let tmp_path = config_file.with_extension("tmp");
        let mut tmp = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(doc.to_string().as_bytes())?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, config_file)?;
        Ok(())
    }
}

fn table_mut<'a>(doc: &'a mut DocumentMut, name: &str) -> anyhow::Result<&'a mut Table> {
    doc.entry(name)
        .or_insert(Item::Table(Table::new()))
        .as_table_mut()
        .with_context(|| format!("[{name}] is not a table"))
}

/// Writes 32 random bytes to `path` and returns them.
pub fn write_new_secret(path: &Path) -> anyhow::Result<Vec<u8>> {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, bytes)
        .with_context(|| format!("could not write secret key file {}", path.display()))?;
    Ok(bytes.to_vec())
}
