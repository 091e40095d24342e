use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use nimbus_fs::{Entry, FileEntry, FolderHandle, Pool, PoolConfig};
use nimbus_store_redb::RedbRowStore;

pub async fn open_pool(path: &Path, engine: PoolConfig) -> Result<Pool> {
    let store = RedbRowStore::open(path)
        .with_context(|| format!("could not open pool database {}", path.display()))?;
    let pool = Pool::open(Arc::new(store), engine)
        .await
        .context("could not open pool")?;
    Ok(pool)
}

/// Splits `a/b/c` into (`a/b`, `c`).
pub fn split_parent(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => Ok((parent, name)),
        None if !trimmed.is_empty() => Ok(("", trimmed)),
        _ => Err(anyhow!("'{path}' does not name a file or folder")),
    }
}

pub async fn resolve_folder(root: &FolderHandle, path: &str) -> Result<FolderHandle> {
    if path.trim_matches('/').is_empty() {
        return Ok(root.clone());
    }
    root.get_by_path(path)
        .await
        .with_context(|| format!("could not resolve '{path}'"))?
        .into_folder()
        .with_context(|| format!("'{path}' is not a folder"))
}

pub async fn resolve_file(root: &FolderHandle, path: &str) -> Result<FileEntry> {
    root.get_by_path(path)
        .await
        .with_context(|| format!("could not resolve '{path}'"))?
        .into_file()
        .with_context(|| format!("'{path}' is not a file"))
}

pub async fn resolve(root: &FolderHandle, path: &str) -> Result<Entry> {
    root.get_by_path(path)
        .await
        .with_context(|| format!("could not resolve '{path}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_and_name() {
        assert_eq!(split_parent("a/b/c").unwrap(), ("a/b", "c"));
        assert_eq!(split_parent("/top/").unwrap(), ("", "top"));
        assert_eq!(split_parent("file.txt").unwrap(), ("", "file.txt"));
        assert!(split_parent("/").is_err());
        assert!(split_parent("").is_err());
    }
}
