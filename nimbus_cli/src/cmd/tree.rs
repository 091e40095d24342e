use std::path::Path;

use anyhow::{Context, Result, bail};
use nimbus_fs::{Access, Ctx, Entry, FolderHandle, FsError, Mode, Pool, SnapshotId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::Commands;
use crate::helpers::{resolve, resolve_file, resolve_folder, split_parent};

const COPY_BUF: usize = 1024 * 1024;

pub async fn run_tree(cmd: Commands, pool: &Pool, ctx: &Ctx) -> Result<()> {
    let root = pool.get_root(ctx).await?;
    match cmd {
        Commands::Ls { path } => {
            let folder = resolve_folder(&root, path.as_deref().unwrap_or("")).await?;
            for entry in folder.scan().await? {
                print_entry(pool, ctx, &entry).await?;
            }
        }
        Commands::Mkdir { path, parents } => {
            if parents {
                mkdir_all(&root, &path).await?;
            } else {
                let (parent, name) = split_parent(&path)?;
                resolve_folder(&root, parent).await?.create_folder(name).await?;
            }
        }
        Commands::Put { local, path } => put(&root, &local, &path).await?,
        Commands::Cat { path, snapshot } => {
            let file = resolve_file(&root, &path).await?;
            let handle = file
                .open(snapshot.map(SnapshotId), Access::READ, Mode::empty())
                .await?;
            let mut stdout = tokio::io::stdout();
            loop {
                let chunk = handle.read(COPY_BUF as u64).await?;
                if chunk.is_empty() {
                    break;
                }
                stdout.write_all(&chunk).await?;
            }
            stdout.flush().await?;
            handle.close().await?;
        }
        Commands::Ln { target, path } => {
            let (parent, name) = split_parent(&path)?;
            resolve_folder(&root, parent)
                .await?
                .create_symbolic_link(name, &target)
                .await?;
        }
        Commands::Mv { from, to } => {
            let (from_parent, name) = split_parent(&from)?;
            let source = resolve_folder(&root, from_parent).await?;
            // An existing folder as destination keeps the name, like mv(1).
            let (destination, new_name) = match root.get_by_path(&to).await {
                Ok(Entry::Folder(folder)) => (folder, None),
                Ok(_) => bail!("'{to}' already exists"),
                Err(FsError::NoSuchFileOrFolder(_)) => {
                    let (to_parent, new_name) = split_parent(&to)?;
                    (resolve_folder(&root, to_parent).await?, Some(new_name))
                }
                Err(e) => return Err(e.into()),
            };
            if destination.id() == source.id() {
                if let Some(new_name) = new_name {
                    source.rename(name, new_name).await?;
                }
            } else {
                source.move_to(name, &destination, new_name).await?;
            }
        }
        Commands::Rm { path } => {
            let (parent, name) = split_parent(&path)?;
            let trashed = resolve_folder(&root, parent).await?.trash(name).await?;
            info!("moved '{path}' to the trash (id {})", trashed.id);
        }
        _ => bail!("not a tree command"),
    }
    Ok(())
}

async fn print_entry(pool: &Pool, ctx: &Ctx, entry: &Entry) -> Result<()> {
    let node = entry.node();
    let modified = node.update_time.format("%Y-%m-%d %H:%M");
    match entry {
        Entry::Folder(_) => println!("d {:>12} {modified} {}/", "-", node.name),
        Entry::File(file) => {
            let size = match file.list_snapshots().await?.first() {
                Some(latest) => latest.size.to_string(),
                None => "0".to_owned(),
            };
            println!("f {size:>12} {modified} {}", node.name);
        }
        Entry::SymbolicLink(link) => {
            let target = pool.tree().read_link(ctx, link.id).await?;
            println!("l {:>12} {modified} {} -> {target}", "-", node.name);
        }
    }
    Ok(())
}

async fn mkdir_all(root: &FolderHandle, path: &str) -> Result<FolderHandle> {
    let mut folder = root.clone();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        folder = match folder.lookup(segment).await {
            Ok(Entry::Folder(existing)) => existing,
            Ok(_) => bail!("'{segment}' exists and is not a folder"),
            Err(FsError::NoSuchFileOrFolder(_)) => folder.create_folder(segment).await?,
            Err(e) => return Err(e.into()),
        };
    }
    Ok(folder)
}

async fn put(root: &FolderHandle, local: &Path, path: &str) -> Result<()> {
    let (parent, name) = split_parent(path)?;
    let folder = resolve_folder(root, parent).await?;
    let (file, mode) = match folder.lookup(name).await {
        Ok(Entry::File(existing)) => (existing, Mode::NEW_SNAPSHOT | Mode::TRUNCATE_TO_ZERO),
        Ok(_) => bail!("'{path}' exists and is not a file"),
        Err(FsError::NoSuchFileOrFolder(_)) => (folder.create_file(name).await?, Mode::empty()),
        Err(e) => return Err(e.into()),
    };

    let mut source = tokio::fs::File::open(local)
        .await
        .with_context(|| format!("could not open {}", local.display()))?;
    let handle = file.open(None, Access::WRITE, mode).await?;
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        handle.write(&buf[..n]).await?;
        total += n as u64;
        // keep the dirty set bounded for large files
        handle.sync().await?;
    }
    handle.close().await?;
    debug!("copied {total} bytes into snapshot {}", handle.snapshot_id());
    info!("stored {} as '{path}'", local.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_fs::PoolConfig;

    #[tokio::test]
    async fn put_adds_a_snapshot_per_upload() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::helpers::open_pool(&dir.path().join("pool"), PoolConfig::default())
            .await
            .unwrap();
        pool.register_principal("alice", b"secret").await.unwrap();
        let ctx = Ctx::new(pool.unlock("alice", b"secret").await.unwrap());
        let root = pool.get_root(&ctx).await.unwrap();

        let local = dir.path().join("notes.txt");
        std::fs::write(&local, b"first draft").unwrap();
        mkdir_all(&root, "docs/2024").await.unwrap();
        put(&root, &local, "docs/2024/notes.txt").await.unwrap();
        std::fs::write(&local, b"v2").unwrap();
        put(&root, &local, "docs/2024/notes.txt").await.unwrap();

        let file = resolve_file(&root, "docs/2024/notes.txt").await.unwrap();
        let snapshots = file.list_snapshots().await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].size, 2);
        assert_eq!(snapshots[1].size, 11);

        let reader = file.open(None, Access::READ, Mode::empty()).await.unwrap();
        assert_eq!(reader.read(64).await.unwrap(), b"v2");
        reader.close().await.unwrap();
        assert!(resolve(&root, "docs/2024").await.unwrap().into_folder().is_some());
        pool.shutdown().await.unwrap();
    }
}
