use anyhow::Result;
use nimbus_fs::{Ctx, Pool, SnapshotId};
use tracing::info;

use crate::SnapshotsCmd;
use crate::helpers::resolve_file;

pub async fn run_snapshots(cmd: SnapshotsCmd, pool: &Pool, ctx: &Ctx) -> Result<()> {
    let root = pool.get_root(ctx).await?;
    match cmd {
        SnapshotsCmd::List { path } => {
            let file = resolve_file(&root, &path).await?;
            for snapshot in file.list_snapshots().await? {
                let base = snapshot
                    .base_snapshot_id
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "-".to_owned());
                let open = if pool.is_snapshot_open(snapshot.id) {
                    " (open)"
                } else {
                    ""
                };
                println!(
                    "{:>8} base={base:<8} {:>12} bytes {}{open}",
                    snapshot.id,
                    snapshot.size,
                    snapshot.create_time.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        SnapshotsCmd::Create { path, base } => {
            let file = resolve_file(&root, &path).await?;
            let created = file.create_snapshot(base.map(SnapshotId)).await?;
            println!("{}", created.id);
        }
        SnapshotsCmd::Delete { path, id } => {
            let file = resolve_file(&root, &path).await?;
            file.delete_snapshot(SnapshotId(id)).await?;
            info!("deleted snapshot {id} of '{path}'");
        }
    }
    Ok(())
}
