use anyhow::Result;
use nimbus_fs::{Ctx, NodeId, Pool};
use tracing::info;

use crate::TrashCmd;

pub async fn run_trash(cmd: TrashCmd, pool: &Pool, ctx: &Ctx) -> Result<()> {
    let trash = pool.trash();
    match cmd {
        TrashCmd::List => {
            for node in trash.list(ctx).await? {
                let trashed_at = node
                    .trash_time
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                let suffix = if node.is_folder() { "/" } else { "" };
                println!("{:>8} {trashed_at} {}{suffix}", node.id, node.name);
            }
        }
        TrashCmd::Restore { id } => {
            let restored = trash.restore(ctx, NodeId(id)).await?;
            let parent = restored
                .parent_id
                .map(|p| p.to_string())
                .unwrap_or_default();
            info!("restored '{}' into folder {parent}", restored.name);
        }
        TrashCmd::Purge { id } => {
            let removed = trash.purge(ctx, NodeId(id)).await?;
            info!("permanently deleted {removed} nodes");
        }
        TrashCmd::Empty => {
            let removed = trash.empty(ctx).await?;
            info!("emptied the trash ({removed} nodes deleted)");
        }
    }
    Ok(())
}
