use super::{
    inventory::SourceInventory,
    metakey,
    pipeline::SendPipeline,
    planner::{canonical_meta, item_base, Plan, PlanAction},
    resolver::ItemRef,
    upload::{CancelFlag, ObjectStore, UploadStats, Uploader},
    Item, Presence,
};
use crate::sys::btrfs;
use anyhow::{anyhow, Context as _, Result};
use chrono_tz::Tz;
use slog_scope::{debug, info, warn};
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExecuteContext<'a> {
    pub source_path: &'a Path,
    pub snapshot_dir: &'a Path,
    pub tz: Tz,
    pub pipe_through: &'a [Vec<String>],
    pub part_threshold: Option<u64>,
    pub spill_dir: Option<PathBuf>,
    pub cancel: CancelFlag,
}

/// The snapshot a run created for the proposed item. Later plans of the same
/// source bind their proposed slot to it instead of creating another.
#[derive(Debug, Clone)]
pub struct CreatedSnapshot {
    pub name: String,
    pub item: Item,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    pub created: Option<CreatedSnapshot>,
}

impl ExecutionReport {
    pub fn all_ok(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

/// Applies a plan action by action. A failed action is reported and the run
/// continues with whatever does not depend on it; there is no run-level
/// rollback, the next run re-resolves from observed state.
pub async fn execute<S: ObjectStore + ?Sized>(
    ctx: &ExecuteContext<'_>,
    store: &S,
    plan: &Plan,
    inventory: &SourceInventory,
    pre_created: Option<CreatedSnapshot>,
) -> ExecutionReport {
    let mut report = ExecutionReport {
        created: pre_created,
        ..ExecutionReport::default()
    };
    let mut names: HashMap<Uuid, String> = inventory
        .local
        .iter()
        .map(|(uuid, snapshot)| (*uuid, snapshot.name.clone()))
        .collect();
    let mut failed_items: HashSet<ItemRef> = HashSet::new();
    let mut pending_deletes: Vec<String> = Vec::new();

    for (index, action) in plan.actions.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            report.cancelled = true;
            report.skipped += plan.actions.len() - index;
            break;
        }

        let result = match action {
            PlanAction::RenameSnapshot { uuid, from, to } => {
                btrfs::rename_subvolume(&ctx.snapshot_dir.join(from), &ctx.snapshot_dir.join(to))
                    .map(|()| {
                        names.insert(*uuid, to.clone());
                        info!("canonicalized snapshot name"; "from" => from, "to" => to);
                    })
            }
            PlanAction::CreateSnapshot => match &report.created {
                Some(existing) => {
                    debug!("snapshot already created by an earlier plan"; "name" => &existing.name);
                    Ok(())
                }
                None => match create_snapshot(ctx, plan, inventory) {
                    Ok(created) => {
                        info!("created snapshot"; "name" => &created.name);
                        report.created = Some(created);
                        Ok(())
                    }
                    Err(error) => {
                        failed_items.insert(ItemRef::Proposed);
                        Err(error)
                    }
                },
            },
            PlanAction::CreateBackup { item, send_parent } => {
                if failed_items.contains(item)
                    || send_parent.map_or(false, |parent| failed_items.contains(&parent))
                {
                    report.skipped += 1;
                    warn!("skipping backup with failed dependency"; "item" => ?item);
                    continue;
                }
                match create_backup(ctx, store, inventory, &names, &report.created, *item, *send_parent)
                    .await
                {
                    Ok((key, stats)) => {
                        info!(
                            "uploaded backup";
                            "key" => key,
                            "bytes" => stats.bytes,
                            "parts" => stats.parts.unwrap_or(1)
                        );
                        Ok(())
                    }
                    Err(error) => {
                        failed_items.insert(*item);
                        Err(error)
                    }
                }
            }
            PlanAction::DeleteBackup { key, .. } => {
                pending_deletes.push(key.clone());
                continue;
            }
            PlanAction::DeleteSnapshot { name, .. } => {
                flush_deletes(store, &mut pending_deletes, &mut report).await;
                btrfs::delete_subvolume(&ctx.snapshot_dir.join(name))
                    .map(|()| info!("deleted expired snapshot"; "name" => name))
            }
        };

        match result {
            Ok(()) => report.succeeded += 1,
            Err(error) => {
                report.failed += 1;
                warn!("action failed"; "action" => ?action, "error" => format!("{:#}", error));
            }
        }
    }

    if !report.cancelled {
        flush_deletes(store, &mut pending_deletes, &mut report).await;
    }
    report
}

fn create_snapshot(
    ctx: &ExecuteContext<'_>,
    plan: &Plan,
    inventory: &SourceInventory,
) -> Result<CreatedSnapshot> {
    let incoming = format!("incoming-{}", Uuid::new_v4().to_simple());
    let incoming_path = ctx.snapshot_dir.join(&incoming);
    btrfs::create_snapshot(ctx.source_path, &incoming_path)?;

    let subvolume = btrfs::Subvolume::from_path(&incoming_path)
        .context("failed to read back the created snapshot")?;
    let item = Item {
        uuid: subvolume.uuid,
        parent_uuid: subvolume.parent_uuid.unwrap_or(inventory.source_uuid),
        ctime: subvolume.ctime_utc(),
        ctransid: subvolume.ctransid(),
        send_parent_uuid: None,
        presence: Presence::Local,
    };

    // The canonical name carries the send-parent the plan resolved for the
    // proposed backup.
    let send_parent = plan.actions.iter().find_map(|action| match action {
        PlanAction::CreateBackup {
            item: ItemRef::Proposed,
            send_parent,
        } => Some(*send_parent),
        _ => None,
    });
    let parent_uuid = match send_parent.flatten() {
        Some(ItemRef::Existing(uuid)) => Some(uuid),
        Some(ItemRef::Proposed) | None => None,
    };
    let canonical = metakey::encode(&canonical_meta(&item, parent_uuid, ctx.tz), &inventory.base);
    btrfs::rename_subvolume(&incoming_path, &ctx.snapshot_dir.join(&canonical))?;

    Ok(CreatedSnapshot {
        name: canonical,
        item,
    })
}

async fn create_backup<S: ObjectStore + ?Sized>(
    ctx: &ExecuteContext<'_>,
    store: &S,
    inventory: &SourceInventory,
    names: &HashMap<Uuid, String>,
    created: &Option<CreatedSnapshot>,
    item_ref: ItemRef,
    send_parent: Option<ItemRef>,
) -> Result<(String, UploadStats)> {
    let (snapshot_name, item, base) = match item_ref {
        ItemRef::Existing(uuid) => {
            let name = names
                .get(&uuid)
                .ok_or_else(|| anyhow!("snapshot {} is not present locally", uuid))?;
            (name.clone(), inventory.items[&uuid].clone(), item_base(inventory, uuid).to_string())
        }
        ItemRef::Proposed => {
            let created = created
                .as_ref()
                .ok_or_else(|| anyhow!("the proposed snapshot was not created"))?;
            (created.name.clone(), created.item.clone(), inventory.base.clone())
        }
    };

    let parent_name = match send_parent {
        None => None,
        Some(ItemRef::Existing(uuid)) => Some(
            names
                .get(&uuid)
                .ok_or_else(|| anyhow!("send-parent snapshot {} is not present locally", uuid))?
                .clone(),
        ),
        Some(ItemRef::Proposed) => Some(
            created
                .as_ref()
                .ok_or_else(|| anyhow!("the proposed send-parent was not created"))?
                .name
                .clone(),
        ),
    };
    let parent_uuid = match send_parent {
        None => None,
        Some(ItemRef::Existing(uuid)) => Some(uuid),
        Some(ItemRef::Proposed) => created.as_ref().map(|c| c.item.uuid),
    };

    let key = metakey::encode(&canonical_meta(&item, parent_uuid, ctx.tz), &base);
    let snapshot_path = ctx.snapshot_dir.join(&snapshot_name);
    let parent_path = parent_name.map(|name| ctx.snapshot_dir.join(name));

    let send = btrfs::send_command(&snapshot_path, parent_path.as_deref());
    let mut pipeline = SendPipeline::new(send, ctx.pipe_through).start()?;
    let reader = pipeline.reader();

    let mut uploader = Uploader::new(store)
        .spill_dir(ctx.spill_dir.clone())
        .cancel_flag(ctx.cancel.clone());
    if let Some(threshold) = ctx.part_threshold {
        uploader = uploader.part_threshold(threshold);
    }

    match uploader.upload(&key, reader).await {
        Err(error) => {
            pipeline.terminate().await;
            Err(error).context(format!("upload of {} failed", key))
        }
        Ok(stats) => match pipeline.wait().await {
            Ok(()) => Ok((key, stats)),
            Err(error) => {
                // The stream lied: the object was committed from a failed
                // pipeline, so it cannot be trusted to exist.
                warn!("removing object of failed pipeline"; "key" => &key);
                let _ = store.delete_objects(&[key.clone()]).await;
                Err(error.into())
            }
        },
    }
}

async fn flush_deletes<S: ObjectStore + ?Sized>(
    store: &S,
    pending: &mut Vec<String>,
    report: &mut ExecutionReport,
) {
    if pending.is_empty() {
        return;
    }
    let keys = std::mem::take(pending);
    match store.delete_objects(&keys).await {
        Ok(()) => {
            for key in &keys {
                info!("deleted expired backup"; "key" => key);
            }
            report.succeeded += keys.len();
        }
        Err(error) => {
            report.failed += keys.len();
            warn!("backup deletion failed"; "error" => format!("{:#}", error));
        }
    }
}
