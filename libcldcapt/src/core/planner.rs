use super::{
    inventory::SourceInventory,
    metakey::{self, BackupMeta, METADATA_VERSION, SEQUENCE_NUMBER},
    resolver::{ItemRef, Resolution},
    Item,
};
use chrono::Offset;
use chrono_tz::Tz;
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

/// One step of a run, in the order the executor applies them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    RenameSnapshot { uuid: Uuid, from: String, to: String },
    CreateSnapshot,
    CreateBackup { item: ItemRef, send_parent: Option<ItemRef> },
    DeleteBackup { uuid: Uuid, key: String },
    DeleteSnapshot { uuid: Uuid, name: String },
}

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("plan assertion failed: {0}")]
    Assertion(String),
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub actions: Vec<PlanAction>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PlanContext<'a> {
    pub tz: Tz,
    /// Uuids other uploads of the same source still keep: their snapshots
    /// are shared and must survive this plan.
    pub shared_keep: &'a BTreeSet<Uuid>,
    /// Only one plan per source canonicalizes filenames; concurrent uploads
    /// could otherwise disagree on the send-parent token.
    pub names_authoritative: bool,
}

/// The canonical metadata of an item: its kernel attributes plus the resolved
/// send-parent, with ctime rendered on the wall clock of `tz`.
pub fn canonical_meta(item: &Item, send_parent: Option<Uuid>, tz: Tz) -> BackupMeta {
    let local = item.ctime.with_timezone(&tz);
    let ctime = item.ctime.with_timezone(&local.offset().fix());
    BackupMeta {
        ctime,
        ctransid: item.ctransid,
        uuid: item.uuid,
        send_parent_uuid: send_parent.unwrap_or_else(Uuid::nil),
        parent_uuid: item.parent_uuid,
        version: METADATA_VERSION,
        sequence: SEQUENCE_NUMBER,
    }
}

/// The user base an item's names carry: recovered from the existing snapshot
/// or object naming where possible, the source default otherwise.
pub fn item_base<'a>(inventory: &'a SourceInventory, uuid: Uuid) -> &'a str {
    inventory
        .local
        .get(&uuid)
        .and_then(|local| local.base())
        .or_else(|| inventory.remote.get(&uuid).map(|object| object.base.as_str()))
        .unwrap_or(&inventory.base)
}

fn existing_parent(parent: Option<ItemRef>) -> Result<Option<Uuid>, PlanError> {
    match parent {
        None => Ok(None),
        Some(ItemRef::Existing(uuid)) => Ok(Some(uuid)),
        Some(ItemRef::Proposed) => Err(PlanError::Assertion(
            "an existing item resolved to the proposed snapshot as send-parent".to_string(),
        )),
    }
}

/// Diffs the resolution against the inventory into the ordered action list:
/// canonicalizing renames, snapshot creation, backup creation in
/// parent-topological order, then expired backups and snapshots. The plan is
/// simulated before it is returned.
pub fn build_plan(
    inventory: &SourceInventory,
    resolution: &Resolution,
    ctx: &PlanContext,
) -> Result<Plan, PlanError> {
    let keep_uuids = resolution.keep_uuids();
    let mut actions = Vec::new();

    if ctx.names_authoritative {
        for kept in &resolution.keep {
            let uuid = match kept.item {
                ItemRef::Existing(uuid) => uuid,
                ItemRef::Proposed => continue,
            };
            let local = match inventory.local.get(&uuid) {
                Some(local) => local,
                None => continue,
            };
            let meta = canonical_meta(&inventory.items[&uuid], existing_parent(kept.parent)?, ctx.tz);
            let canonical = metakey::encode(&meta, item_base(inventory, uuid));
            if local.name != canonical {
                actions.push(PlanAction::RenameSnapshot {
                    uuid,
                    from: local.name.clone(),
                    to: canonical,
                });
            }
        }
    }

    // A fresh snapshot is pointless while the source has not changed since
    // the newest existing one.
    let create_snapshot = resolution.proposes_new_snapshot()
        && inventory
            .max_local_ctransid()
            .map_or(true, |max| inventory.source_ctransid > max);
    if create_snapshot {
        actions.push(PlanAction::CreateSnapshot);
    }

    // resolution.keep is ordered coarsest-first, which is exactly the
    // parent-before-child order backup creation needs.
    for kept in &resolution.keep {
        let wanted = match kept.item {
            ItemRef::Existing(uuid) => {
                let item = &inventory.items[&uuid];
                item.presence.is_local() && !item.presence.is_remote()
            }
            ItemRef::Proposed => create_snapshot,
        };
        if wanted {
            actions.push(PlanAction::CreateBackup {
                item: kept.item,
                send_parent: kept.parent,
            });
        }
    }

    for (uuid, object) in &inventory.remote {
        if !keep_uuids.contains(uuid) {
            actions.push(PlanAction::DeleteBackup {
                uuid: *uuid,
                key: object.key.clone(),
            });
        }
    }

    for (uuid, local) in &inventory.local {
        if !keep_uuids.contains(uuid) && !ctx.shared_keep.contains(uuid) {
            actions.push(PlanAction::DeleteSnapshot {
                uuid: *uuid,
                name: local.name.clone(),
            });
        }
    }

    validate(&actions, inventory, resolution, ctx, create_snapshot)?;
    Ok(Plan { actions })
}

/// Replays the plan against a simulated inventory: the result must be exactly
/// the resolved keep set, and no backup may ever reference a send-parent that
/// is not in the remote at that point.
fn validate(
    actions: &[PlanAction],
    inventory: &SourceInventory,
    resolution: &Resolution,
    ctx: &PlanContext,
    create_snapshot: bool,
) -> Result<(), PlanError> {
    let assertion = |message: String| Err(PlanError::Assertion(message));

    let mut local: HashSet<ItemRef> = inventory
        .items
        .values()
        .filter(|item| item.presence.is_local())
        .map(|item| ItemRef::Existing(item.uuid))
        .collect();
    let mut remote: HashSet<ItemRef> = inventory
        .items
        .values()
        .filter(|item| item.presence.is_remote())
        .map(|item| ItemRef::Existing(item.uuid))
        .collect();
    let mut names: HashMap<Uuid, String> = inventory
        .local
        .iter()
        .map(|(uuid, snapshot)| (*uuid, snapshot.name.clone()))
        .collect();

    for action in actions {
        match action {
            PlanAction::RenameSnapshot { uuid, from, to } => {
                if names.get(uuid) != Some(from) {
                    return assertion(format!("rename of {} from a name it does not have", uuid));
                }
                names.insert(*uuid, to.clone());
            }
            PlanAction::CreateSnapshot => {
                if !local.insert(ItemRef::Proposed) {
                    return assertion("more than one snapshot creation in a plan".to_string());
                }
            }
            PlanAction::CreateBackup { item, send_parent } => {
                if !local.contains(item) {
                    return assertion(format!("backup of {:?} which has no local snapshot", item));
                }
                if let Some(parent) = send_parent {
                    if !remote.contains(parent) {
                        return assertion(format!(
                            "backup of {:?} references send-parent {:?} missing from the remote",
                            item, parent
                        ));
                    }
                }
                if !remote.insert(*item) {
                    return assertion(format!("duplicate backup of {:?}", item));
                }
            }
            PlanAction::DeleteBackup { uuid, .. } => {
                remote.remove(&ItemRef::Existing(*uuid));
            }
            PlanAction::DeleteSnapshot { uuid, .. } => {
                local.remove(&ItemRef::Existing(*uuid));
            }
        }
    }

    let expected: HashSet<ItemRef> = resolution
        .keep
        .iter()
        .map(|kept| kept.item)
        .filter(|item| *item != ItemRef::Proposed || create_snapshot)
        .collect();

    if remote != expected {
        return assertion("plan does not converge the remote to the keep set".to_string());
    }

    let shared_extras: HashSet<ItemRef> = inventory
        .local
        .keys()
        .filter(|uuid| ctx.shared_keep.contains(uuid) && !expected.contains(&ItemRef::Existing(**uuid)))
        .map(|uuid| ItemRef::Existing(*uuid))
        .collect();
    let expected_local: HashSet<ItemRef> = expected.union(&shared_extras).copied().collect();
    if local != expected_local {
        return assertion("plan does not converge the snapshot directory to the keep set".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        inventory::{assemble, LocalSnapshot, RemoteObject},
        resolver::{resolve, ResolveContext},
        timeframe::Timeframe,
    };
    use crate::sys::btrfs::Subvolume;
    use chrono::{DateTime, Utc};
    use chrono_tz::Tz;

    const SOURCE: &str = "8a7ae0b5-b28c-b240-8c07-0015431d58d8";
    const UUID_A: &str = "1fd11d8e-8110-4cd0-b85c-bae3dda86a3d";
    const UUID_B: &str = "2d9d3bcb-4b62-46a3-b6e2-678eeb24f54e";

    fn tz() -> Tz {
        "UTC".parse().unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn source(ctransid: u64) -> Subvolume {
        Subvolume {
            name: "home".to_string(),
            uuid: Uuid::parse_str(SOURCE).unwrap(),
            parent_uuid: None,
            received_uuid: None,
            ctime: DateTime::parse_from_rfc3339("2005-06-01T00:00:00+00:00").unwrap(),
            generation: ctransid,
            flags: None,
        }
    }

    fn meta(uuid: &str, ctime: &str, ctransid: u64, send_parent: Option<&str>) -> BackupMeta {
        BackupMeta {
            ctime: DateTime::parse_from_rfc3339(ctime).unwrap(),
            ctransid,
            uuid: Uuid::parse_str(uuid).unwrap(),
            send_parent_uuid: send_parent
                .map(|s| Uuid::parse_str(s).unwrap())
                .unwrap_or_else(Uuid::nil),
            parent_uuid: Uuid::parse_str(SOURCE).unwrap(),
            version: METADATA_VERSION,
            sequence: SEQUENCE_NUMBER,
        }
    }

    fn canonical_local(meta: &BackupMeta) -> LocalSnapshot {
        LocalSnapshot {
            name: metakey::encode(meta, "home"),
            uuid: meta.uuid,
            parent_uuid: meta.parent_uuid,
            ctime: meta.ctime,
            ctransid: meta.ctransid,
            decoded: Some(("home".to_string(), meta.clone())),
        }
    }

    fn remote_of(meta: &BackupMeta) -> RemoteObject {
        RemoteObject {
            key: metakey::encode(meta, "home"),
            base: "home".to_string(),
            meta: meta.clone(),
        }
    }

    fn plan_ctx(shared: &BTreeSet<Uuid>) -> PlanContext {
        PlanContext {
            tz: tz(),
            shared_keep: shared,
            names_authoritative: true,
        }
    }

    fn plan_for(
        source_ctransid: u64,
        locals: Vec<LocalSnapshot>,
        remotes: Vec<RemoteObject>,
        policy: &[(Timeframe, u32)],
        now: &str,
    ) -> Plan {
        let inventory = assemble(&source(source_ctransid), "home".to_string(), locals, remotes);
        let resolution = resolve(
            &ResolveContext {
                policy,
                tz: tz(),
                now: utc(now),
            },
            &inventory.items,
        )
        .unwrap();
        let shared = BTreeSet::new();
        build_plan(&inventory, &resolution, &plan_ctx(&shared)).unwrap()
    }

    #[test]
    fn first_run_on_empty_state_creates_and_uploads() {
        let policy = [(Timeframe::Years, 1), (Timeframe::Days, 1)];
        let plan = plan_for(10, vec![], vec![], &policy, "2006-01-02T00:00:01Z");
        assert_eq!(
            plan.actions,
            vec![
                PlanAction::CreateSnapshot,
                PlanAction::CreateBackup {
                    item: ItemRef::Proposed,
                    send_parent: None,
                },
            ]
        );
    }

    #[test]
    fn daily_rollover_expires_yesterdays_differential() {
        let policy = [(Timeframe::Years, 1), (Timeframe::Days, 1)];
        let meta_a = meta(UUID_A, "2006-01-01T00:00:00+00:00", 10, None);
        let meta_b = meta(UUID_B, "2006-01-02T00:00:00+00:00", 20, Some(UUID_A));
        let plan = plan_for(
            30,
            vec![canonical_local(&meta_a), canonical_local(&meta_b)],
            vec![remote_of(&meta_a), remote_of(&meta_b)],
            &policy,
            "2006-01-03T00:00:01Z",
        );
        assert_eq!(
            plan.actions,
            vec![
                PlanAction::CreateSnapshot,
                PlanAction::CreateBackup {
                    item: ItemRef::Proposed,
                    send_parent: Some(ItemRef::Existing(Uuid::parse_str(UUID_A).unwrap())),
                },
                PlanAction::DeleteBackup {
                    uuid: Uuid::parse_str(UUID_B).unwrap(),
                    key: metakey::encode(&meta_b, "home"),
                },
                PlanAction::DeleteSnapshot {
                    uuid: Uuid::parse_str(UUID_B).unwrap(),
                    name: metakey::encode(&meta_b, "home"),
                },
            ]
        );
    }

    #[test]
    fn timezone_change_replaces_the_yearly() {
        // The old yearly was taken under another timezone; in UTC it belongs
        // to 2005 and the 2006 interval must be refilled.
        let policy = [(Timeframe::Years, 1)];
        let meta_y = meta(UUID_A, "2005-12-31T08:00:00+00:00", 5, None);
        let plan = plan_for(
            30,
            vec![canonical_local(&meta_y)],
            vec![remote_of(&meta_y)],
            &policy,
            "2006-06-01T00:00:00Z",
        );
        assert_eq!(
            plan.actions,
            vec![
                PlanAction::CreateSnapshot,
                PlanAction::CreateBackup {
                    item: ItemRef::Proposed,
                    send_parent: None,
                },
                PlanAction::DeleteBackup {
                    uuid: Uuid::parse_str(UUID_A).unwrap(),
                    key: metakey::encode(&meta_y, "home"),
                },
                PlanAction::DeleteSnapshot {
                    uuid: Uuid::parse_str(UUID_A).unwrap(),
                    name: metakey::encode(&meta_y, "home"),
                },
            ]
        );
    }

    #[test]
    fn unchanged_source_elides_snapshot_creation() {
        // Source ctransid has not advanced past the newest snapshot: nothing
        // to do even though the daily interval of `now` is empty.
        let policy = [(Timeframe::Years, 1), (Timeframe::Days, 1)];
        let meta_a = meta(UUID_A, "2006-01-01T00:00:00+00:00", 10, None);
        let plan = plan_for(
            10,
            vec![canonical_local(&meta_a)],
            vec![remote_of(&meta_a)],
            &policy,
            "2006-01-02T00:00:01Z",
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn local_without_remote_yields_one_backup() {
        let policy = [(Timeframe::Years, 1)];
        let meta_a = meta(UUID_A, "2006-01-01T00:00:00+00:00", 10, None);
        let plan = plan_for(
            10,
            vec![canonical_local(&meta_a)],
            vec![],
            &policy,
            "2006-06-01T00:00:00Z",
        );
        assert_eq!(
            plan.actions,
            vec![PlanAction::CreateBackup {
                item: ItemRef::Existing(Uuid::parse_str(UUID_A).unwrap()),
                send_parent: None,
            }]
        );
    }

    #[test]
    fn remote_without_local_yields_delete_backup_only() {
        let policy = [(Timeframe::Years, 1), (Timeframe::Days, 1)];
        let meta_a = meta(UUID_A, "2006-01-01T00:00:00+00:00", 10, None);
        let meta_b = meta(UUID_B, "2006-01-02T00:00:00+00:00", 20, Some(UUID_A));
        // Source unchanged since A, so the empty daily interval stays empty
        // and the only repair is expiring the orphaned object.
        let plan = plan_for(
            10,
            vec![canonical_local(&meta_a)],
            vec![remote_of(&meta_a), remote_of(&meta_b)],
            &policy,
            "2006-01-02T00:10:00Z",
        );
        assert_eq!(
            plan.actions,
            vec![PlanAction::DeleteBackup {
                uuid: Uuid::parse_str(UUID_B).unwrap(),
                key: metakey::encode(&meta_b, "home"),
            }]
        );
    }

    #[test]
    fn stale_names_are_canonicalized_first() {
        let policy = [(Timeframe::Years, 1)];
        let meta_a = meta(UUID_A, "2006-01-01T00:00:00+00:00", 10, None);
        let mut stale = canonical_local(&meta_a);
        stale.name = "home-2006-01-01".to_string();
        stale.decoded = None;
        let plan = plan_for(
            10,
            vec![stale],
            vec![remote_of(&meta_a)],
            &policy,
            "2006-06-01T00:00:00Z",
        );
        assert_eq!(
            plan.actions,
            vec![PlanAction::RenameSnapshot {
                uuid: Uuid::parse_str(UUID_A).unwrap(),
                from: "home-2006-01-01".to_string(),
                to: metakey::encode(&meta_a, "home"),
            }]
        );
    }

    #[test]
    fn converged_state_plans_nothing() {
        let policy = [(Timeframe::Years, 1), (Timeframe::Days, 1)];
        let meta_a = meta(UUID_A, "2006-01-01T00:00:00+00:00", 10, None);
        let meta_b = meta(UUID_B, "2006-01-02T00:00:00+00:00", 20, Some(UUID_A));
        let plan = plan_for(
            20,
            vec![canonical_local(&meta_a), canonical_local(&meta_b)],
            vec![remote_of(&meta_a), remote_of(&meta_b)],
            &policy,
            "2006-01-02T00:10:00Z",
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn shared_keep_suppresses_snapshot_deletion() {
        let policy = [(Timeframe::Years, 1)];
        let meta_a = meta(UUID_A, "2006-01-01T00:00:00+00:00", 10, None);
        let meta_b = meta(UUID_B, "2006-01-02T00:00:00+00:00", 20, Some(UUID_A));
        let inventory = assemble(
            &source(20),
            "home".to_string(),
            vec![canonical_local(&meta_a), canonical_local(&meta_b)],
            vec![remote_of(&meta_a), remote_of(&meta_b)],
        );
        let resolution = resolve(
            &ResolveContext {
                policy: &policy,
                tz: tz(),
                now: utc("2006-06-01T00:00:00Z"),
            },
            &inventory.items,
        )
        .unwrap();
        let shared: BTreeSet<Uuid> = vec![Uuid::parse_str(UUID_B).unwrap()].into_iter().collect();
        let plan = build_plan(&inventory, &resolution, &plan_ctx(&shared)).unwrap();
        // B's backup in this remote expires, but the snapshot belongs to
        // another upload's keep set and stays.
        assert_eq!(
            plan.actions,
            vec![PlanAction::DeleteBackup {
                uuid: Uuid::parse_str(UUID_B).unwrap(),
                key: metakey::encode(&meta_b, "home"),
            }]
        );
    }

    #[test]
    fn validation_rejects_backup_with_missing_parent() {
        let meta_a = meta(UUID_A, "2006-01-01T00:00:00+00:00", 10, None);
        let inventory = assemble(
            &source(10),
            "home".to_string(),
            vec![canonical_local(&meta_a)],
            vec![],
        );
        let resolution = resolve(
            &ResolveContext {
                policy: &[(Timeframe::Years, 1)],
                tz: tz(),
                now: utc("2006-06-01T00:00:00Z"),
            },
            &inventory.items,
        )
        .unwrap();
        // Hand-build a plan that backs A up as a differential from an object
        // that is not in the remote.
        let actions = vec![PlanAction::CreateBackup {
            item: ItemRef::Existing(Uuid::parse_str(UUID_A).unwrap()),
            send_parent: Some(ItemRef::Existing(Uuid::parse_str(UUID_B).unwrap())),
        }];
        let shared = BTreeSet::new();
        assert!(validate(&actions, &inventory, &resolution, &plan_ctx(&shared), false).is_err());
    }

    #[test]
    fn validation_rejects_a_plan_that_leaves_expired_state() {
        let meta_a = meta(UUID_A, "2006-01-01T00:00:00+00:00", 10, None);
        let inventory = assemble(
            &source(10),
            "home".to_string(),
            vec![canonical_local(&meta_a)],
            vec![remote_of(&meta_a)],
        );
        // Resolution that keeps nothing (the item is out of the window).
        let resolution = resolve(
            &ResolveContext {
                policy: &[(Timeframe::Years, 1)],
                tz: tz(),
                now: utc("2007-06-01T00:00:00Z"),
            },
            &inventory.items,
        )
        .unwrap();
        let actions: Vec<PlanAction> = vec![];
        let shared = BTreeSet::new();
        assert!(validate(&actions, &inventory, &resolution, &plan_ctx(&shared), false).is_err());
    }

    #[test]
    fn presence_mixture_converges_in_one_plan() {
        // A local-only daily, a remote-only orphan, and a converged yearly in
        // one inventory: rename nothing, back up the daily, expire the
        // orphan's object.
        let policy = [(Timeframe::Years, 1), (Timeframe::Days, 2)];
        let meta_a = meta(UUID_A, "2006-01-01T00:00:00+00:00", 10, None);
        let meta_b = meta(UUID_B, "2006-01-02T00:00:00+00:00", 20, Some(UUID_A));
        const UUID_C: &str = "3c61d287-c754-2944-a71e-ee6f0cbfb40e";
        let meta_c = meta(UUID_C, "2006-01-01T12:00:00+00:00", 15, Some(UUID_A));
        let plan = plan_for(
            20,
            vec![canonical_local(&meta_a), canonical_local(&meta_b)],
            vec![remote_of(&meta_a), remote_of(&meta_c)],
            &policy,
            "2006-01-02T06:00:00Z",
        );
        assert_eq!(
            plan.actions,
            vec![
                PlanAction::CreateBackup {
                    item: ItemRef::Existing(Uuid::parse_str(UUID_B).unwrap()),
                    send_parent: Some(ItemRef::Existing(Uuid::parse_str(UUID_A).unwrap())),
                },
                PlanAction::DeleteBackup {
                    uuid: Uuid::parse_str(UUID_C).unwrap(),
                    key: metakey::encode(&meta_c, "home"),
                },
            ]
        );
    }
}
