use super::{
    timeframe::{Bucket, Timeframe},
    Item,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::{hash_map::Entry, BTreeMap, BTreeSet, HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

/// Identity of an item inside one resolution: an existing snapshot/backup, or
/// the single new snapshot a run may propose for the current instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ItemRef {
    Existing(Uuid),
    Proposed,
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("resolver inconsistency: {0}")]
    Inconsistent(String),
}

/// An item the policy wants to exist, with its effective timeframe position
/// (after promotion) and its send-parent. `parent == None` is a full backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeptItem {
    pub item: ItemRef,
    pub timeframe_index: usize,
    pub parent: Option<ItemRef>,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub keep: Vec<KeptItem>,
}

impl Resolution {
    pub fn kept(&self, item: ItemRef) -> Option<&KeptItem> {
        self.keep.iter().find(|k| k.item == item)
    }

    pub fn proposes_new_snapshot(&self) -> bool {
        self.kept(ItemRef::Proposed).is_some()
    }

    pub fn keep_uuids(&self) -> BTreeSet<Uuid> {
        self.keep
            .iter()
            .filter_map(|k| match k.item {
                ItemRef::Existing(uuid) => Some(uuid),
                ItemRef::Proposed => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ResolveContext<'a> {
    pub policy: &'a [(Timeframe, u32)],
    pub tz: Tz,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Nominee {
    ctime: DateTime<Utc>,
    ctransid: u64,
    item: ItemRef,
}

/// Decides which items the policy keeps at `ctx.now` and the send-parent of
/// each kept item. Pure: identical inputs produce identical output.
pub fn resolve(ctx: &ResolveContext, items: &BTreeMap<Uuid, Item>) -> Result<Resolution, ResolveError> {
    // Zero-count policy entries nominate nothing and are not a timeframe
    // position for parent assignment.
    let policy: Vec<Timeframe> = ctx
        .policy
        .iter()
        .filter(|(_, count)| *count > 0)
        .map(|(timeframe, _)| *timeframe)
        .collect();
    if policy.is_empty() {
        return Err(ResolveError::Inconsistent("policy preserves nothing".to_string()));
    }

    let windows: Vec<HashSet<Bucket>> = ctx
        .policy
        .iter()
        .filter(|(_, count)| *count > 0)
        .map(|(timeframe, count)| {
            timeframe
                .enumerate(ctx.now, *count, ctx.tz)
                .into_iter()
                .collect()
        })
        .collect();

    // One nominee per (timeframe, bucket): the earliest item of the interval.
    // Equal ctimes break by ctransid; an item pair equal in both has no
    // defensible winner and the run must stop. Items without a local snapshot
    // are never nominated: nothing can be sent from them, and their remote
    // objects are expired by the planner instead.
    let mut nominees: HashMap<(usize, Bucket), Nominee> = HashMap::new();
    for (index, timeframe) in policy.iter().enumerate() {
        for item in items.values() {
            if !item.presence.is_local() {
                continue;
            }
            let bucket = timeframe.bucket(item.ctime, ctx.tz);
            if !windows[index].contains(&bucket) {
                continue;
            }
            let candidate = Nominee {
                ctime: item.ctime,
                ctransid: item.ctransid,
                item: ItemRef::Existing(item.uuid),
            };
            match nominees.entry((index, bucket)) {
                Entry::Vacant(slot) => {
                    slot.insert(candidate);
                }
                Entry::Occupied(mut slot) => {
                    let current = slot.get_mut();
                    if current.ctime == candidate.ctime && current.ctransid == candidate.ctransid {
                        return Err(ResolveError::Inconsistent(format!(
                            "items {:?} and {:?} tie on both ctime and ctransid",
                            current.item, candidate.item
                        )));
                    }
                    if (candidate.ctime, candidate.ctransid) < (current.ctime, current.ctransid) {
                        *current = candidate;
                    }
                }
            }
        }
    }

    // A new snapshot is proposed when the interval of `now` has no backup at
    // the root timeframe or at the finest one. Its ctime will be `now`, so it
    // then also stands in for any other empty interval containing `now`.
    let root_bucket = policy[0].bucket(ctx.now, ctx.tz);
    let finest_index = policy.len() - 1;
    let finest_bucket = policy[finest_index].bucket(ctx.now, ctx.tz);
    let proposal_wanted = !nominees.contains_key(&(0, root_bucket))
        || !nominees.contains_key(&(finest_index, finest_bucket));
    if proposal_wanted {
        for (index, timeframe) in policy.iter().enumerate() {
            let bucket = timeframe.bucket(ctx.now, ctx.tz);
            nominees.entry((index, bucket)).or_insert(Nominee {
                ctime: ctx.now,
                ctransid: u64::MAX,
                item: ItemRef::Proposed,
            });
        }
    }

    // Group nominations per item; the coarsest nomination is the item's
    // starting timeframe position.
    let mut nominated: BTreeMap<ItemRef, Vec<(usize, Bucket)>> = BTreeMap::new();
    for ((index, bucket), nominee) in &nominees {
        nominated.entry(nominee.item).or_default().push((*index, *bucket));
    }

    let ctime_of = |item: ItemRef| match item {
        ItemRef::Existing(uuid) => items[&uuid].ctime,
        ItemRef::Proposed => ctx.now,
    };

    let mut keep = Vec::with_capacity(nominated.len());
    for (&item, nominations) in &nominated {
        let coarsest = nominations
            .iter()
            .map(|(index, _)| *index)
            .min()
            .expect("nomination groups are non-empty");
        let ctime = ctime_of(item);

        // Walk coarser positions until one holds a kept item; an item with no
        // coarser coverage at all is promoted to a root.
        let mut parent = None;
        let mut effective = 0;
        let mut level = coarsest;
        while level > 0 {
            let parent_bucket = policy[level - 1].bucket(ctime, ctx.tz);
            if let Some(nominee) = nominees.get(&(level - 1, parent_bucket)) {
                parent = Some(nominee.item);
                effective = level;
                break;
            }
            level -= 1;
        }

        keep.push(KeptItem {
            item,
            timeframe_index: effective,
            parent,
        });
    }

    keep.sort_unstable_by_key(|k| (k.timeframe_index, ctime_of(k.item), k.item));
    let resolution = Resolution { keep };
    verify(&resolution, &policy, ctx, &ctime_of)?;
    Ok(resolution)
}

/// Tree invariants, re-checked on the finished keep set. A failure here is a
/// bug signal, not a runtime condition.
fn verify(
    resolution: &Resolution,
    policy: &[Timeframe],
    ctx: &ResolveContext,
    ctime_of: &dyn Fn(ItemRef) -> DateTime<Utc>,
) -> Result<(), ResolveError> {
    let kept: HashSet<ItemRef> = resolution.keep.iter().map(|k| k.item).collect();
    let mut root_buckets: HashMap<Bucket, ItemRef> = HashMap::new();

    for entry in &resolution.keep {
        match entry.parent {
            None => {
                let bucket = policy[0].bucket(ctime_of(entry.item), ctx.tz);
                if let Some(previous) = root_buckets.insert(bucket, entry.item) {
                    return Err(ResolveError::Inconsistent(format!(
                        "two full backups {:?} and {:?} in one root interval",
                        previous, entry.item
                    )));
                }
            }
            Some(parent) => {
                if parent == entry.item {
                    return Err(ResolveError::Inconsistent(format!(
                        "item {:?} is its own send-parent",
                        parent
                    )));
                }
                if !kept.contains(&parent) {
                    return Err(ResolveError::Inconsistent(format!(
                        "send-parent {:?} of {:?} is not kept",
                        parent, entry.item
                    )));
                }
                let parent_entry = resolution
                    .kept(parent)
                    .expect("parent membership checked above");
                if parent_entry.timeframe_index >= entry.timeframe_index {
                    return Err(ResolveError::Inconsistent(format!(
                        "send-parent {:?} is not coarser than {:?}",
                        parent, entry.item
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Presence;
    use chrono_tz::Tz;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn tz() -> Tz {
        "UTC".parse().unwrap()
    }

    const SOURCE: &str = "8a7ae0b5-b28c-b240-8c07-0015431d58d8";
    const UUID_A: &str = "1fd11d8e-8110-4cd0-b85c-bae3dda86a3d";
    const UUID_B: &str = "2d9d3bcb-4b62-46a3-b6e2-678eeb24f54e";
    const UUID_C: &str = "3c61d287-c754-2944-a71e-ee6f0cbfb40e";

    fn item(uuid: &str, ctime: &str, ctransid: u64) -> (Uuid, Item) {
        let uuid = Uuid::parse_str(uuid).unwrap();
        (
            uuid,
            Item {
                uuid,
                parent_uuid: Uuid::parse_str(SOURCE).unwrap(),
                ctime: utc(ctime),
                ctransid,
                send_parent_uuid: None,
                presence: Presence::Both,
            },
        )
    }

    fn existing(uuid: &str) -> ItemRef {
        ItemRef::Existing(Uuid::parse_str(uuid).unwrap())
    }

    #[test]
    fn empty_inventory_proposes_one_full_backup() {
        let policy = [(Timeframe::Years, 1), (Timeframe::Days, 1)];
        let ctx = ResolveContext {
            policy: &policy,
            tz: tz(),
            now: utc("2006-01-02T00:00:01Z"),
        };
        let resolution = resolve(&ctx, &BTreeMap::new()).unwrap();
        assert_eq!(
            resolution.keep,
            vec![KeptItem {
                item: ItemRef::Proposed,
                timeframe_index: 0,
                parent: None,
            }]
        );
    }

    #[test]
    fn daily_rolls_over_and_expires_yesterday() {
        let policy = [(Timeframe::Years, 1), (Timeframe::Days, 1)];
        let ctx = ResolveContext {
            policy: &policy,
            tz: tz(),
            now: utc("2006-01-03T00:00:01Z"),
        };
        let items: BTreeMap<_, _> = vec![
            item(UUID_A, "2006-01-01T00:00:00Z", 10),
            item(UUID_B, "2006-01-02T00:00:00Z", 20),
        ]
        .into_iter()
        .collect();

        let resolution = resolve(&ctx, &items).unwrap();
        assert_eq!(resolution.keep.len(), 2);
        let yearly = resolution.kept(existing(UUID_A)).unwrap();
        assert_eq!(yearly.parent, None);
        assert_eq!(yearly.timeframe_index, 0);
        let daily = resolution.kept(ItemRef::Proposed).unwrap();
        assert_eq!(daily.parent, Some(existing(UUID_A)));
        assert_eq!(daily.timeframe_index, 1);
        // B is expired.
        assert!(resolution.kept(existing(UUID_B)).is_none());
    }

    #[test]
    fn timezone_change_expires_the_old_yearly() {
        // Y was the 2006 yearly under America/Los_Angeles; in UTC its ctime
        // falls in 2005 and the 2006 root interval is empty.
        let policy = [(Timeframe::Years, 1)];
        let ctx = ResolveContext {
            policy: &policy,
            tz: tz(),
            now: utc("2006-06-01T00:00:00Z"),
        };
        let items: BTreeMap<_, _> = vec![item(UUID_A, "2005-12-31T08:00:00Z", 5)]
            .into_iter()
            .collect();

        let resolution = resolve(&ctx, &items).unwrap();
        assert!(resolution.kept(existing(UUID_A)).is_none());
        let fresh = resolution.kept(ItemRef::Proposed).unwrap();
        assert_eq!(fresh.parent, None);
    }

    #[test]
    fn single_timeframe_policy_keeps_only_full_backups() {
        let policy = [(Timeframe::Years, 2)];
        let ctx = ResolveContext {
            policy: &policy,
            tz: tz(),
            now: utc("2006-06-01T00:00:00Z"),
        };
        let items: BTreeMap<_, _> = vec![
            item(UUID_A, "2005-03-01T00:00:00Z", 5),
            item(UUID_B, "2006-01-01T00:00:00Z", 10),
        ]
        .into_iter()
        .collect();

        let resolution = resolve(&ctx, &items).unwrap();
        assert_eq!(resolution.keep.len(), 2);
        assert!(resolution.keep.iter().all(|k| k.parent.is_none()));
    }

    #[test]
    fn earliest_item_of_the_interval_wins() {
        let policy = [(Timeframe::Years, 1)];
        let ctx = ResolveContext {
            policy: &policy,
            tz: tz(),
            now: utc("2006-06-01T00:00:00Z"),
        };
        let items: BTreeMap<_, _> = vec![
            item(UUID_B, "2006-01-05T00:00:00Z", 20),
            item(UUID_A, "2006-01-01T00:00:00Z", 10),
        ]
        .into_iter()
        .collect();

        let resolution = resolve(&ctx, &items).unwrap();
        assert_eq!(resolution.keep.len(), 1);
        assert_eq!(resolution.keep[0].item, existing(UUID_A));
    }

    #[test]
    fn equal_ctime_breaks_by_ctransid() {
        let policy = [(Timeframe::Years, 1)];
        let ctx = ResolveContext {
            policy: &policy,
            tz: tz(),
            now: utc("2006-06-01T00:00:00Z"),
        };
        let items: BTreeMap<_, _> = vec![
            item(UUID_B, "2006-01-01T00:00:00Z", 20),
            item(UUID_A, "2006-01-01T00:00:00Z", 10),
        ]
        .into_iter()
        .collect();

        let resolution = resolve(&ctx, &items).unwrap();
        assert_eq!(resolution.keep[0].item, existing(UUID_A));
    }

    #[test]
    fn full_tie_is_an_inconsistency_not_a_pick() {
        let policy = [(Timeframe::Years, 1)];
        let ctx = ResolveContext {
            policy: &policy,
            tz: tz(),
            now: utc("2006-06-01T00:00:00Z"),
        };
        let items: BTreeMap<_, _> = vec![
            item(UUID_A, "2006-01-01T00:00:00Z", 10),
            item(UUID_B, "2006-01-01T00:00:00Z", 10),
        ]
        .into_iter()
        .collect();

        assert!(matches!(resolve(&ctx, &items), Err(ResolveError::Inconsistent(_))));
    }

    #[test]
    fn orphaned_finer_item_promotes_to_root() {
        // A daily whose year interval left the window becomes a root rather
        // than referencing an unkept parent.
        let policy = [(Timeframe::Years, 1), (Timeframe::Days, 3)];
        let ctx = ResolveContext {
            policy: &policy,
            tz: tz(),
            now: utc("2006-01-01T12:00:00Z"),
        };
        // Day window covers Dec 30, Dec 31, Jan 1. The Dec 31 item's year
        // interval (2005) is outside the one-year root window {2006}.
        let items: BTreeMap<_, _> = vec![item(UUID_A, "2005-12-31T06:00:00Z", 5)]
            .into_iter()
            .collect();

        let resolution = resolve(&ctx, &items).unwrap();
        let daily = resolution.kept(existing(UUID_A)).unwrap();
        assert_eq!(daily.parent, None);
        assert_eq!(daily.timeframe_index, 0);
    }

    #[test]
    fn three_level_policy_chains_parents() {
        let policy = [(Timeframe::Years, 1), (Timeframe::Months, 2), (Timeframe::Days, 2)];
        let ctx = ResolveContext {
            policy: &policy,
            tz: tz(),
            now: utc("2006-02-10T12:00:00Z"),
        };
        let items: BTreeMap<_, _> = vec![
            item(UUID_A, "2006-01-01T00:00:00Z", 10), // yearly root, also january monthly
            item(UUID_B, "2006-02-01T00:00:00Z", 20), // february monthly
            item(UUID_C, "2006-02-09T00:00:00Z", 30), // daily under february
        ]
        .into_iter()
        .collect();

        let resolution = resolve(&ctx, &items).unwrap();
        let yearly = resolution.kept(existing(UUID_A)).unwrap();
        assert_eq!(yearly.parent, None);
        let monthly = resolution.kept(existing(UUID_B)).unwrap();
        assert_eq!(monthly.parent, Some(existing(UUID_A)));
        assert_eq!(monthly.timeframe_index, 1);
        let daily = resolution.kept(existing(UUID_C)).unwrap();
        assert_eq!(daily.parent, Some(existing(UUID_B)));
        assert_eq!(daily.timeframe_index, 2);
    }

    #[test]
    fn resolution_is_deterministic() {
        let policy = [(Timeframe::Years, 2), (Timeframe::Days, 3)];
        let ctx = ResolveContext {
            policy: &policy,
            tz: tz(),
            now: utc("2006-01-03T00:00:01Z"),
        };
        let items: BTreeMap<_, _> = vec![
            item(UUID_A, "2006-01-01T00:00:00Z", 10),
            item(UUID_B, "2006-01-02T00:00:00Z", 20),
            item(UUID_C, "2005-07-04T00:00:00Z", 5),
        ]
        .into_iter()
        .collect();

        let first = resolve(&ctx, &items).unwrap();
        let second = resolve(&ctx, &items).unwrap();
        assert_eq!(first.keep, second.keep);
    }

    #[test]
    fn remote_only_items_are_never_kept() {
        let policy = [(Timeframe::Years, 1)];
        let ctx = ResolveContext {
            policy: &policy,
            tz: tz(),
            now: utc("2006-06-01T00:00:00Z"),
        };
        let (uuid, mut orphan) = item(UUID_A, "2006-01-01T00:00:00Z", 10);
        orphan.presence = Presence::Remote;
        let items: BTreeMap<_, _> = vec![(uuid, orphan)].into_iter().collect();

        let resolution = resolve(&ctx, &items).unwrap();
        assert!(resolution.kept(existing(UUID_A)).is_none());
        // The empty root interval is refilled from a fresh snapshot.
        assert!(resolution.proposes_new_snapshot());
    }

    #[test]
    fn second_run_with_no_change_keeps_everything() {
        let policy = [(Timeframe::Years, 1), (Timeframe::Days, 1)];
        let now = utc("2006-01-02T00:10:00Z");
        let ctx = ResolveContext {
            policy: &policy,
            tz: tz(),
            now,
        };
        let items: BTreeMap<_, _> = vec![
            item(UUID_A, "2006-01-01T00:00:00Z", 10),
            item(UUID_B, "2006-01-02T00:00:00Z", 20),
        ]
        .into_iter()
        .collect();

        let resolution = resolve(&ctx, &items).unwrap();
        assert!(!resolution.proposes_new_snapshot());
        assert_eq!(resolution.keep_uuids().len(), 2);
    }
}
