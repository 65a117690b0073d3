use super::{
    metakey::{self, BackupMeta},
    Item, Presence,
};
use crate::sys::btrfs::{self, Subvolume};
use anyhow::Result;
use chrono::{DateTime, FixedOffset, Utc};
use std::{collections::BTreeMap, path::Path};
use uuid::Uuid;

/// A read-only snapshot of a configured source found in the snapshot
/// directory. `decoded` holds the metadata recovered from its filename when
/// the name parses; a snapshot with an undecodable or stale name is
/// canonicalized by rename before anything else happens in a run.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalSnapshot {
    pub name: String,
    pub uuid: Uuid,
    pub parent_uuid: Uuid,
    pub ctime: DateTime<FixedOffset>,
    pub ctransid: u64,
    pub decoded: Option<(String, BackupMeta)>,
}

impl LocalSnapshot {
    pub fn base(&self) -> Option<&str> {
        self.decoded.as_ref().map(|(base, _)| base.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    pub key: String,
    pub base: String,
    pub meta: BackupMeta,
}

/// Everything known about one source: the kernel state of the source
/// subvolume plus the merged local/remote item sets.
#[derive(Debug, Clone)]
pub struct SourceInventory {
    pub source_uuid: Uuid,
    pub source_ctransid: u64,
    pub base: String,
    pub items: BTreeMap<Uuid, Item>,
    pub local: BTreeMap<Uuid, LocalSnapshot>,
    pub remote: BTreeMap<Uuid, RemoteObject>,
}

impl SourceInventory {
    pub fn max_local_ctransid(&self) -> Option<u64> {
        self.local.values().map(|s| s.ctransid).max()
    }
}

/// Lists the snapshots of `source` under `dir`: read-only subvolumes whose
/// parent uuid is the source. Anything else in the directory is ignored.
pub fn scan_local_snapshots(dir: &Path, source: &Subvolume) -> Result<Vec<LocalSnapshot>> {
    let subvolumes = btrfs::iter_subvolumes(dir)?;
    Ok(subvolumes
        .into_iter()
        .filter(|(_, subvolume)| subvolume.read_only() && subvolume.parent_uuid == Some(source.uuid))
        .map(|(name, subvolume)| {
            let decoded = metakey::decode(&name).ok();
            LocalSnapshot {
                name,
                uuid: subvolume.uuid,
                parent_uuid: source.uuid,
                ctime: subvolume.ctime,
                ctransid: subvolume.ctransid(),
                decoded,
            }
        })
        .collect())
}

/// Decodes a bucket listing into the backup objects of `source_uuid`. Keys
/// that fail to decode belong to some other tool: they are logged and left
/// alone. Objects of other sources are silently skipped.
pub fn decode_remote_objects(keys: &[String], source_uuid: Uuid) -> Vec<RemoteObject> {
    let mut objects = Vec::new();
    for key in keys {
        match metakey::decode(key) {
            Ok((base, meta)) => {
                if meta.parent_uuid == source_uuid {
                    objects.push(RemoteObject {
                        key: key.clone(),
                        base,
                        meta,
                    });
                }
            }
            Err(error) => {
                slog_scope::warn!("ignoring unrecognized object key"; "key" => key, "reason" => %error);
            }
        }
    }
    objects
}

/// Merges local snapshots and remote objects into the resolver's item set.
/// The kernel ctime is authoritative where a snapshot exists locally; a
/// remote-only item falls back to the ctime recorded in its key.
pub fn assemble(
    source: &Subvolume,
    base: String,
    locals: Vec<LocalSnapshot>,
    remotes: Vec<RemoteObject>,
) -> SourceInventory {
    let mut items: BTreeMap<Uuid, Item> = BTreeMap::new();
    let mut local_map = BTreeMap::new();
    let mut remote_map = BTreeMap::new();

    for snapshot in locals {
        items.insert(
            snapshot.uuid,
            Item {
                uuid: snapshot.uuid,
                parent_uuid: snapshot.parent_uuid,
                ctime: snapshot.ctime.with_timezone(&Utc),
                ctransid: snapshot.ctransid,
                send_parent_uuid: snapshot
                    .decoded
                    .as_ref()
                    .and_then(|(_, meta)| meta.send_parent()),
                presence: Presence::Local,
            },
        );
        local_map.insert(snapshot.uuid, snapshot);
    }

    for object in remotes {
        let meta = &object.meta;
        match items.get_mut(&meta.uuid) {
            Some(item) => {
                item.presence = Presence::Both;
                item.send_parent_uuid = meta.send_parent();
            }
            None => {
                items.insert(
                    meta.uuid,
                    Item {
                        uuid: meta.uuid,
                        parent_uuid: meta.parent_uuid,
                        ctime: meta.ctime.with_timezone(&Utc),
                        ctransid: meta.ctransid,
                        send_parent_uuid: meta.send_parent(),
                        presence: Presence::Remote,
                    },
                );
            }
        }
        remote_map.insert(object.meta.uuid, object);
    }

    SourceInventory {
        source_uuid: source.uuid,
        source_ctransid: source.ctransid(),
        base,
        items,
        local: local_map,
        remote: remote_map,
    }
}
