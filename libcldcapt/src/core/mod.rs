pub mod executor;
pub mod inventory;
pub mod metakey;
pub mod pipeline;
pub mod planner;
pub mod resolver;
pub mod timeframe;
pub mod upload;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Where an item currently exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Local,
    Remote,
    Both,
}

impl Presence {
    pub fn is_local(self) -> bool {
        matches!(self, Presence::Local | Presence::Both)
    }

    pub fn is_remote(self) -> bool {
        matches!(self, Presence::Remote | Presence::Both)
    }
}

/// One logical snapshot/backup pair as the resolver sees it. In steady state
/// snapshots and backup objects correspond 1:1 by `uuid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub uuid: Uuid,
    pub parent_uuid: Uuid,
    pub ctime: DateTime<Utc>,
    pub ctransid: u64,
    pub send_parent_uuid: Option<Uuid>,
    pub presence: Presence,
}
