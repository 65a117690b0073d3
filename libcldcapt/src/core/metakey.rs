use chrono::{DateTime, FixedOffset, SecondsFormat};
use thiserror::Error;
use uuid::Uuid;

pub const METADATA_VERSION: u16 = 1;
pub const SEQUENCE_NUMBER: u32 = 0;

/// Per-backup metadata carried entirely inside the object key (and the
/// snapshot filename), so the whole remote state reconstructs from a single
/// bucket listing. A nil `send_parent_uuid` marks a full backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupMeta {
    pub ctime: DateTime<FixedOffset>,
    pub ctransid: u64,
    pub uuid: Uuid,
    pub send_parent_uuid: Uuid,
    pub parent_uuid: Uuid,
    pub version: u16,
    pub sequence: u32,
}

impl BackupMeta {
    pub fn is_full(&self) -> bool {
        self.send_parent_uuid.is_nil()
    }

    pub fn send_parent(&self) -> Option<Uuid> {
        if self.send_parent_uuid.is_nil() {
            None
        } else {
            Some(self.send_parent_uuid)
        }
    }
}

#[derive(Error, Debug)]
pub enum MetaKeyError {
    #[error("malformed object key: {0}")]
    Malformed(String),
    #[error("unsupported metadata version {0}")]
    UnsupportedVersion(u16),
    #[error("unsupported sequence number {0}")]
    UnsupportedSequence(u32),
}

/// Produces the canonical key for `meta` under the user-chosen `base`.
/// Total: every metadata value has exactly one period-free token form.
pub fn encode(meta: &BackupMeta, base: &str) -> String {
    format!(
        "{}.ctim{}.ctid{}.uuid{}.sndp{}.prnt{}.mdvn{}.seqn{}",
        base,
        meta.ctime.to_rfc3339_opts(SecondsFormat::Secs, false),
        meta.ctransid,
        meta.uuid.to_hyphenated(),
        meta.send_parent_uuid.to_hyphenated(),
        meta.parent_uuid.to_hyphenated(),
        meta.version,
        meta.sequence,
    )
}

/// Inverse of [`encode`]. Period-delimited tokens dispatch on their
/// four-character prefix; unrecognized tokens (the leading base included)
/// fold back into the returned base in order.
pub fn decode(key: &str) -> Result<(String, BackupMeta), MetaKeyError> {
    let mut base_tokens: Vec<&str> = Vec::new();
    let mut ctime = None;
    let mut ctransid = None;
    let mut uuid = None;
    let mut send_parent_uuid = None;
    let mut parent_uuid = None;
    let mut version = None;
    let mut sequence = None;

    for token in key.split('.') {
        let (tag, value) = match token.get(..4) {
            Some(tag) => (tag, &token[4..]),
            None => ("", token),
        };
        let slot: &mut Option<_> = match tag {
            "ctim" => {
                set_once(&mut ctime, parse_ctime(value)?, token)?;
                continue;
            }
            "ctid" => {
                set_once(&mut ctransid, parse_number::<u64>(value, token)?, token)?;
                continue;
            }
            "uuid" => &mut uuid,
            "sndp" => &mut send_parent_uuid,
            "prnt" => &mut parent_uuid,
            "mdvn" => {
                set_once(&mut version, parse_number::<u16>(value, token)?, token)?;
                continue;
            }
            "seqn" => {
                set_once(&mut sequence, parse_number::<u32>(value, token)?, token)?;
                continue;
            }
            _ => {
                base_tokens.push(token);
                continue;
            }
        };
        set_once(slot, parse_token_uuid(value, token)?, token)?;
    }

    let meta = BackupMeta {
        ctime: required(ctime, "ctim")?,
        ctransid: required(ctransid, "ctid")?,
        uuid: required(uuid, "uuid")?,
        send_parent_uuid: required(send_parent_uuid, "sndp")?,
        parent_uuid: required(parent_uuid, "prnt")?,
        version: required(version, "mdvn")?,
        sequence: required(sequence, "seqn")?,
    };
    if meta.version != METADATA_VERSION {
        return Err(MetaKeyError::UnsupportedVersion(meta.version));
    }
    if meta.sequence != SEQUENCE_NUMBER {
        return Err(MetaKeyError::UnsupportedSequence(meta.sequence));
    }
    Ok((base_tokens.join("."), meta))
}

fn set_once<T>(slot: &mut Option<T>, value: T, token: &str) -> Result<(), MetaKeyError> {
    if slot.is_some() {
        return Err(MetaKeyError::Malformed(format!("duplicate token '{}'", token)));
    }
    *slot = Some(value);
    Ok(())
}

fn required<T>(slot: Option<T>, tag: &str) -> Result<T, MetaKeyError> {
    slot.ok_or_else(|| MetaKeyError::Malformed(format!("missing required token '{}'", tag)))
}

fn parse_ctime(value: &str) -> Result<DateTime<FixedOffset>, MetaKeyError> {
    DateTime::parse_from_rfc3339(value)
        .map_err(|_| MetaKeyError::Malformed(format!("invalid timestamp '{}'", value)))
}

fn parse_number<T: std::str::FromStr>(value: &str, token: &str) -> Result<T, MetaKeyError> {
    value
        .parse()
        .map_err(|_| MetaKeyError::Malformed(format!("invalid number in token '{}'", token)))
}

fn parse_token_uuid(value: &str, token: &str) -> Result<Uuid, MetaKeyError> {
    // Only the canonical hyphenated form is valid in a key.
    if value.len() != 36 {
        return Err(MetaKeyError::Malformed(format!("invalid uuid in token '{}'", token)));
    }
    Uuid::parse_str(value).map_err(|_| MetaKeyError::Malformed(format!("invalid uuid in token '{}'", token)))
}
