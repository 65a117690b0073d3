use crate::parsing::{parse_key_value_pair_lines, StringPair};
#[mockall_double::double]
use self::double as btrfs_double;
use anyhow::{bail, Context as _, Result};
use btrfs_double::run_btrfs;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Deserializer};
use std::{ffi::OsString, fs, path::Path};
use uuid::Uuid;

/// The single place the `btrfs` binary is invoked; everything above it only
/// builds argument vectors and parses output. Mocked in tests.
#[cfg_attr(test, mockall::automock)]
pub mod double {
    use super::*;
    use std::process::{Command, Stdio};

    pub fn run_btrfs(args: Vec<OsString>) -> Result<String> {
        let output = Command::new("btrfs")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .context("failed to run the btrfs binary")?;
        if !output.status.success() {
            let status = match output.status.code() {
                Some(code) => format!("exit code {}", code),
                None => String::from("a signal"),
            };
            match String::from_utf8_lossy(&output.stderr).trim() {
                "" => bail!("btrfs failed with {}", status),
                stderr => bail!("btrfs failed with {}: {}", status, stderr),
            }
        }
        String::from_utf8(output.stdout).context("btrfs produced non-utf8 output")
    }
}

/// Kernel-reported state of a single subvolume as printed by
/// `btrfs subvolume show`. `generation` is the subvolume transaction id at the
/// last change; for a read-only snapshot it is fixed at creation.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Subvolume {
    pub name: String,
    pub uuid: Uuid,
    #[serde(rename = "parent uuid")]
    pub parent_uuid: Option<Uuid>,
    #[serde(rename = "received uuid")]
    pub received_uuid: Option<Uuid>,
    #[serde(rename = "creation time", deserialize_with = "deserialize_btrfs_datetime")]
    pub ctime: DateTime<FixedOffset>,
    pub generation: u64,
    #[serde(default)]
    pub flags: Option<String>,
}

fn deserialize_btrfs_datetime<'de, D>(deserializer: D) -> Result<DateTime<FixedOffset>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    DateTime::parse_from_str(&value, "%Y-%m-%d %H:%M:%S %z").map_err(serde::de::Error::custom)
}

impl Subvolume {
    pub fn from_path(path: &Path) -> Result<Self> {
        let output_data = run_btrfs(vec![
            "subvolume".into(),
            "show".into(),
            "--raw".into(),
            path.as_os_str().to_owned(),
        ])?;
        Self::parse_show(&output_data).context(format!("failed to parse subvolume info for {:?}", path))
    }

    pub fn ctransid(&self) -> u64 {
        self.generation
    }

    pub fn ctime_utc(&self) -> DateTime<Utc> {
        self.ctime.with_timezone(&Utc)
    }

    pub fn read_only(&self) -> bool {
        match self.flags.as_deref() {
            Some(flags) => flags.split(|c| c == ' ' || c == ',').any(|f| f == "readonly"),
            None => false,
        }
    }

    fn parse_show(data: &str) -> Result<Self> {
        // First line is the bare subvolume path, the indented key/value block
        // ends where the snapshot list starts.
        let lines = data
            .lines()
            .skip(1)
            .take_while(|l| !l.trim_start().starts_with("Snapshot(s)"));
        let kvps = parse_key_value_pair_lines::<_, Vec<StringPair>>(lines, ":")
            .context("Failed to parse output of btrfs subvolume.")?;

        let subvolume = envy::from_iter::<_, Self>(kvps.into_iter().filter_map(|x| {
            if x.1 != "-" {
                Some((x.0.to_uppercase(), x.1))
            } else {
                None
            }
        }))
        .context("Failed loading information from btrfs subvolume output.")?;
        Ok(subvolume)
    }
}

pub fn is_subvolume(path: &Path) -> bool {
    Subvolume::from_path(path).is_ok()
}

pub fn create_snapshot(source: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        bail!("Path to new snapshot, {:?}, already exists!", dest);
    }
    run_btrfs(vec![
        "subvolume".into(),
        "snapshot".into(),
        "-r".into(),
        source.as_os_str().to_owned(),
        dest.as_os_str().to_owned(),
    ])
    .context(format!("Failed to create btrfs snapshot at {:?}.", dest))
    .map(|_| ())
}

/// Deleting an already absent subvolume is success.
pub fn delete_subvolume(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    run_btrfs(vec![
        "subvolume".into(),
        "delete".into(),
        path.as_os_str().to_owned(),
    ])
    .context(format!("Failed to delete btrfs subvolume at {:?}.", path))
    .map(|_| ())
}

pub fn rename_subvolume(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).context(format!("Failed to rename snapshot {:?} to {:?}.", from, to))
}

/// Lists the subvolumes directly inside `dir` along with their directory
/// entry names. Entries that are not subvolumes are skipped.
pub fn iter_subvolumes(dir: &Path) -> Result<Vec<(String, Subvolume)>> {
    let mut subvolumes = Vec::new();
    let entries =
        fs::read_dir(dir).context(format!("Failed to read snapshot directory {:?}.", dir))?;
    for entry in entries {
        let entry = entry.context("Failed to read snapshot directory entry.")?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        match Subvolume::from_path(&entry.path()) {
            Ok(subvolume) => subvolumes.push((name, subvolume)),
            Err(_) => slog_scope::trace!("skipping non-subvolume entry {}", name),
        }
    }
    subvolumes.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    Ok(subvolumes)
}

pub fn send_command(snapshot: &Path, parent: Option<&Path>) -> tokio::process::Command {
    let mut command = tokio::process::Command::new("btrfs");
    match parent {
        Some(parent_snapshot) => command.arg("send").arg("-p").arg(parent_snapshot).arg(snapshot),
        None => command.arg("send").arg(snapshot),
    };
    command
}
