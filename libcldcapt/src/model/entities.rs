use crate::core::timeframe::Timeframe;
use crate::parsing::parse_preserve_policy;
use anyhow::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt::{self, Display},
    path::PathBuf,
    str::FromStr,
};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConfigEntity {
    pub timezone: String,
    pub sources: Vec<SourceEntity>,
    #[serde(default)]
    pub remotes: Vec<RemoteEntity>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SourceEntity {
    /// The mutable subvolume backups are taken of.
    pub path: PathBuf,
    /// Directory its snapshots are kept in.
    pub snapshots: PathBuf,
    #[serde(default)]
    pub upload_to_remotes: Vec<UploadEntity>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UploadEntity {
    pub id: String,
    pub preserve: PreservePolicy,
    /// Argv vectors the send stream is piped through, in order.
    #[serde(default)]
    pub pipe_through: Vec<Vec<String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RemoteEntity {
    pub id: String,
    pub s3: S3Entity,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct S3Entity {
    pub bucket: String,
    #[serde(default)]
    pub endpoint: Option<S3EndpointEntity>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct S3EndpointEntity {
    #[serde(default)]
    pub profile_name: Option<String>,
    #[serde(default)]
    pub region_name: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub verify: Option<bool>,
}

/// A preservation policy as written in the config ("1y 12m 30d"), kept
/// together with its parsed, coarsest-first entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreservePolicy {
    text: String,
    entries: Vec<(Timeframe, u32)>,
}

impl PreservePolicy {
    pub fn entries(&self) -> &[(Timeframe, u32)] {
        &self.entries
    }

    pub fn root_timeframe(&self) -> Timeframe {
        self.entries
            .iter()
            .find(|(_, count)| *count > 0)
            .map(|(timeframe, _)| *timeframe)
            .expect("a parsed policy preserves at least one timeframe")
    }
}

impl FromStr for PreservePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_preserve_policy(s).map(|entries| PreservePolicy {
            text: s.to_owned(),
            entries,
        })
    }
}

impl Display for PreservePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl Serialize for PreservePolicy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for PreservePolicy {
    fn deserialize<D>(deserializer: D) -> Result<PreservePolicy, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        PreservePolicy::from_str(&string).map_err(serde::de::Error::custom)
    }
}
