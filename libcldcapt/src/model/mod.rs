pub mod entities;

use anyhow::{anyhow, bail, Context as _, Result};
use chrono_tz::Tz;
use entities::{ConfigEntity, RemoteEntity, SourceEntity};
use std::{collections::HashSet, fs::File, io::BufReader, path::Path};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cldcapt/config.yaml";

/// A loaded and cross-validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub timezone: Tz,
    pub sources: Vec<SourceEntity>,
    pub remotes: Vec<RemoteEntity>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).context(format!("failed to open config file {:?}", path))?;
        let entity: ConfigEntity =
            serde_yaml::from_reader(BufReader::new(file)).context("failed to parse config file")?;
        Self::validate(entity)
    }

    pub fn validate(entity: ConfigEntity) -> Result<Self> {
        let timezone = entity
            .timezone
            .parse::<Tz>()
            .map_err(|e| anyhow!("unknown timezone '{}': {}", entity.timezone, e))?;

        let mut remote_ids = HashSet::new();
        for remote in &entity.remotes {
            if !remote_ids.insert(remote.id.as_str()) {
                bail!("duplicate remote id '{}'", remote.id);
            }
        }

        if entity.sources.is_empty() {
            bail!("configuration has no sources");
        }
        for source in &entity.sources {
            if source.upload_to_remotes.is_empty() {
                bail!("source {:?} uploads to no remote", source.path);
            }
            for upload in &source.upload_to_remotes {
                if !remote_ids.contains(upload.id.as_str()) {
                    bail!("source {:?} references unknown remote '{}'", source.path, upload.id);
                }
                if upload.pipe_through.iter().any(|argv| argv.is_empty()) {
                    bail!("source {:?} has an empty pipe_through command", source.path);
                }
            }
        }

        Ok(Self {
            timezone,
            sources: entity.sources,
            remotes: entity.remotes,
        })
    }

    pub fn remote(&self, id: &str) -> Option<&RemoteEntity> {
        self.remotes.iter().find(|remote| remote.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::prelude::*;

    fn parse(yaml: &str) -> Result<Config> {
        Config::validate(serde_yaml::from_str(yaml).context("parse")?)
    }

    const GOOD_CONFIG: &str = indoc!(
        r#"
        timezone: UTC
        sources:
          - path: /mnt/pool/home
            snapshots: /mnt/pool/.cldcapt/home
            upload_to_remotes:
              - id: offsite
                preserve: 1y 12m 30d
                pipe_through:
                  - [gzip, "-9"]
        remotes:
          - id: offsite
            s3:
              bucket: my-backups
              endpoint:
                region_name: us-east-2
        "#
    );

    #[test]
    fn full_config_parses_and_validates() {
        let config = parse(GOOD_CONFIG).unwrap();
        assert_eq!(config.timezone, chrono_tz::UTC);
        assert_eq!(config.sources.len(), 1);
        let upload = &config.sources[0].upload_to_remotes[0];
        assert_eq!(upload.id, "offsite");
        assert_eq!(upload.pipe_through, vec![vec!["gzip".to_string(), "-9".to_string()]]);
        assert!(config.remote("offsite").is_some());
        assert!(config.remote("nowhere").is_none());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let yaml = GOOD_CONFIG.replace("timezone: UTC", "timezone: Mars/Olympus");
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn duplicate_remote_id_is_rejected() {
        let yaml = indoc!(
            r#"
            timezone: UTC
            sources:
              - path: /s
                snapshots: /snaps
                upload_to_remotes:
                  - id: r
                    preserve: 1y
            remotes:
              - id: r
                s3: { bucket: a }
              - id: r
                s3: { bucket: b }
            "#
        );
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn unresolved_remote_reference_is_rejected() {
        let yaml = indoc!(
            r#"
            timezone: UTC
            sources:
              - path: /s
                snapshots: /snaps
                upload_to_remotes:
                  - id: missing
                    preserve: 1y
            remotes: []
            "#
        );
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn malformed_policy_is_rejected() {
        let yaml = GOOD_CONFIG.replace("preserve: 1y 12m 30d", "preserve: 1y 2y");
        assert!(parse(&yaml).is_err());
    }
}
