pub mod list;
pub mod update;

use cldcaptapp::AppFailure;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = libcldcapt::model::DEFAULT_CONFIG_PATH;

#[derive(Error, Debug)]
pub enum CliFailure {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("standard input is not a terminal; pass --force to run unattended")]
    Precondition,
    #[error("{failed} action(s) failed during execution")]
    Partial { failed: usize },
    #[error("internal inconsistency: {0}")]
    Internal(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliFailure {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliFailure::Config(_) => 1,
            CliFailure::Precondition => 2,
            CliFailure::Partial { .. } => 3,
            CliFailure::Internal(_) => 4,
            CliFailure::Other(_) => 3,
        }
    }
}

impl From<CliFailure> for AppFailure {
    fn from(failure: CliFailure) -> Self {
        let exit_code = failure.exit_code();
        AppFailure::new(anyhow::Error::new(failure), exit_code)
    }
}

pub fn config_path(path: &Option<PathBuf>) -> PathBuf {
    path.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn load_config(path: &Option<PathBuf>) -> Result<libcldcapt::model::Config, CliFailure> {
    libcldcapt::model::Config::load(&config_path(path)).map_err(|e| CliFailure::Config(format!("{:#}", e)))
}

pub fn source_base(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "subvol".to_string())
}
