use crate::equivalence::OracleConfig;
use crate::transform::{MoveAddPastConv, MoveScalarMulPastConv, Transformation};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    MoveAddPastConv,
    MoveScalarMulPastConv,
}

impl TransformKind {
    pub fn build(self) -> Box<dyn Transformation> {
        match self {
            TransformKind::MoveAddPastConv => Box::new(MoveAddPastConv),
            TransformKind::MoveScalarMulPastConv => Box::new(MoveScalarMulPastConv),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamlineConfig {
    pub transforms: Vec<TransformKind>,
    pub oracle: OracleConfig,
}

impl Default for StreamlineConfig {
    fn default() -> Self {
        Self {
            transforms: vec![
                TransformKind::MoveAddPastConv,
                TransformKind::MoveScalarMulPastConv,
            ],
            oracle: OracleConfig::default(),
        }
    }
}

impl StreamlineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
