//! Error taxonomy for WPD extraction.
//!
//! Configuration and total-absence errors abort a run. Everything else is
//! recovered at the scope of a single AOI or frame and tallied in the run summary.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for WPD operations.
pub type WpdResult<T> = Result<T, WpdError>;

/// Errors that can occur while extracting working-plane data.
#[derive(Debug, Error)]
pub enum WpdError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Input directory not found: {0}")]
    MissingDirectory(PathBuf),

    #[error("Failed to parse AOI file {path}: {message}")]
    AoiParse { path: PathBuf, message: String },

    #[error("Failed to decode frame {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error(
        "Frame {path} is {actual_width}x{actual_height}, view expects {expected_width}x{expected_height}"
    )]
    ResolutionMismatch {
        path: PathBuf,
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("Grouping error: {0}")]
    Grouping(String),

    #[error("No frames found in {0}")]
    NoFrames(PathBuf),

    #[error("No AOI files found in {0}")]
    NoAois(PathBuf),

    #[error("Malformed WPD file {path}: {message}")]
    WpdFormat { path: PathBuf, message: String },

    #[error("Worker failure: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used by the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Parse,
    Decode,
    Grouping,
    TotalAbsence,
    Output,
    Worker,
}

impl WpdError {
    pub fn aoi_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::AoiParse {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn decode(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Decode {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn wpd_format(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::WpdFormat {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::MissingDirectory(_) | Self::Json(_) => {
                ErrorCategory::Configuration
            }
            Self::AoiParse { .. } => ErrorCategory::Parse,
            Self::Decode { .. } | Self::ResolutionMismatch { .. } | Self::Image(_) => {
                ErrorCategory::Decode
            }
            Self::Grouping(_) => ErrorCategory::Grouping,
            Self::NoFrames(_) | Self::NoAois(_) => ErrorCategory::TotalAbsence,
            Self::WpdFormat { .. } | Self::Io(_) => ErrorCategory::Output,
            Self::Worker(_) => ErrorCategory::Worker,
        }
    }

    /// Only configuration and total-absence errors stop a run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::MissingDirectory(_) | Self::NoFrames(_) | Self::NoAois(_)
        )
    }
}
