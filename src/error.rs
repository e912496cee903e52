// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Camera '{id}' capture failed: {reason}")]
    Capture { id: String, reason: String },

    #[error("Segment file not found: {0}")]
    SegmentNotFound(std::path::PathBuf),

    #[error("Clip composition failed for camera '{id}': {reason}")]
    Composition { id: String, reason: String },

    #[error("Trigger rejected: {0}")]
    Trigger(String),

    #[error("Camera '{id}' not found")]
    CameraNotFound { id: String },
}

pub type Result<T> = std::result::Result<T, ReplayError>;
