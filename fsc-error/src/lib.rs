//! Unified error handling for fscd
//!
//! This crate provides the single error type used across the fan speed control crates.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using FscError
pub type Result<T> = std::result::Result<T, FscError>;

/// Unified error type for all fscd operations
#[derive(thiserror::Error, Debug)]
pub enum FscError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Configuration Errors (fatal at startup)
    // ============================================================================
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Invalid profile {name}: {reason}")]
    InvalidProfile {
        name: String,
        reason: String,
    },

    #[error("Unknown {kind} referenced: {name}")]
    UnknownReference {
        kind: &'static str,
        name: String,
    },

    // ============================================================================
    // Hardware Access Errors (degrade per tick)
    // ============================================================================
    #[error("Failed to read fan {fan}: {reason}")]
    FanRead {
        fan: String,
        reason: String,
    },

    #[error("Failed to write PWM to fan {fan}: {reason}")]
    PwmWrite {
        fan: String,
        reason: String,
    },

    #[error("Command `{command}` failed: {reason}")]
    Command {
        command: String,
        reason: String,
    },

    #[error("Watchdog error: {0}")]
    Watchdog(String),

    // ============================================================================
    // Runtime Errors
    // ============================================================================
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl FscError {
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_profile(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidProfile {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn command(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error must end the sampling loop (after fail-safe output)
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
