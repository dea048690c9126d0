//! Recovery decisions for damaged address books
//!
//! When a store turns out to be corrupt at open time, the session manager
//! never decides on its own. It proposes a backup path and asks a
//! `RecoveryHandler` whether to move the damaged file there and start fresh.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// What the caller is told about a corrupt store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionReport {
    /// The damaged file
    pub path: PathBuf,
    /// Where the damaged file will be kept if recovery goes ahead
    pub backup_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Move the damaged file aside and create a fresh, empty store
    Recreate,
    /// Leave the file alone and fail the open
    Abort,
}

/// Decides how to proceed with a corrupt store
pub trait RecoveryHandler {
    fn on_corrupt(&self, report: &CorruptionReport) -> RecoveryDecision;
}

impl<F> RecoveryHandler for F
where
    F: Fn(&CorruptionReport) -> RecoveryDecision,
{
    fn on_corrupt(&self, report: &CorruptionReport) -> RecoveryDecision {
        self(report)
    }
}

/// Configured recovery behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    /// Ask interactively. Without a prompt available this aborts.
    #[default]
    Ask,
    Recreate,
    Abort,
}

impl RecoveryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryPolicy::Ask => "ask",
            RecoveryPolicy::Recreate => "recreate",
            RecoveryPolicy::Abort => "abort",
        }
    }
}

impl FromStr for RecoveryPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ask" | "prompt" => Ok(RecoveryPolicy::Ask),
            "recreate" | "recover" | "yes" => Ok(RecoveryPolicy::Recreate),
            "abort" | "no" => Ok(RecoveryPolicy::Abort),
            _ => Err(Error::Engine(format!("Unknown recovery policy: {}", s))),
        }
    }
}

impl std::fmt::Display for RecoveryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl RecoveryHandler for RecoveryPolicy {
    fn on_corrupt(&self, _report: &CorruptionReport) -> RecoveryDecision {
        match self {
            RecoveryPolicy::Recreate => RecoveryDecision::Recreate,
            RecoveryPolicy::Ask | RecoveryPolicy::Abort => RecoveryDecision::Abort,
        }
    }
}

/// First free backup name for `path`: `<file>.bak`, then `<file>.bak.1`, ...
pub fn backup_path_for(path: &Path, exists: impl Fn(&Path) -> bool) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    let candidate = path.with_file_name(&name);
    if !exists(&candidate) {
        return candidate;
    }

    (1u32..)
        .map(|n| {
            let mut numbered = name.clone();
            numbered.push(format!(".{}", n));
            path.with_file_name(numbered)
        })
        .find(|candidate| !exists(candidate))
        .unwrap_or(candidate)
}
