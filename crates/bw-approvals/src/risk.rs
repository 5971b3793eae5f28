//! Risk classification for file operations.
//!
//! Risk scales with the operation, the number of paths touched, and
//! whether every path lies inside the designated safe directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Create,
    Modify,
    Overwrite,
    Delete,
    Move,
    Rename,
}

/// Classify a file-operation request.
///
/// Escalation rules: delete goes critical above 5 paths and high outside
/// the safe area; overwrite/modify escalate above 3 paths or outside the
/// safe area (one step each); create stays low unless bulk (>10 paths);
/// move/rename escalate above 3 paths.
pub fn classify(operation: FileOperation, paths: &[PathBuf], safe_dir: &Path) -> RiskLevel {
    let count = paths.len();
    let all_safe = paths.iter().all(|p| p.starts_with(safe_dir));

    match operation {
        FileOperation::Delete => {
            if count > 5 {
                RiskLevel::Critical
            } else if !all_safe {
                RiskLevel::High
            } else {
                RiskLevel::Medium
            }
        }
        FileOperation::Overwrite | FileOperation::Modify => {
            match (count > 3, !all_safe) {
                (true, true) => RiskLevel::High,
                (true, false) | (false, true) => RiskLevel::Medium,
                (false, false) => RiskLevel::Low,
            }
        }
        FileOperation::Create => {
            if count > 10 {
                RiskLevel::Medium
            } else {
                RiskLevel::Low
            }
        }
        FileOperation::Move | FileOperation::Rename => {
            if count > 3 {
                RiskLevel::Medium
            } else {
                RiskLevel::Low
            }
        }
    }
}
