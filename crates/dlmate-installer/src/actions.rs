use std::path::PathBuf;

use dlmate_core::ToolkitVersion;
use serde::{Deserialize, Serialize};

/// Compensating steps a transaction registers as it mutates the host. They
/// run in reverse registration order after the snapshot has been restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RollbackAction {
    RestoreActiveVersion { version: ToolkitVersion },
    RemovePath { path: PathBuf },
    RemoveCachedVersion { version: ToolkitVersion },
}

impl RollbackAction {
    pub fn describe(&self) -> String {
        match self {
            Self::RestoreActiveVersion { version } => format!("restore active version {version}"),
            Self::RemovePath { path } => format!("remove {}", path.display()),
            Self::RemoveCachedVersion { version } => format!("remove cached version {version}"),
        }
    }
}
