use anyhow::Result;
use std::path::PathBuf;
use tracing::info;

use crate::env::without_toolkit_path_entries;
use crate::fs_utils::remove_path_if_exists;
use crate::shell_profile::clear_profile;
use crate::transactions::TransactionEngine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UninstallOptions {
    /// Leave the state directory (config, checkpoints, records) in place.
    pub keep_state: bool,
    /// Leave the active pointer and every `cuda-X.Y` install in place.
    pub keep_toolkits: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallReport {
    pub profiles_cleared: Vec<PathBuf>,
    pub toolkits_removed: Vec<PathBuf>,
    pub state_removed: bool,
}

/// Takes dlmate off the host. Profile, environment and toolkit removals run
/// as one transaction; the state directory goes last, after it committed.
pub fn uninstall(
    engine: &TransactionEngine,
    shell_profiles: &[PathBuf],
    options: UninstallOptions,
) -> Result<UninstallReport> {
    let mut report = engine.run_protected("uninstall", |tx| {
        let mut report = UninstallReport::default();
        for profile in shell_profiles {
            if clear_profile(profile)? {
                report.profiles_cleared.push(profile.clone());
            }
        }

        let install_base = tx.layout().install_base().to_path_buf();
        let env = tx.env();
        env.remove("CUDA_HOME");
        env.remove("CUDA_ROOT");
        for (key, leaf) in [("PATH", "bin"), ("LD_LIBRARY_PATH", "lib64")] {
            if let Some(current) = env.get(key) {
                let stripped = without_toolkit_path_entries(&current, &install_base, leaf);
                if stripped.is_empty() {
                    env.remove(key);
                } else {
                    env.set(key, &stripped);
                }
            }
        }

        if !options.keep_toolkits {
            for path in tx.layout().protected_paths()? {
                tx.check_cancelled()?;
                remove_path_if_exists(&path)?;
                info!(path = %path.display(), "removed CUDA toolkit path");
                report.toolkits_removed.push(path);
            }
        }
        Ok(report)
    })?;

    if !options.keep_state {
        let state_root = engine.layout().state_root();
        report.state_removed = remove_path_if_exists(state_root)?;
        if report.state_removed {
            info!(path = %state_root.display(), "removed state directory");
        }
    }
    Ok(report)
}
