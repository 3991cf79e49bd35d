use anyhow::{Context, Result};
use dlmate_core::ToolkitVersion;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const ACTIVE_POINTER_NAME: &str = "cuda";
const ASIDE_PREFIX: &str = "cuda.backup";
const TOOLKIT_MARKER: &str = "nvcc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    state_root: PathBuf,
    install_base: PathBuf,
    home_dir: PathBuf,
    system_environment_file: PathBuf,
}

impl HostLayout {
    pub fn new(
        state_root: impl Into<PathBuf>,
        install_base: impl Into<PathBuf>,
        home_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            state_root: state_root.into(),
            install_base: install_base.into(),
            home_dir: home_dir.into(),
            system_environment_file: PathBuf::from("/etc/environment"),
        }
    }

    pub fn with_system_environment_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.system_environment_file = path.into();
        self
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn install_base(&self) -> &Path {
        &self.install_base
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_root.join("config.toml")
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.state_root.join("transactions")
    }

    pub fn transaction_lock_path(&self) -> PathBuf {
        self.transactions_dir().join("engine.lock")
    }

    pub fn transaction_record_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.json"))
    }

    pub fn snapshot_dir(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(txid)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_root.join("cuda_cache")
    }

    pub fn version_cache_path(&self, version: &ToolkitVersion) -> PathBuf {
        self.cache_dir().join(version.install_dir_name())
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.state_root.join("backups")
    }

    pub fn checkpoint_path(&self, name: &str) -> PathBuf {
        self.checkpoints_dir().join(format!("{name}.json"))
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.state_root.join("downloads")
    }

    pub fn active_pointer_path(&self) -> PathBuf {
        self.install_base.join(ACTIVE_POINTER_NAME)
    }

    pub fn install_dir(&self, version: &ToolkitVersion) -> PathBuf {
        self.install_base.join(version.install_dir_name())
    }

    pub fn toolkit_marker_path(&self, version: &ToolkitVersion) -> PathBuf {
        self.install_dir(version).join("bin").join(TOOLKIT_MARKER)
    }

    pub fn active_marker_path(&self) -> PathBuf {
        self.active_pointer_path().join("bin").join(TOOLKIT_MARKER)
    }

    pub fn config_files(&self) -> Vec<PathBuf> {
        vec![
            self.home_dir.join(".bashrc"),
            self.home_dir.join(".profile"),
            self.home_dir.join(".zshrc"),
            self.system_environment_file.clone(),
        ]
    }

    /// Every entry under the install base that a transaction must be able to
    /// put back: the active pointer, versioned installs and renamed-aside
    /// pointer directories.
    pub fn protected_paths(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.install_base) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "failed to read install base: {}",
                        self.install_base.display()
                    )
                });
            }
        };

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| {
                format!(
                    "failed to iterate install base: {}",
                    self.install_base.display()
                )
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if is_protected_entry_name(name) {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub fn next_aside_path(&self) -> PathBuf {
        let first = self.install_base.join(ASIDE_PREFIX);
        if fs::symlink_metadata(&first).is_err() {
            return first;
        }
        let mut index = 1_u32;
        loop {
            let candidate = self.install_base.join(format!("{ASIDE_PREFIX}-{index}"));
            if fs::symlink_metadata(&candidate).is_err() {
                return candidate;
            }
            index += 1;
        }
    }

    pub fn ensure_state_dirs(&self) -> Result<()> {
        for dir in [
            self.state_root.clone(),
            self.transactions_dir(),
            self.cache_dir(),
            self.checkpoints_dir(),
            self.downloads_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn is_protected_entry_name(name: &str) -> bool {
    name == ACTIVE_POINTER_NAME || name.starts_with("cuda-") || name.starts_with(ASIDE_PREFIX)
}

pub fn default_state_root() -> Result<PathBuf> {
    if let Some(root) = std::env::var_os("DLMATE_HOME").filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(root));
    }
    Ok(default_home_dir()?.join(".deeplearningmate"))
}

pub fn default_home_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set; cannot resolve user home")?;
    Ok(PathBuf::from(home))
}
