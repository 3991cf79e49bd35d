use anyhow::{bail, Context, Result};
use dlmate_core::Mirror;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DlmateConfig {
    pub install_base: PathBuf,
    pub mirror: Mirror,
    pub use_sudo: bool,
    /// Profiles that receive the managed block, relative to `$HOME` unless
    /// absolute.
    pub shell_profiles: Vec<PathBuf>,
    pub monitor_interval_secs: u64,
    pub catalog_path: Option<PathBuf>,
    pub keep_transactions: usize,
}

impl Default for DlmateConfig {
    fn default() -> Self {
        Self {
            install_base: PathBuf::from("/usr/local"),
            mirror: Mirror::Official,
            use_sudo: true,
            shell_profiles: vec![PathBuf::from(".bashrc")],
            monitor_interval_secs: 30,
            catalog_path: None,
            keep_transactions: 20,
        }
    }
}

impl DlmateConfig {
    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config file: {}", path.display()));
            }
        };
        Self::parse(&raw).with_context(|| format!("failed parsing config file: {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config = toml::from_str::<Self>(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.install_base.is_absolute() {
            bail!(
                "install_base must be an absolute path: {}",
                self.install_base.display()
            );
        }
        if self.monitor_interval_secs == 0 {
            bail!("monitor_interval_secs must be at least 1");
        }
        if self.keep_transactions == 0 {
            bail!("keep_transactions must be at least 1");
        }
        if self.shell_profiles.iter().any(|profile| profile.as_os_str().is_empty()) {
            bail!("shell_profiles must not contain empty paths");
        }
        Ok(())
    }

    pub fn resolved_shell_profiles(&self, home_dir: &Path) -> Vec<PathBuf> {
        self.shell_profiles
            .iter()
            .map(|profile| {
                if profile.is_absolute() {
                    profile.clone()
                } else {
                    home_dir.join(profile)
                }
            })
            .collect()
    }
}
