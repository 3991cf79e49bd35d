use anyhow::{anyhow, Context, Result};
use dlmate_core::{PlatformTag, ToolkitVersion};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use tracing::{info, warn};

use crate::actions::RollbackAction;
use crate::detect::VersionDetector;
use crate::env::{with_toolkit_path_entry, EnvStore};
use crate::error::EngineError;
use crate::fs_utils::{copy_tree_cancellable, path_exists_no_follow, remove_path_if_exists};
use crate::layout::HostLayout;
use crate::pointer::{read_active_pointer, repoint_active_pointer};
use crate::shell_profile::write_profile;
use crate::transactions::{Transaction, TransactionEngine};

pub trait ArtifactFetcher: Send + Sync {
    fn supports(&self, version: &ToolkitVersion, platform: PlatformTag) -> bool;

    /// Places the installer for `version` in `dest_dir`, downloading it
    /// unless a verified copy is already there. Implementations stop early
    /// once `cancel` is set.
    fn fetch(
        &self,
        version: &ToolkitVersion,
        platform: PlatformTag,
        dest_dir: &Path,
        cancel: &AtomicBool,
    ) -> Result<FetchedArtifact>;
}

/// Where `fetch` left the installer. `downloaded` is false when an earlier
/// download was reused, which the fetching transaction must not delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    pub path: PathBuf,
    pub downloaded: bool,
}

pub trait ToolkitInstaller: Send + Sync {
    fn install(
        &self,
        artifact: &Path,
        version: &ToolkitVersion,
        install_dir: &Path,
        cancel: &AtomicBool,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionInventory {
    pub active: Option<ToolkitVersion>,
    pub installed: Vec<ToolkitVersion>,
    pub cached: Vec<ToolkitVersion>,
}

pub struct VersionSwitcher {
    engine: TransactionEngine,
    fetcher: Box<dyn ArtifactFetcher>,
    installer: Box<dyn ToolkitInstaller>,
    detector: Box<dyn VersionDetector>,
    platform: PlatformTag,
    shell_profiles: Vec<PathBuf>,
}

impl VersionSwitcher {
    pub fn new(
        engine: TransactionEngine,
        fetcher: Box<dyn ArtifactFetcher>,
        installer: Box<dyn ToolkitInstaller>,
        detector: Box<dyn VersionDetector>,
        platform: PlatformTag,
    ) -> Self {
        let shell_profiles = vec![engine.layout().home_dir().join(".bashrc")];
        Self {
            engine,
            fetcher,
            installer,
            detector,
            platform,
            shell_profiles,
        }
    }

    pub fn with_shell_profiles(mut self, shell_profiles: Vec<PathBuf>) -> Self {
        self.shell_profiles = shell_profiles;
        self
    }

    pub fn engine(&self) -> &TransactionEngine {
        &self.engine
    }

    pub fn platform(&self) -> PlatformTag {
        self.platform
    }

    pub fn detector(&self) -> &dyn VersionDetector {
        self.detector.as_ref()
    }

    /// Makes `target` the active toolkit. `Ok(false)` means fetching or
    /// installing failed and everything was rolled back.
    pub fn switch(&self, target: &str) -> Result<bool> {
        let target = ToolkitVersion::parse(target)?;
        let installed = self.is_installed(&target)?;
        let cached = self.is_cached(&target);
        if !installed && !cached && !self.fetcher.supports(&target, self.platform) {
            return Err(EngineError::UnsupportedVersion {
                version: target.to_string(),
                platform: self.platform.as_str().to_string(),
            }
            .into());
        }

        let active = self.detector.detect_active_version()?;
        if installed && active.as_ref() == Some(&target) {
            info!(version = %target, "CUDA version already active");
            return Ok(true);
        }

        let operation = format!("switch_cuda_{target}");
        let result = self.engine.run_protected(&operation, |tx| {
            if let Some(current) = active.as_ref().filter(|current| **current != target) {
                tx.add_rollback_action(RollbackAction::RestoreActiveVersion {
                    version: current.clone(),
                })?;
            }

            if installed {
                self.activate(tx, &target)
            } else if cached {
                self.restore_from_cache(tx, &target)
            } else {
                self.fetch_and_install(tx, &target)?;
                self.activate(tx, &target)
            }
        });

        match result {
            Ok(()) => {
                info!(version = %target, "switched CUDA version");
                Ok(true)
            }
            Err(err) if is_install_failure(&err) => {
                warn!(version = %target, error = %format!("{err:#}"), "switch rolled back after install failure");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Repoints the active toolkit at an installed `version`, caching the
    /// outgoing one first, then updates the environment and shell profiles.
    pub fn activate(&self, tx: &mut Transaction, version: &ToolkitVersion) -> Result<()> {
        let layout = tx.layout().clone();
        let install_dir = layout.install_dir(version);
        if !layout.toolkit_marker_path(version).is_file() {
            return Err(anyhow!(
                "CUDA {version} is not installed at {}",
                install_dir.display()
            ));
        }

        if let Some(current) = read_active_pointer(&layout)?.filter(|current| current != version)
        {
            let cache_path = layout.version_cache_path(&current);
            let current_dir = layout.install_dir(&current);
            if !path_exists_no_follow(&cache_path) && current_dir.is_dir() {
                tx.add_rollback_action(RollbackAction::RemoveCachedVersion {
                    version: current.clone(),
                })?;
                copy_tree_cancellable(&current_dir, &cache_path, tx.cancel_flag())
                    .with_context(|| format!("failed to cache CUDA {current}"))?;
                info!(version = %current, "cached outgoing CUDA version");
            }
        }

        tx.check_cancelled()?;
        repoint_active_pointer(&layout, version)?;
        apply_toolkit_environment(tx.env(), &layout, &install_dir);
        for profile in &self.shell_profiles {
            write_profile(profile, &install_dir)?;
        }
        Ok(())
    }

    pub fn restore_from_cache(&self, tx: &mut Transaction, version: &ToolkitVersion) -> Result<()> {
        let layout = tx.layout().clone();
        let cache_path = layout.version_cache_path(version);
        let install_dir = layout.install_dir(version);

        if path_exists_no_follow(&install_dir) {
            remove_path_if_exists(&install_dir)?;
        } else {
            tx.add_rollback_action(RollbackAction::RemovePath {
                path: install_dir.clone(),
            })?;
        }
        copy_tree_cancellable(&cache_path, &install_dir, tx.cancel_flag())
            .with_context(|| format!("failed to restore CUDA {version} from cache"))?;
        tx.check_cancelled()?;
        info!(version = %version, "restored CUDA version from cache");
        self.activate(tx, version)
    }

    pub fn fetch_and_install(&self, tx: &mut Transaction, version: &ToolkitVersion) -> Result<()> {
        let layout = tx.layout().clone();
        let downloads = layout.downloads_dir();
        fs::create_dir_all(&downloads)
            .with_context(|| format!("failed to create {}", downloads.display()))?;

        let fetched = self
            .fetcher
            .fetch(version, self.platform, &downloads, tx.cancel_flag())
            .map_err(|err| install_failed(tx, version, err))?;
        if fetched.downloaded {
            tx.add_rollback_action(RollbackAction::RemovePath {
                path: fetched.path.clone(),
            })?;
        }
        let artifact = fetched.path;
        tx.check_cancelled()?;

        let install_dir = layout.install_dir(version);
        if !path_exists_no_follow(&install_dir) {
            tx.add_rollback_action(RollbackAction::RemovePath {
                path: install_dir.clone(),
            })?;
        }

        info!(version = %version, artifact = %artifact.display(), "installing CUDA toolkit");
        self.installer
            .install(&artifact, version, &install_dir, tx.cancel_flag())
            .map_err(|err| install_failed(tx, version, err))?;
        if !layout.toolkit_marker_path(version).is_file() {
            return Err(install_failed(
                tx,
                version,
                anyhow!(
                    "installer finished but {} is missing",
                    layout.toolkit_marker_path(version).display()
                ),
            ));
        }
        Ok(())
    }

    /// Deletes an inactive version's install directory and cache entry.
    /// Returns `false` when neither existed.
    pub fn remove_version(&self, version: &ToolkitVersion) -> Result<bool> {
        if self.detector.detect_active_version()?.as_ref() == Some(version) {
            return Err(EngineError::VersionActive(version.to_string()).into());
        }

        let layout = self.engine.layout();
        let install_dir = layout.install_dir(version);
        let cache_path = layout.version_cache_path(version);
        if !path_exists_no_follow(&install_dir) && !path_exists_no_follow(&cache_path) {
            return Ok(false);
        }

        self.engine
            .run_protected(&format!("remove_cuda_{version}"), |tx| {
                remove_path_if_exists(&install_dir)?;
                tx.check_cancelled()?;
                remove_path_if_exists(&cache_path)?;
                Ok(())
            })?;
        info!(version = %version, "removed CUDA version");
        Ok(true)
    }

    pub fn is_installed(&self, version: &ToolkitVersion) -> Result<bool> {
        Ok(self.detector.detect_installed_versions()?.contains(version))
    }

    pub fn is_cached(&self, version: &ToolkitVersion) -> bool {
        self.engine.layout().version_cache_path(version).is_dir()
    }

    pub fn list_installed(&self) -> Result<Vec<ToolkitVersion>> {
        self.detector.detect_installed_versions()
    }

    pub fn list_cached(&self) -> Result<Vec<ToolkitVersion>> {
        let dir = self.engine.layout().cache_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()));
            }
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to iterate {}", dir.display()))?;
            if let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(ToolkitVersion::from_install_dir_name)
            {
                versions.push(version);
            }
        }
        versions.sort();
        Ok(versions)
    }

    pub fn inventory(&self) -> Result<VersionInventory> {
        Ok(VersionInventory {
            active: self.detector.detect_active_version()?,
            installed: self.list_installed()?,
            cached: self.list_cached()?,
        })
    }
}

pub fn apply_toolkit_environment(env: &dyn EnvStore, layout: &HostLayout, install_dir: &Path) {
    let home = install_dir.to_string_lossy();
    env.set("CUDA_HOME", &home);
    env.set("CUDA_ROOT", &home);

    let path = with_toolkit_path_entry(
        env.get("PATH").as_deref(),
        &install_dir.join("bin"),
        layout.install_base(),
        "bin",
    );
    env.set("PATH", &path);

    let library_path = with_toolkit_path_entry(
        env.get("LD_LIBRARY_PATH").as_deref(),
        &install_dir.join("lib64"),
        layout.install_base(),
        "lib64",
    );
    env.set("LD_LIBRARY_PATH", &library_path);
}

/// Installer errors roll the switch back quietly, except when the process is
/// stopping: then the interruption is what the caller must see.
fn install_failed(tx: &Transaction, version: &ToolkitVersion, err: anyhow::Error) -> anyhow::Error {
    if tx.is_cancelled() {
        return err.context(EngineError::Interrupted {
            txid: tx.txid().to_string(),
        });
    }
    EngineError::InstallFailed {
        version: version.to_string(),
        reason: format!("{err:#}"),
    }
    .into()
}

fn is_install_failure(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::InstallFailed { .. })
    )
}
