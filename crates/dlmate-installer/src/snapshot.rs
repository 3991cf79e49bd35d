use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::env::CapturedEnvironment;
use crate::fs_utils::{copy_tree, remove_file_if_exists, remove_path_if_exists, write_durable};
use crate::layout::HostLayout;

const PATHS_DIR: &str = "paths";
const CONFIGS_DIR: &str = "configs";
const ENVIRONMENT_FILE: &str = "environment.json";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Default)]
pub struct SnapshotRequest {
    pub paths: Vec<PathBuf>,
    pub environment: CapturedEnvironment,
    pub configs: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedPath {
    pub original: PathBuf,
    pub stored: String,
}

/// `stored` is `None` when the file did not exist at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedConfig {
    pub original: PathBuf,
    pub stored: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub txid: String,
    pub paths: Vec<CapturedPath>,
    pub configs: Vec<CapturedConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreFailure {
    pub path: PathBuf,
    pub detail: String,
}

impl RestoreFailure {
    fn new(path: &Path, err: anyhow::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            detail: format!("{err:#}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    layout: HostLayout,
}

impl SnapshotStore {
    pub fn new(layout: HostLayout) -> Self {
        Self { layout }
    }

    pub fn snapshot_dir(&self, txid: &str) -> PathBuf {
        self.layout.snapshot_dir(txid)
    }

    pub fn exists(&self, txid: &str) -> bool {
        self.snapshot_dir(txid).join(MANIFEST_FILE).is_file()
    }

    /// Copies everything named in `request` under the transaction's snapshot
    /// directory. A failed capture leaves no directory behind.
    pub fn capture(&self, txid: &str, request: &SnapshotRequest) -> Result<SnapshotManifest> {
        let root = self.snapshot_dir(txid);
        if root.exists() {
            bail!("snapshot directory already exists: {}", root.display());
        }

        let result = self.capture_into(&root, txid, request);
        if result.is_err() {
            let _ = fs::remove_dir_all(&root);
        }
        result
    }

    fn capture_into(
        &self,
        root: &Path,
        txid: &str,
        request: &SnapshotRequest,
    ) -> Result<SnapshotManifest> {
        let paths_dir = root.join(PATHS_DIR);
        let configs_dir = root.join(CONFIGS_DIR);
        fs::create_dir_all(&paths_dir)
            .with_context(|| format!("failed to create {}", paths_dir.display()))?;
        fs::create_dir_all(&configs_dir)
            .with_context(|| format!("failed to create {}", configs_dir.display()))?;

        let mut seen = BTreeSet::new();
        let mut paths = Vec::new();
        for original in &request.paths {
            if fs::symlink_metadata(original).is_err() {
                continue;
            }
            let stored = original
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow!("protected path has no file name: {}", original.display()))?
                .to_string();
            if !seen.insert(stored.clone()) {
                bail!("protected path name captured twice: {stored}");
            }
            copy_tree(original, &paths_dir.join(&stored)).with_context(|| {
                format!("failed to snapshot protected path {}", original.display())
            })?;
            paths.push(CapturedPath {
                original: original.clone(),
                stored,
            });
        }

        let environment = serde_json::to_vec_pretty(&request.environment)
            .context("failed to serialize captured environment")?;
        write_durable(&root.join(ENVIRONMENT_FILE), &environment)?;

        let mut configs = Vec::new();
        for (index, original) in request.configs.iter().enumerate() {
            let stored = if original.is_file() {
                let file_name = original
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or("config");
                let stored = format!("{index}-{file_name}");
                fs::copy(original, configs_dir.join(&stored)).with_context(|| {
                    format!("failed to snapshot config file {}", original.display())
                })?;
                Some(stored)
            } else {
                None
            };
            configs.push(CapturedConfig {
                original: original.clone(),
                stored,
            });
        }

        let manifest = SnapshotManifest {
            txid: txid.to_string(),
            paths,
            configs,
        };
        let raw =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize snapshot manifest")?;
        write_durable(&root.join(MANIFEST_FILE), &raw)?;
        Ok(manifest)
    }

    pub fn read_manifest(&self, txid: &str) -> Result<SnapshotManifest> {
        let path = self.snapshot_dir(txid).join(MANIFEST_FILE);
        let raw = fs::read(&path)
            .with_context(|| format!("failed to read snapshot manifest: {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed parsing snapshot manifest: {}", path.display()))
    }

    pub fn read_environment(&self, txid: &str) -> Result<CapturedEnvironment> {
        let path = self.snapshot_dir(txid).join(ENVIRONMENT_FILE);
        let raw = fs::read(&path)
            .with_context(|| format!("failed to read captured environment: {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed parsing captured environment: {}", path.display()))
    }

    /// Removes every path in `current`, then copies the captured entries back.
    /// Keeps going past individual failures and returns them.
    pub fn restore_paths(&self, txid: &str, current: &[PathBuf]) -> Vec<RestoreFailure> {
        let manifest = match self.read_manifest(txid) {
            Ok(manifest) => manifest,
            Err(err) => return vec![RestoreFailure::new(&self.snapshot_dir(txid), err)],
        };

        let mut failures = Vec::new();
        for path in current {
            if let Err(err) = remove_path_if_exists(path) {
                failures.push(RestoreFailure::new(path, err));
            }
        }

        let paths_dir = self.snapshot_dir(txid).join(PATHS_DIR);
        for captured in &manifest.paths {
            let result = remove_path_if_exists(&captured.original)
                .and_then(|_| copy_tree(&paths_dir.join(&captured.stored), &captured.original));
            if let Err(err) = result {
                failures.push(RestoreFailure::new(&captured.original, err));
            }
        }
        failures
    }

    pub fn restore_configs(&self, txid: &str) -> Vec<RestoreFailure> {
        let manifest = match self.read_manifest(txid) {
            Ok(manifest) => manifest,
            Err(err) => return vec![RestoreFailure::new(&self.snapshot_dir(txid), err)],
        };

        let configs_dir = self.snapshot_dir(txid).join(CONFIGS_DIR);
        let mut failures = Vec::new();
        for config in &manifest.configs {
            let result = match &config.stored {
                Some(stored) => restore_config_file(&configs_dir.join(stored), &config.original),
                None => remove_file_if_exists(&config.original).with_context(|| {
                    format!("failed to remove {}", config.original.display())
                }),
            };
            if let Err(err) = result {
                failures.push(RestoreFailure::new(&config.original, err));
            }
        }
        failures
    }

    pub fn remove(&self, txid: &str) -> Result<()> {
        let root = self.snapshot_dir(txid);
        remove_path_if_exists(&root)
            .with_context(|| format!("failed to remove snapshot {}", root.display()))?;
        Ok(())
    }
}

fn restore_config_file(stored: &Path, original: &Path) -> Result<()> {
    let contents = fs::read(stored)
        .with_context(|| format!("failed to read stored config {}", stored.display()))?;
    fs::write(original, contents)
        .with_context(|| format!("failed to restore config file {}", original.display()))
}
