use anyhow::{anyhow, bail, Context, Result};
use dlmate_core::ToolkitVersion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use tracing::{info, warn};

use crate::env::{apply_captured, capture_tracked, differs_from_captured, CapturedEnvironment};
use crate::error::EngineError;
use crate::fs_utils::write_durable;
use crate::layout::HostLayout;
use crate::switch::VersionSwitcher;
use crate::transactions::current_unix_timestamp;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub name: String,
    pub created_at_unix: u64,
    pub active_version: Option<ToolkitVersion>,
    pub environment: CapturedEnvironment,
    #[serde(default)]
    pub installed_packages: Vec<String>,
}

pub trait PackageLister: Send + Sync {
    /// Installed packages as `name==version` lines.
    fn list(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct PipPackageLister {
    program: String,
}

impl Default for PipPackageLister {
    fn default() -> Self {
        Self {
            program: "pip".to_string(),
        }
    }
}

impl PipPackageLister {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl PackageLister for PipPackageLister {
    fn list(&self) -> Result<Vec<String>> {
        let output = Command::new(&self.program)
            .args(["list", "--format=freeze"])
            .output()
            .with_context(|| format!("failed to run {} list", self.program))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} list failed: status={} stderr='{}'",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(parse_freeze_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

pub(crate) fn parse_freeze_output(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToOwned::to_owned)
        .collect()
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    layout: HostLayout,
}

impl CheckpointStore {
    pub fn new(layout: HostLayout) -> Self {
        Self { layout }
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        validate_checkpoint_name(&checkpoint.name)?;
        let path = self.layout.checkpoint_path(&checkpoint.name);
        let raw = serde_json::to_vec_pretty(checkpoint)
            .with_context(|| format!("failed to serialize checkpoint '{}'", checkpoint.name))?;
        write_durable(&path, &raw)?;
        Ok(path)
    }

    pub fn load(&self, name: &str) -> Result<Checkpoint> {
        validate_checkpoint_name(name)?;
        let path = self.layout.checkpoint_path(name);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(EngineError::CheckpointNotFound(name.to_string()).into());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read checkpoint: {}", path.display()));
            }
        };
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed parsing checkpoint: {}", path.display()))
    }

    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let dir = self.layout.checkpoints_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()));
            }
        };

        let mut checkpoints = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to iterate {}", dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match self.load(name) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(err) => {
                    warn!(path = %path.display(), error = %format!("{err:#}"), "skipping unreadable checkpoint");
                }
            }
        }
        checkpoints.sort_by(|left, right| {
            left.created_at_unix
                .cmp(&right.created_at_unix)
                .then_with(|| left.name.cmp(&right.name))
        });
        Ok(checkpoints)
    }
}

pub fn validate_checkpoint_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("checkpoint name must not be empty");
    }
    if name.starts_with('.')
        || !name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
    {
        bail!("invalid checkpoint name '{name}': use letters, digits, '-', '_' or '.'");
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageDrift {
    /// In the checkpoint but not installed now.
    pub missing: Vec<String>,
    /// Installed now but absent from the checkpoint.
    pub added: Vec<String>,
}

impl PackageDrift {
    pub fn between(recorded: &[String], current: &[String]) -> Self {
        let recorded = recorded.iter().collect::<BTreeSet<_>>();
        let current = current.iter().collect::<BTreeSet<_>>();
        Self {
            missing: recorded
                .difference(&current)
                .map(|line| (*line).clone())
                .collect(),
            added: current
                .difference(&recorded)
                .map(|line| (*line).clone())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.added.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRestore {
    pub checkpoint: Checkpoint,
    pub switched: bool,
    pub environment_restored: bool,
    pub package_drift: Option<PackageDrift>,
}

pub struct CheckpointManager<'a> {
    switcher: &'a VersionSwitcher,
    store: CheckpointStore,
    packages: Box<dyn PackageLister>,
}

impl<'a> CheckpointManager<'a> {
    pub fn new(switcher: &'a VersionSwitcher, packages: Box<dyn PackageLister>) -> Self {
        let store = CheckpointStore::new(switcher.engine().layout().clone());
        Self {
            switcher,
            store,
            packages,
        }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn create(&self, name: &str) -> Result<Checkpoint> {
        validate_checkpoint_name(name)?;
        let installed_packages = self.packages.list().unwrap_or_else(|err| {
            warn!(error = %format!("{err:#}"), "could not list installed packages");
            Vec::new()
        });
        let checkpoint = Checkpoint {
            version: CHECKPOINT_FORMAT_VERSION,
            name: name.to_string(),
            created_at_unix: current_unix_timestamp()?,
            active_version: self.switcher.detector().detect_active_version()?,
            environment: capture_tracked(self.switcher.engine().env()),
            installed_packages,
        };
        let path = self.store.save(&checkpoint)?;
        info!(name, path = %path.display(), "checkpoint created");
        Ok(checkpoint)
    }

    /// Puts the recorded toolkit version and tracked environment back. Package
    /// differences are reported only.
    pub fn restore(&self, name: &str) -> Result<CheckpointRestore> {
        let checkpoint = self.store.load(name)?;
        let engine = self.switcher.engine();

        let mut switched = false;
        if let Some(target) = &checkpoint.active_version {
            let active = self.switcher.detector().detect_active_version()?;
            if active.as_ref() != Some(target) {
                if !self.switcher.switch(&target.to_string())? {
                    bail!("failed to switch to CUDA {target} while restoring checkpoint '{name}'");
                }
                switched = true;
            }
        }

        let mut environment_restored = false;
        if differs_from_captured(engine.env(), &checkpoint.environment) {
            engine.run_protected(&format!("restore_checkpoint_{name}"), |tx| {
                apply_captured(tx.env(), &checkpoint.environment);
                Ok(())
            })?;
            environment_restored = true;
        }

        let package_drift = match self.packages.list() {
            Ok(current) => Some(PackageDrift::between(
                &checkpoint.installed_packages,
                &current,
            )),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "could not compare installed packages");
                None
            }
        };

        info!(name, switched, environment_restored, "checkpoint restored");
        Ok(CheckpointRestore {
            checkpoint,
            switched,
            environment_restored,
            package_drift,
        })
    }
}
