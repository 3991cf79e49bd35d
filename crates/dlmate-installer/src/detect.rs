use anyhow::{Context, Result};
use dlmate_core::ToolkitVersion;
use std::fs;
use std::io;

use crate::layout::HostLayout;
use crate::pointer::read_active_pointer;

pub trait VersionDetector: Send + Sync {
    fn detect_active_version(&self) -> Result<Option<ToolkitVersion>>;
    fn detect_installed_versions(&self) -> Result<Vec<ToolkitVersion>>;
}

/// Reads versions straight off the install base: the active pointer and every
/// `cuda-X.Y` directory carrying a compiler.
#[derive(Debug, Clone)]
pub struct LayoutDetector {
    layout: HostLayout,
}

impl LayoutDetector {
    pub fn new(layout: HostLayout) -> Self {
        Self { layout }
    }
}

impl VersionDetector for LayoutDetector {
    fn detect_active_version(&self) -> Result<Option<ToolkitVersion>> {
        read_active_pointer(&self.layout)
    }

    fn detect_installed_versions(&self) -> Result<Vec<ToolkitVersion>> {
        let base = self.layout.install_base();
        let entries = match fs::read_dir(base) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read install base {}", base.display()));
            }
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry =
                entry.with_context(|| format!("failed to iterate {}", base.display()))?;
            let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(ToolkitVersion::from_install_dir_name)
            else {
                continue;
            };
            if self.layout.toolkit_marker_path(&version).is_file() {
                versions.push(version);
            }
        }
        versions.sort();
        versions.dedup();
        Ok(versions)
    }
}

/// Pulls `X.Y` out of `nvcc --version` output ("... release 12.1, V12.1.105").
pub fn parse_nvcc_release(output: &str) -> Option<ToolkitVersion> {
    let (_, rest) = output.split_once("release ")?;
    let token = rest
        .split(|ch: char| ch == ',' || ch.is_whitespace())
        .next()?;
    ToolkitVersion::parse(token).ok()
}
