use std::collections::BTreeSet;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::platform::{Mirror, PlatformTag};
use crate::version::ToolkitVersion;

const BUILTIN_CATALOG: &str = r#"
[mirrors]
official = "https://developer.download.nvidia.com/compute/cuda"
china = "https://mirrors.tuna.tsinghua.edu.cn/nvidia/cuda"

[[toolkits]]
version = "11.8"
release = "11.8.0"
runfile = "cuda_11.8.0_520.61.05_linux.run"
platforms = ["ubuntu20", "ubuntu22"]

[[toolkits]]
version = "12.0"
release = "12.0.0"
runfile = "cuda_12.0.0_525.60.13_linux.run"
platforms = ["ubuntu20", "ubuntu22"]

[[toolkits]]
version = "12.1"
release = "12.1.0"
runfile = "cuda_12.1.0_530.30.02_linux.run"
platforms = ["ubuntu20", "ubuntu22"]
"#;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MirrorBases {
    pub official: String,
    pub china: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolkitEntry {
    pub version: ToolkitVersion,
    pub release: String,
    pub runfile: String,
    #[serde(default)]
    pub platforms: Vec<PlatformTag>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactCatalog {
    pub mirrors: MirrorBases,
    #[serde(default)]
    pub toolkits: Vec<ToolkitEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSource {
    pub version: ToolkitVersion,
    pub platform: PlatformTag,
    pub url: String,
    pub file_name: String,
    pub sha256: Option<String>,
}

impl ArtifactCatalog {
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_toml_str(BUILTIN_CATALOG).context("built-in toolkit catalog is invalid")
    }

    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let catalog: Self = toml::from_str(input).context("failed to parse toolkit catalog")?;

        if catalog.mirrors.official.trim().is_empty() {
            return Err(anyhow!("catalog official mirror must not be empty"));
        }

        let mut seen = BTreeSet::new();
        for entry in &catalog.toolkits {
            if !seen.insert(entry.version.clone()) {
                return Err(anyhow!(
                    "duplicate toolkit version '{}' in catalog",
                    entry.version
                ));
            }
            if entry.runfile.trim().is_empty() || entry.runfile.contains('/') {
                return Err(anyhow!(
                    "invalid runfile name '{}' for toolkit '{}'",
                    entry.runfile,
                    entry.version
                ));
            }
            if entry.release.trim().is_empty() {
                return Err(anyhow!(
                    "release must not be empty for toolkit '{}'",
                    entry.version
                ));
            }
            if entry.platforms.is_empty() {
                return Err(anyhow!(
                    "toolkit '{}' must list at least one platform",
                    entry.version
                ));
            }
            if let Some(sha256) = &entry.sha256 {
                if sha256.len() != 64 || !sha256.chars().all(|ch| ch.is_ascii_hexdigit()) {
                    return Err(anyhow!(
                        "invalid sha256 for toolkit '{}': {sha256}",
                        entry.version
                    ));
                }
            }
        }

        Ok(catalog)
    }

    pub fn versions(&self) -> Vec<ToolkitVersion> {
        let mut versions = self
            .toolkits
            .iter()
            .map(|entry| entry.version.clone())
            .collect::<Vec<_>>();
        versions.sort();
        versions
    }

    pub fn entry(&self, version: &ToolkitVersion) -> Option<&ToolkitEntry> {
        self.toolkits.iter().find(|entry| &entry.version == version)
    }

    pub fn supports(&self, version: &ToolkitVersion, platform: PlatformTag) -> bool {
        self.entry(version)
            .is_some_and(|entry| entry.platforms.contains(&platform))
    }

    pub fn resolve(
        &self,
        version: &ToolkitVersion,
        platform: PlatformTag,
        mirror: Mirror,
    ) -> Option<ArtifactSource> {
        let entry = self.entry(version)?;
        if !entry.platforms.contains(&platform) {
            return None;
        }

        let base = match mirror {
            Mirror::Official => self.mirrors.official.as_str(),
            Mirror::China => self
                .mirrors
                .china
                .as_deref()
                .unwrap_or(self.mirrors.official.as_str()),
        };

        Some(ArtifactSource {
            version: entry.version.clone(),
            platform,
            url: format!(
                "{}/{}/local_installers/{}",
                base.trim_end_matches('/'),
                entry.release,
                entry.runfile
            ),
            file_name: entry.runfile.clone(),
            sha256: entry.sha256.clone(),
        })
    }
}
