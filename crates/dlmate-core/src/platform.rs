use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const OS_RELEASE_PATH: &str = "/etc/os-release";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PlatformTag {
    Ubuntu20,
    Ubuntu22,
}

impl PlatformTag {
    pub const FALLBACK: Self = Self::Ubuntu22;

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ubuntu20 => "ubuntu20",
            Self::Ubuntu22 => "ubuntu22",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "ubuntu20" => Some(Self::Ubuntu20),
            "ubuntu22" => Some(Self::Ubuntu22),
            _ => None,
        }
    }

    /// Maps an `os-release` document to a supported tag. Returns `None` when
    /// the distribution or release is not one the catalog knows about.
    pub fn from_os_release(raw: &str) -> Option<Self> {
        let mut id = None;
        let mut version_id = None;
        for line in raw.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "ID" => id = Some(value.to_ascii_lowercase()),
                "VERSION_ID" => version_id = Some(value.to_string()),
                _ => {}
            }
        }

        if id.as_deref() != Some("ubuntu") {
            return None;
        }
        let version_id = version_id?;
        if version_id.starts_with("20.") {
            Some(Self::Ubuntu20)
        } else if version_id.starts_with("22.") {
            Some(Self::Ubuntu22)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformDetection {
    pub tag: PlatformTag,
    pub exact: bool,
}

pub fn detect_host_platform(os_release_path: &Path) -> PlatformDetection {
    let detected = fs::read_to_string(os_release_path)
        .ok()
        .and_then(|raw| PlatformTag::from_os_release(&raw));
    match detected {
        Some(tag) => PlatformDetection { tag, exact: true },
        None => PlatformDetection {
            tag: PlatformTag::FALLBACK,
            exact: false,
        },
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mirror {
    #[default]
    Official,
    China,
}

impl Mirror {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Official => "official",
            Self::China => "china",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "official" => Some(Self::Official),
            "china" => Some(Self::China),
            _ => None,
        }
    }
}
