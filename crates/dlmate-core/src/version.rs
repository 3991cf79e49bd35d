use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use semver::Version;
use serde::{Deserialize, Serialize};

const INSTALL_DIR_PREFIX: &str = "cuda-";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolkitVersion {
    version: Version,
}

impl ToolkitVersion {
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        let trimmed = input.trim();
        let (major, minor) = trimmed
            .split_once('.')
            .ok_or_else(|| anyhow!("toolkit version must look like <major>.<minor>: '{input}'"))?;
        if major.is_empty()
            || minor.is_empty()
            || !major.chars().all(|ch| ch.is_ascii_digit())
            || !minor.chars().all(|ch| ch.is_ascii_digit())
        {
            return Err(anyhow!(
                "toolkit version must look like <major>.<minor>: '{input}'"
            ));
        }

        let major = major
            .parse::<u64>()
            .with_context(|| format!("invalid toolkit major version: '{input}'"))?;
        let minor = minor
            .parse::<u64>()
            .with_context(|| format!("invalid toolkit minor version: '{input}'"))?;
        Ok(Self {
            version: Version::new(major, minor, 0),
        })
    }

    pub fn major(&self) -> u64 {
        self.version.major
    }

    pub fn minor(&self) -> u64 {
        self.version.minor
    }

    /// Directory name of this version under the install base, e.g. `cuda-11.8`.
    pub fn install_dir_name(&self) -> String {
        format!("{INSTALL_DIR_PREFIX}{self}")
    }

    pub fn from_install_dir_name(name: &str) -> Option<Self> {
        let raw = name.strip_prefix(INSTALL_DIR_PREFIX)?;
        Self::parse(raw).ok()
    }
}

impl fmt::Display for ToolkitVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.version.major, self.version.minor)
    }
}

impl FromStr for ToolkitVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ToolkitVersion {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ToolkitVersion> for String {
    fn from(value: ToolkitVersion) -> Self {
        value.to_string()
    }
}
