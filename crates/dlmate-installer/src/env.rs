use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use crate::layout::is_protected_entry_name;

pub const TRACKED_ENV_KEYS: [&str; 4] = ["PATH", "LD_LIBRARY_PATH", "CUDA_HOME", "CUDA_ROOT"];

/// `None` records a variable that was unset, which restores differently from
/// one that was set to the empty string.
pub type CapturedEnvironment = BTreeMap<String, Option<String>>;

pub trait EnvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvStore for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var_os(key).map(|value| value.to_string_lossy().into_owned())
    }

    fn set(&self, key: &str, value: &str) {
        std::env::set_var(key, value);
    }

    fn remove(&self, key: &str) {
        std::env::remove_var(key);
    }
}

#[derive(Debug, Default)]
pub struct MemoryEnv {
    vars: Mutex<BTreeMap<String, String>>,
}

impl MemoryEnv {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let vars = pairs
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Self {
            vars: Mutex::new(vars),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EnvStore for MemoryEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

pub fn capture_tracked(env: &dyn EnvStore) -> CapturedEnvironment {
    TRACKED_ENV_KEYS
        .iter()
        .map(|key| (key.to_string(), env.get(key)))
        .collect()
}

pub fn apply_captured(env: &dyn EnvStore, captured: &CapturedEnvironment) {
    for (key, value) in captured {
        match value {
            Some(value) => env.set(key, value),
            None => env.remove(key),
        }
    }
}

pub fn differs_from_captured(env: &dyn EnvStore, captured: &CapturedEnvironment) -> bool {
    captured
        .iter()
        .any(|(key, value)| env.get(key).as_deref() != value.as_deref())
}

/// Puts `entry` at the front of a colon-separated search path, dropping
/// entries that point into other toolkit installs under `install_base`.
pub fn with_toolkit_path_entry(
    current: Option<&str>,
    entry: &Path,
    install_base: &Path,
    leaf: &str,
) -> String {
    let entry = entry.to_string_lossy();
    let mut parts = vec![entry.to_string()];
    if let Some(current) = current {
        parts.extend(
            current
                .split(':')
                .filter(|part| !part.is_empty())
                .filter(|part| *part != entry)
                .filter(|part| !is_toolkit_path_entry(part, install_base, leaf))
                .map(ToOwned::to_owned),
        );
    }
    parts.join(":")
}

/// Drops every entry that points into a toolkit install under `install_base`.
pub fn without_toolkit_path_entries(current: &str, install_base: &Path, leaf: &str) -> String {
    current
        .split(':')
        .filter(|part| !part.is_empty())
        .filter(|part| !is_toolkit_path_entry(part, install_base, leaf))
        .collect::<Vec<_>>()
        .join(":")
}

fn is_toolkit_path_entry(part: &str, install_base: &Path, leaf: &str) -> bool {
    let path = Path::new(part.trim_end_matches('/'));
    if path.file_name().and_then(|name| name.to_str()) != Some(leaf) {
        return false;
    }
    let Some(toolkit_dir) = path.parent() else {
        return false;
    };
    if toolkit_dir.parent() != Some(install_base) {
        return false;
    }
    toolkit_dir
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(is_protected_entry_name)
}
