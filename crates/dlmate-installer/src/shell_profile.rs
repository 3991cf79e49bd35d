use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::Path;

pub const BLOCK_BEGIN: &str = "# >>> DeepLearningMate CUDA Configuration >>>";
pub const BLOCK_END: &str = "# <<< DeepLearningMate CUDA Configuration <<<";
const LEGACY_HEADER: &str = "# DeepLearningMate CUDA Configuration";
const LEGACY_EXPORTS: [&str; 4] = [
    "export CUDA_HOME=",
    "export CUDA_ROOT=",
    "export PATH=",
    "export LD_LIBRARY_PATH=",
];

pub fn render_block(install_dir: &Path) -> String {
    let dir = install_dir.display();
    format!(
        "{BLOCK_BEGIN}\nexport CUDA_HOME={dir}\nexport CUDA_ROOT={dir}\nexport PATH={dir}/bin:$PATH\nexport LD_LIBRARY_PATH={dir}/lib64:$LD_LIBRARY_PATH\n{BLOCK_END}\n"
    )
}

/// Drops the managed block and the unmarked block older releases appended.
/// A begin marker with no end marker only loses the marker and its CUDA
/// exports; whatever else follows it is kept.
pub fn strip_managed_block(contents: &str) -> String {
    let mut kept = Vec::new();
    let mut open_block: Option<Vec<&str>> = None;
    let mut in_legacy = false;

    for line in contents.lines() {
        let trimmed = line.trim();
        if let Some(pending) = open_block.as_mut() {
            if trimmed == BLOCK_END {
                open_block = None;
            } else {
                pending.push(line);
            }
            continue;
        }
        if trimmed == BLOCK_BEGIN {
            open_block = Some(Vec::new());
            in_legacy = false;
            continue;
        }
        if trimmed == LEGACY_HEADER {
            in_legacy = true;
            continue;
        }
        if in_legacy && is_managed_export(trimmed) {
            continue;
        }
        in_legacy = false;
        kept.push(line);
    }

    if let Some(pending) = open_block {
        kept.extend(
            pending
                .into_iter()
                .filter(|line| !is_managed_export(line.trim())),
        );
    }

    let mut stripped = kept.join("\n");
    let trimmed_len = stripped.trim_end().len();
    stripped.truncate(trimmed_len);
    if !stripped.is_empty() {
        stripped.push('\n');
    }
    stripped
}

pub fn apply_managed_block(contents: &str, install_dir: &Path) -> String {
    let base = strip_managed_block(contents);
    let block = render_block(install_dir);
    if base.is_empty() {
        block
    } else {
        format!("{base}\n{block}")
    }
}

/// Rewrites `path` so it carries exactly one managed block for
/// `install_dir`. Returns whether the file changed.
pub fn write_profile(path: &Path, install_dir: &Path) -> Result<bool> {
    let current = read_profile(path)?;
    let updated = apply_managed_block(current.as_deref().unwrap_or_default(), install_dir);
    if current.as_deref() == Some(updated.as_str()) {
        return Ok(false);
    }
    fs::write(path, updated)
        .with_context(|| format!("failed to update shell profile {}", path.display()))?;
    Ok(true)
}

pub fn clear_profile(path: &Path) -> Result<bool> {
    let Some(current) = read_profile(path)? else {
        return Ok(false);
    };
    let updated = strip_managed_block(&current);
    if updated == current {
        return Ok(false);
    }
    fs::write(path, updated)
        .with_context(|| format!("failed to update shell profile {}", path.display()))?;
    Ok(true)
}

pub fn read_managed_install_dir(contents: &str) -> Option<String> {
    let mut in_block = false;
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed == BLOCK_BEGIN {
            in_block = true;
        } else if trimmed == BLOCK_END {
            in_block = false;
        } else if in_block {
            if let Some(dir) = trimmed.strip_prefix("export CUDA_HOME=") {
                return Some(dir.to_string());
            }
        }
    }
    None
}

fn is_managed_export(trimmed: &str) -> bool {
    LEGACY_EXPORTS
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
        && trimmed.contains("cuda")
}

fn read_profile(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read shell profile {}", path.display()))
        }
    }
}
