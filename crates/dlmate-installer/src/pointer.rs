use anyhow::{Context, Result};
use dlmate_core::ToolkitVersion;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::fs_utils::{create_symlink, remove_file_if_exists};
use crate::layout::HostLayout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerState {
    Missing,
    Link(PathBuf),
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepointOutcome {
    pub previous: PointerState,
    pub moved_aside: Option<PathBuf>,
}

pub fn pointer_state(layout: &HostLayout) -> Result<PointerState> {
    let path = layout.active_pointer_path();
    let metadata = match fs::symlink_metadata(&path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(PointerState::Missing),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()));
        }
    };

    if metadata.file_type().is_symlink() {
        let target = fs::read_link(&path)
            .with_context(|| format!("failed to read symlink {}", path.display()))?;
        Ok(PointerState::Link(target))
    } else if metadata.is_dir() {
        Ok(PointerState::Directory)
    } else {
        Ok(PointerState::File)
    }
}

/// The version the active pointer resolves to. Only a symlink to a
/// `cuda-X.Y` directory counts.
pub fn read_active_pointer(layout: &HostLayout) -> Result<Option<ToolkitVersion>> {
    match pointer_state(layout)? {
        PointerState::Link(target) => Ok(target
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(ToolkitVersion::from_install_dir_name)),
        _ => Ok(None),
    }
}

/// Points `<install_base>/cuda` at `version`'s install directory. A symlink is
/// replaced atomically; a real directory or file is renamed aside first and
/// never deleted.
pub fn repoint_active_pointer(
    layout: &HostLayout,
    version: &ToolkitVersion,
) -> Result<RepointOutcome> {
    let pointer = layout.active_pointer_path();
    let target = layout.install_dir(version);
    let previous = pointer_state(layout)?;

    let moved_aside = match previous {
        PointerState::Directory | PointerState::File => {
            let aside = layout.next_aside_path();
            fs::rename(&pointer, &aside).with_context(|| {
                format!(
                    "failed to move {} aside to {}",
                    pointer.display(),
                    aside.display()
                )
            })?;
            warn!(
                pointer = %pointer.display(),
                aside = %aside.display(),
                "active pointer was not a symlink; moved it aside"
            );
            Some(aside)
        }
        PointerState::Missing | PointerState::Link(_) => None,
    };

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos())
        .unwrap_or_default();
    let tmp_link = layout
        .install_base()
        .join(format!(".cuda.tmp-{}-{nanos}", std::process::id()));
    remove_file_if_exists(&tmp_link)
        .with_context(|| format!("failed to clear {}", tmp_link.display()))?;
    create_symlink(&target, &tmp_link)?;
    if let Err(err) = fs::rename(&tmp_link, &pointer) {
        let _ = remove_file_if_exists(&tmp_link);
        return Err(err).with_context(|| {
            format!(
                "failed to point {} at {}",
                pointer.display(),
                target.display()
            )
        });
    }

    info!(version = %version, pointer = %pointer.display(), "active CUDA pointer updated");
    Ok(RepointOutcome {
        previous,
        moved_aside,
    })
}
