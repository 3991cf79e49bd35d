use anyhow::{anyhow, Context, Result};
use dlmate_core::ToolkitVersion;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::warn;
use wait_timeout::ChildExt;

use crate::switch::ToolkitInstaller;

const CANCEL_POLL: Duration = Duration::from_millis(200);
#[cfg(unix)]
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Runs NVIDIA's `.run` installer in silent toolkit-only mode.
#[derive(Debug, Clone, Copy)]
pub struct RunfileInstaller {
    use_sudo: bool,
}

impl RunfileInstaller {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }
}

impl ToolkitInstaller for RunfileInstaller {
    fn install(
        &self,
        artifact: &Path,
        version: &ToolkitVersion,
        install_dir: &Path,
        cancel: &AtomicBool,
    ) -> Result<()> {
        if let Some(parent) = install_dir.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create install parent: {}", parent.display()))?;
        }
        let mut command = build_runfile_command(artifact, install_dir, self.use_sudo);
        run_command(&mut command, &format!("CUDA {version} installer failed"), cancel)
    }
}

pub(crate) fn build_runfile_command(artifact: &Path, install_dir: &Path, use_sudo: bool) -> Command {
    let mut command = if use_sudo {
        let mut command = Command::new("sudo");
        command.arg("sh");
        command
    } else {
        Command::new("sh")
    };
    command
        .arg(artifact)
        .arg("--silent")
        .arg("--toolkit")
        .arg(format!("--toolkitpath={}", install_dir.display()))
        .arg("--no-opengl-libs");
    command
}

/// Runs `command` to completion, or terminates it once `cancel` is set so
/// nothing keeps writing after the transaction rolls back.
pub(crate) fn run_command(
    command: &mut Command,
    context_message: &str,
    cancel: &AtomicBool,
) -> Result<()> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = loop {
        if cancel.load(Ordering::SeqCst) {
            terminate(&mut child);
            return Err(anyhow!("{context_message}: cancelled, installer process stopped"));
        }
        match child.wait_timeout(CANCEL_POLL) {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                terminate(&mut child);
                return Err(err).with_context(|| format!("{context_message}: failed waiting"));
            }
        }
    };

    if status.success() {
        return Ok(());
    }
    let stdout = collect(stdout);
    let stderr = collect(stderr);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        status,
        stdout.trim(),
        stderr.trim()
    ))
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = pipe.read_to_end(&mut buffer);
            String::from_utf8_lossy(&buffer).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// SIGTERM first, which sudo relays to the runfile, then SIGKILL.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        let pid = child.id() as libc::pid_t;
        // SAFETY: `pid` names a child this process spawned and has not reaped.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        if let Ok(Some(_)) = child.wait_timeout(TERMINATE_GRACE) {
            return;
        }
    }
    if let Err(err) = child.kill() {
        warn!(pid = child.id(), error = %err, "failed to kill installer process");
    }
    let _ = child.wait();
}
