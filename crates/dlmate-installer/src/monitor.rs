use anyhow::Result;
use dlmate_core::ToolkitVersion;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};
use wait_timeout::ChildExt;

use crate::detect::parse_nvcc_release;
use crate::layout::HostLayout;
use crate::transactions::{log_report, RollbackReport, TransactionEngine};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy { version: Option<ToolkitVersion> },
    Unhealthy { reason: String },
}

pub trait HealthProbe: Send + Sync {
    fn probe(&self) -> HealthStatus;
}

/// Runs `nvcc --version` from the active toolkit, or from `PATH` when no
/// active pointer exists.
#[derive(Debug, Clone)]
pub struct NvccProbe {
    program: PathBuf,
    timeout: Duration,
}

impl NvccProbe {
    pub fn for_layout(layout: &HostLayout) -> Self {
        let marker = layout.active_marker_path();
        let program = if marker.is_file() {
            marker
        } else {
            PathBuf::from("nvcc")
        };
        Self {
            program,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl HealthProbe for NvccProbe {
    fn probe(&self) -> HealthStatus {
        let program = self.program.display().to_string();
        let mut child = match Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                return HealthStatus::Unhealthy {
                    reason: format!("failed to run {program}: {err}"),
                };
            }
        };

        match child.wait_timeout(self.timeout) {
            Ok(Some(status)) if status.success() => {
                let mut stdout = String::new();
                if let Some(mut pipe) = child.stdout.take() {
                    let _ = pipe.read_to_string(&mut stdout);
                }
                HealthStatus::Healthy {
                    version: parse_nvcc_release(&stdout),
                }
            }
            Ok(Some(status)) => HealthStatus::Unhealthy {
                reason: format!("{program} --version exited with {status}"),
            },
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                HealthStatus::Unhealthy {
                    reason: format!(
                        "{program} --version timed out after {}s",
                        self.timeout.as_secs()
                    ),
                }
            }
            Err(err) => {
                let _ = child.kill();
                HealthStatus::Unhealthy {
                    reason: format!("failed waiting for {program}: {err}"),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    Healthy { version: Option<ToolkitVersion> },
    NothingToRecover { reason: String },
    /// The newest committed transaction was already reverted; it is not
    /// reverted a second time.
    AlreadyReverted { reason: String, txid: String },
    Recovered { reason: String, report: RollbackReport },
}

pub struct RecoveryMonitor {
    engine: TransactionEngine,
    probe: Box<dyn HealthProbe>,
    interval: Duration,
}

impl RecoveryMonitor {
    pub fn new(engine: TransactionEngine, probe: Box<dyn HealthProbe>, interval: Duration) -> Self {
        Self {
            engine,
            probe,
            interval,
        }
    }

    pub fn check_once(&self) -> Result<MonitorOutcome> {
        match self.probe.probe() {
            HealthStatus::Healthy { version } => Ok(MonitorOutcome::Healthy { version }),
            HealthStatus::Unhealthy { reason } => {
                warn!(reason = %reason, "CUDA health check failed");
                self.auto_recover(reason)
            }
        }
    }

    /// Reverts the most recent committed transaction.
    pub fn auto_recover(&self, reason: String) -> Result<MonitorOutcome> {
        let Some(record) = self.engine.latest_committed()? else {
            info!("no committed transaction to recover to");
            return Ok(MonitorOutcome::NothingToRecover { reason });
        };
        if record.reverted_at_unix.is_some() {
            info!(txid = %record.txid, "latest committed transaction already reverted");
            return Ok(MonitorOutcome::AlreadyReverted {
                reason,
                txid: record.txid,
            });
        }

        info!(txid = %record.txid, operation = %record.operation, "reverting latest committed transaction");
        let report = self.engine.rollback(&record.txid)?;
        log_report(&report);
        Ok(MonitorOutcome::Recovered { reason, report })
    }

    /// Checks health every interval until `stop` is set.
    pub fn run(&self, stop: &AtomicBool) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "monitor started");
        while !stop.load(Ordering::SeqCst) {
            if let Err(err) = self.check_once() {
                error!(error = %format!("{err:#}"), "monitor check failed");
            }

            let mut waited = Duration::ZERO;
            while waited < self.interval && !stop.load(Ordering::SeqCst) {
                let step = STOP_POLL.min(self.interval - waited);
                std::thread::sleep(step);
                waited += step;
            }
        }
        info!("monitor stopped");
        Ok(())
    }
}
