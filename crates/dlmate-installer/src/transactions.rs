use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use crate::actions::RollbackAction;
use crate::env::{apply_captured, capture_tracked, EnvStore};
use crate::error::EngineError;
use crate::fs_utils::{remove_path_if_exists, write_durable};
use crate::interrupt;
use crate::layout::HostLayout;
use crate::pointer::{read_active_pointer, repoint_active_pointer};
use crate::snapshot::{SnapshotRequest, SnapshotStore};

pub const TRANSACTION_RECORD_VERSION: u32 = 1;

static TXID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Committed) | (Self::Active, Self::RolledBack)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub snapshot_dir: PathBuf,
    pub paths_backed_up: Vec<PathBuf>,
    pub env_backed_up: Vec<String>,
    pub configs_backed_up: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub version: u32,
    pub txid: String,
    pub operation: String,
    pub status: TransactionStatus,
    pub started_at_unix: u64,
    #[serde(default)]
    pub finished_at_unix: Option<u64>,
    #[serde(default)]
    pub reverted_at_unix: Option<u64>,
    #[serde(default)]
    pub rollback_actions: Vec<RollbackAction>,
    #[serde(default)]
    pub backups: BackupInfo,
    #[serde(default)]
    pub rollback_failures: Vec<String>,
}

impl TransactionRecord {
    fn transition(&mut self, next: TransactionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                txid: self.txid.clone(),
                from: self.status,
                to: next,
            }
            .into());
        }
        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    NotFound,
    AlreadyRolledBack,
    /// A committed transaction whose revert already ran once.
    AlreadyReverted,
    RolledBack,
    /// A committed transaction was restored to its pre-operation state.
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackFailure {
    pub step: String,
    pub detail: String,
}

impl fmt::Display for RollbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub txid: String,
    pub outcome: RollbackOutcome,
    pub failures: Vec<RollbackFailure>,
}

impl RollbackReport {
    fn noop(txid: &str, outcome: RollbackOutcome) -> Self {
        Self {
            txid: txid.to_string(),
            outcome,
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn needs_manual_intervention(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn restored_state(&self) -> bool {
        matches!(
            self.outcome,
            RollbackOutcome::RolledBack | RollbackOutcome::Reverted
        )
    }
}

#[derive(Clone)]
pub struct TransactionEngine {
    layout: HostLayout,
    env: Arc<dyn EnvStore>,
    snapshots: SnapshotStore,
}

impl fmt::Debug for TransactionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionEngine")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl TransactionEngine {
    pub fn new(layout: HostLayout, env: Arc<dyn EnvStore>) -> Self {
        let snapshots = SnapshotStore::new(layout.clone());
        Self {
            layout,
            env,
            snapshots,
        }
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    pub fn env(&self) -> &dyn EnvStore {
        self.env.as_ref()
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Takes the machine-wide lock, snapshots every protected path, the
    /// tracked environment and the config files, then persists an `active`
    /// record. Nothing is written when any of that fails.
    pub fn begin(&self, operation: &str) -> Result<Transaction> {
        self.layout.ensure_state_dirs()?;
        let lock = self.try_lock()?.ok_or_else(|| EngineError::TransactionInProgress {
            path: self.layout.transaction_lock_path(),
        })?;

        let txid = next_txid(operation)?;
        let request = SnapshotRequest {
            paths: self.layout.protected_paths()?,
            environment: capture_tracked(self.env.as_ref()),
            configs: self.layout.config_files(),
        };
        let manifest = self
            .snapshots
            .capture(&txid, &request)
            .with_context(|| format!("failed to snapshot state for '{operation}'"))?;

        let record = TransactionRecord {
            version: TRANSACTION_RECORD_VERSION,
            txid: txid.clone(),
            operation: operation.to_string(),
            status: TransactionStatus::Active,
            started_at_unix: current_unix_timestamp()?,
            finished_at_unix: None,
            reverted_at_unix: None,
            rollback_actions: Vec::new(),
            backups: BackupInfo {
                snapshot_dir: self.snapshots.snapshot_dir(&txid),
                paths_backed_up: manifest
                    .paths
                    .iter()
                    .map(|path| path.original.clone())
                    .collect(),
                env_backed_up: request.environment.keys().cloned().collect(),
                configs_backed_up: manifest
                    .configs
                    .iter()
                    .filter(|config| config.stored.is_some())
                    .map(|config| config.original.clone())
                    .collect(),
            },
            rollback_failures: Vec::new(),
        };
        if let Err(err) = self.write_record(&record) {
            let _ = self.snapshots.remove(&txid);
            return Err(err);
        }

        let cancel = Arc::new(AtomicBool::new(false));
        interrupt::register(self.clone(), &txid, cancel.clone());
        info!(txid = %txid, operation, "transaction started");
        Ok(Transaction {
            engine: self.clone(),
            record,
            lock: Some(lock),
            resolved: false,
            cancel,
        })
    }

    /// Runs `body` inside a transaction: commits on `Ok`, rolls back on `Err`
    /// and hands the original error back to the caller. A body that failed
    /// after cancellation surfaces as [`EngineError::Interrupted`].
    pub fn run_protected<T>(
        &self,
        operation: &str,
        body: impl FnOnce(&mut Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut tx = self.begin(operation)?;
        match body(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                let txid = tx.txid().to_string();
                let interrupted = tx.is_cancelled();
                match tx.rollback() {
                    Ok(report) => log_report(&report),
                    Err(rollback_err) => {
                        error!(txid = %txid, error = %format!("{rollback_err:#}"), "rollback failed");
                    }
                }
                if interrupted && !is_interrupted(&err) {
                    return Err(err.context(EngineError::Interrupted { txid }));
                }
                Err(err)
            }
        }
    }

    /// Restores the snapshot of `txid`. Safe to call repeatedly: a missing or
    /// already rolled back record is a no-op.
    pub fn rollback(&self, txid: &str) -> Result<RollbackReport> {
        match self.try_lock()? {
            Some(lock) => {
                let report = self.rollback_unlocked(txid);
                drop(lock);
                report
            }
            None if interrupt::is_registered(self.layout.state_root(), txid) => {
                interrupt::settle(self.layout.state_root(), txid, || {
                    self.rollback_unlocked(txid)
                })
            }
            None => Err(EngineError::TransactionInProgress {
                path: self.layout.transaction_lock_path(),
            }
            .into()),
        }
    }

    /// Rolls back every record left `active` by a process that died. Skips
    /// the pass entirely while another process holds the lock.
    pub fn recover_interrupted(&self) -> Result<Vec<RollbackReport>> {
        if !self.layout.transactions_dir().exists() {
            return Ok(Vec::new());
        }
        let Some(lock) = self.try_lock()? else {
            debug!("transaction lock held by another process; skipping recovery");
            return Ok(Vec::new());
        };

        let mut reports = Vec::new();
        for record in self.list_records()? {
            if record.status != TransactionStatus::Active {
                continue;
            }
            warn!(txid = %record.txid, operation = %record.operation, "recovering interrupted transaction");
            let report = self.rollback_unlocked(&record.txid)?;
            log_report(&report);
            reports.push(report);
        }
        drop(lock);
        Ok(reports)
    }

    pub(crate) fn rollback_unlocked(&self, txid: &str) -> Result<RollbackReport> {
        let Some(mut record) = self.read_record(txid)? else {
            debug!(txid, "no transaction record; nothing to roll back");
            return Ok(RollbackReport::noop(txid, RollbackOutcome::NotFound));
        };
        if record.status == TransactionStatus::RolledBack {
            debug!(txid, "transaction already rolled back");
            return Ok(RollbackReport::noop(txid, RollbackOutcome::AlreadyRolledBack));
        }
        if record.reverted_at_unix.is_some() {
            debug!(txid, "transaction already reverted");
            return Ok(RollbackReport::noop(txid, RollbackOutcome::AlreadyReverted));
        }

        let mut failures = Vec::new();

        match self.layout.protected_paths() {
            Ok(current) => {
                for failure in self.snapshots.restore_paths(txid, &current) {
                    failures.push(step_failure(
                        "restore paths",
                        format!("{}: {}", failure.path.display(), failure.detail),
                    ));
                }
            }
            Err(err) => failures.push(step_failure("restore paths", format!("{err:#}"))),
        }

        match self.snapshots.read_environment(txid) {
            Ok(captured) => apply_captured(self.env.as_ref(), &captured),
            Err(err) => failures.push(step_failure("restore environment", format!("{err:#}"))),
        }

        for failure in self.snapshots.restore_configs(txid) {
            failures.push(step_failure(
                "restore configs",
                format!("{}: {}", failure.path.display(), failure.detail),
            ));
        }

        for action in record.rollback_actions.iter().rev() {
            debug!(txid, action = %action.describe(), "running rollback action");
            if let Err(err) = self.execute_action(action) {
                failures.push(step_failure(&action.describe(), format!("{err:#}")));
            }
        }

        for failure in &failures {
            warn!(txid, step = %failure.step, detail = %failure.detail, "rollback step failed");
        }

        let now = current_unix_timestamp()?;
        let outcome = if record.status == TransactionStatus::Committed {
            record.reverted_at_unix = Some(now);
            RollbackOutcome::Reverted
        } else {
            record.transition(TransactionStatus::RolledBack)?;
            record.finished_at_unix = Some(now);
            RollbackOutcome::RolledBack
        };
        record.rollback_failures = failures.iter().map(ToString::to_string).collect();
        self.write_record(&record)?;

        Ok(RollbackReport {
            txid: txid.to_string(),
            outcome,
            failures,
        })
    }

    fn execute_action(&self, action: &RollbackAction) -> Result<()> {
        match action {
            RollbackAction::RestoreActiveVersion { version } => {
                if read_active_pointer(&self.layout)?.as_ref() == Some(version) {
                    return Ok(());
                }
                let install_dir = self.layout.install_dir(version);
                if !install_dir.is_dir() {
                    return Err(anyhow!(
                        "install directory for CUDA {version} is missing: {}",
                        install_dir.display()
                    ));
                }
                repoint_active_pointer(&self.layout, version)?;
                Ok(())
            }
            RollbackAction::RemovePath { path } => {
                remove_path_if_exists(path)?;
                Ok(())
            }
            RollbackAction::RemoveCachedVersion { version } => {
                remove_path_if_exists(&self.layout.version_cache_path(version))?;
                Ok(())
            }
        }
    }

    pub fn read_record(&self, txid: &str) -> Result<Option<TransactionRecord>> {
        let path = self.layout.transaction_record_path(txid);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read transaction record: {}", path.display())
                });
            }
        };
        let record = serde_json::from_slice(&raw)
            .with_context(|| format!("failed parsing transaction record: {}", path.display()))?;
        Ok(Some(record))
    }

    fn write_record(&self, record: &TransactionRecord) -> Result<()> {
        let raw = serde_json::to_vec_pretty(record)
            .with_context(|| format!("failed to serialize transaction '{}'", record.txid))?;
        write_durable(&self.layout.transaction_record_path(&record.txid), &raw)
    }

    fn update_record(
        &self,
        txid: &str,
        update: impl FnOnce(&mut TransactionRecord) -> Result<()>,
    ) -> Result<TransactionRecord> {
        let mut record = self
            .read_record(txid)?
            .ok_or_else(|| anyhow!("transaction record not found for '{txid}'"))?;
        update(&mut record)?;
        self.write_record(&record)?;
        Ok(record)
    }

    /// Every readable record, oldest first. Unparseable files are skipped.
    pub fn list_records(&self) -> Result<Vec<TransactionRecord>> {
        let dir = self.layout.transactions_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()));
            }
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to iterate {}", dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") || !path.is_file() {
                continue;
            }
            let Some(txid) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match self.read_record(txid) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %format!("{err:#}"), "skipping unreadable transaction record");
                }
            }
        }
        records.sort_by(|left, right| {
            left.started_at_unix
                .cmp(&right.started_at_unix)
                .then_with(|| left.txid.cmp(&right.txid))
        });
        Ok(records)
    }

    pub fn latest_committed(&self) -> Result<Option<TransactionRecord>> {
        Ok(self
            .list_records()?
            .into_iter()
            .filter(|record| record.status == TransactionStatus::Committed)
            .last())
    }

    /// Deletes all but the newest `keep` finished records and their snapshots.
    pub fn prune(&self, keep: usize) -> Result<Vec<String>> {
        let Some(lock) = self.try_lock()? else {
            return Err(EngineError::TransactionInProgress {
                path: self.layout.transaction_lock_path(),
            }
            .into());
        };

        let finished = self
            .list_records()?
            .into_iter()
            .filter(|record| record.status.is_terminal())
            .collect::<Vec<_>>();
        let excess = finished.len().saturating_sub(keep);

        let mut pruned = Vec::new();
        for record in finished.into_iter().take(excess) {
            self.snapshots.remove(&record.txid)?;
            let path = self.layout.transaction_record_path(&record.txid);
            remove_path_if_exists(&path)?;
            info!(txid = %record.txid, "pruned transaction");
            pruned.push(record.txid);
        }
        drop(lock);
        Ok(pruned)
    }

    fn try_lock(&self) -> Result<Option<File>> {
        let path = self.layout.transaction_lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open transaction lock: {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(err) if is_contended(&err) => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("failed to lock transaction lock: {}", path.display())),
        }
    }
}

/// Handle for one in-flight transaction. Dropping it unresolved rolls the
/// transaction back.
#[derive(Debug)]
pub struct Transaction {
    engine: TransactionEngine,
    record: TransactionRecord,
    lock: Option<File>,
    resolved: bool,
    cancel: Arc<AtomicBool>,
}

impl Transaction {
    pub fn txid(&self) -> &str {
        &self.record.txid
    }

    pub fn record(&self) -> &TransactionRecord {
        &self.record
    }

    pub fn layout(&self) -> &HostLayout {
        self.engine.layout()
    }

    pub fn env(&self) -> &dyn EnvStore {
        self.engine.env()
    }

    /// Set when the process was asked to stop. Long-running steps poll it and
    /// bail out so the owning thread performs the rollback.
    pub fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(EngineError::Interrupted {
                txid: self.record.txid.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Appends a compensating action and persists it before returning, so a
    /// crash right after the mutation still knows how to undo it.
    pub fn add_rollback_action(&mut self, action: RollbackAction) -> Result<()> {
        let txid = self.record.txid.clone();
        let record = self.engine.update_record(&txid, |record| {
            if record.status != TransactionStatus::Active {
                return Err(anyhow!(
                    "cannot register rollback action on {} transaction '{txid}'",
                    record.status
                ));
            }
            record.rollback_actions.push(action.clone());
            Ok(())
        })?;
        debug!(txid = %txid, action = %action.describe(), "registered rollback action");
        self.record = record;
        Ok(())
    }

    pub fn commit(mut self) -> Result<()> {
        let state_root = self.engine.layout().state_root().to_path_buf();
        let txid = self.record.txid.clone();
        let engine = self.engine.clone();

        let committed = interrupt::settle(&state_root, &txid, || {
            engine.update_record(&txid, |record| {
                record.transition(TransactionStatus::Committed)?;
                record.finished_at_unix = Some(current_unix_timestamp()?);
                Ok(())
            })
        })?;

        self.record = committed;
        self.resolved = true;
        self.release_lock();
        info!(txid = %txid, "transaction committed");
        Ok(())
    }

    pub fn rollback(mut self) -> Result<RollbackReport> {
        self.resolved = true;
        let report = self.settle_rollback();
        self.release_lock();
        report
    }

    /// Releases the lock and slot without resolving, leaving the record
    /// `active` the way a killed process would.
    #[cfg(test)]
    pub(crate) fn abandon(mut self) {
        let state_root = self.engine.layout().state_root().to_path_buf();
        interrupt::settle(&state_root, &self.record.txid, || ());
        self.resolved = true;
        self.release_lock();
    }

    fn settle_rollback(&self) -> Result<RollbackReport> {
        let state_root = self.engine.layout().state_root();
        interrupt::settle(state_root, self.txid(), || {
            self.engine.rollback_unlocked(self.txid())
        })
    }

    fn release_lock(&mut self) {
        if let Some(lock) = self.lock.take() {
            let _ = FileExt::unlock(&lock);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        warn!(txid = %self.record.txid, "transaction dropped while active; rolling back");
        match self.settle_rollback() {
            Ok(report) => log_report(&report),
            Err(err) => {
                error!(txid = %self.record.txid, error = %format!("{err:#}"), "rollback failed");
            }
        }
        self.release_lock();
    }
}

pub(crate) fn log_report(report: &RollbackReport) {
    if report.needs_manual_intervention() {
        error!(
            txid = %report.txid,
            failures = report.failures.len(),
            "rollback finished with failures; manual intervention required"
        );
    } else if report.restored_state() {
        info!(txid = %report.txid, outcome = ?report.outcome, "rollback finished");
    }
}

fn step_failure(step: &str, detail: String) -> RollbackFailure {
    RollbackFailure {
        step: step.to_string(),
        detail,
    }
}

fn is_interrupted(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::Interrupted { .. })
    )
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn next_txid(operation: &str) -> Result<String> {
    let seq = TXID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    Ok(format!(
        "tx-{}-{}-{}-{seq:06}",
        operation_slug(operation),
        current_unix_timestamp()?,
        std::process::id()
    ))
}

pub(crate) fn operation_slug(operation: &str) -> String {
    let mut slug = String::with_capacity(operation.len());
    for ch in operation.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "op".to_string()
    } else {
        slug.to_string()
    }
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}
