use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, warn};

use crate::transactions::{log_report, TransactionEngine};

/// Exit status used after an interrupt, matching shells' 128 + SIGINT.
pub const INTERRUPT_EXIT_CODE: i32 = 130;

/// How long the handler waits for the owning thread to roll back before it
/// rolls back on its own.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);
static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static ACTIVE: Mutex<BTreeMap<PathBuf, ActiveSlot>> = Mutex::new(BTreeMap::new());

type ActiveTable = BTreeMap<PathBuf, ActiveSlot>;

struct ActiveSlot {
    engine: TransactionEngine,
    txid: String,
    cancel: Arc<AtomicBool>,
}

pub(crate) fn register(engine: TransactionEngine, txid: &str, cancel: Arc<AtomicBool>) {
    let state_root = engine.layout().state_root().to_path_buf();
    lock_active().insert(
        state_root,
        ActiveSlot {
            engine,
            txid: txid.to_string(),
            cancel,
        },
    );
}

pub(crate) fn is_registered(state_root: &Path, txid: &str) -> bool {
    lock_active()
        .get(state_root)
        .is_some_and(|slot| slot.txid == txid)
}

/// Runs `resolve` while holding the slot table so a forced rollback cannot
/// touch the same transaction concurrently, then clears the slot.
pub(crate) fn settle<T>(state_root: &Path, txid: &str, resolve: impl FnOnce() -> T) -> T {
    let mut active = lock_active();
    let value = resolve();
    if active
        .get(state_root)
        .is_some_and(|slot| slot.txid == txid)
    {
        active.remove(state_root);
    }
    value
}

/// Flags the transaction running under `state_root` so its body stops at
/// the next cancellation check. Returns `false` when nothing is in flight.
#[cfg(test)]
pub(crate) fn request_cancel(state_root: &Path) -> bool {
    match lock_active().get(state_root) {
        Some(slot) => {
            slot.cancel.store(true, Ordering::SeqCst);
            true
        }
        None => false,
    }
}

/// Whether a termination signal arrived in this process.
pub fn interrupt_requested() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Cancels whatever is in flight, waits for the owning threads to roll back
/// and exits. Installed once per process on SIGINT, SIGTERM and SIGHUP.
pub fn install_interrupt_handler() {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }

    let result = ctrlc::set_handler(|| {
        INTERRUPTED.store(true, Ordering::SeqCst);
        let pending = cancel_all();
        if pending > 0 {
            warn!(count = pending, "interrupted; waiting for in-flight transaction to roll back");
            if !wait_until_settled(SHUTDOWN_GRACE) {
                // Held through exit so the owning thread cannot resolve
                // these transactions afterwards.
                let _active = force_rollback_all();
                std::process::exit(INTERRUPT_EXIT_CODE);
            }
        }
        std::process::exit(INTERRUPT_EXIT_CODE);
    });
    if let Err(err) = result {
        warn!(error = %err, "failed to install interrupt handler");
    }
}

fn cancel_all() -> usize {
    let active = lock_active();
    for slot in active.values() {
        slot.cancel.store(true, Ordering::SeqCst);
    }
    active.len()
}

fn wait_until_settled(grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        if lock_active().is_empty() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(SHUTDOWN_POLL);
    }
}

fn force_rollback_all() -> MutexGuard<'static, ActiveTable> {
    let mut active = lock_active();
    let slots = std::mem::take(&mut *active);
    if !slots.is_empty() {
        error!(count = slots.len(), "transaction did not stop in time; rolling back from the signal handler");
    }
    for slot in slots.into_values() {
        match slot.engine.rollback_unlocked(&slot.txid) {
            Ok(report) => log_report(&report),
            Err(err) => {
                error!(txid = %slot.txid, error = %format!("{err:#}"), "rollback after interrupt failed");
            }
        }
    }
    active
}

fn lock_active() -> MutexGuard<'static, ActiveTable> {
    ACTIVE.lock().unwrap_or_else(PoisonError::into_inner)
}
