use super::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use dlmate_core::{PlatformTag, ToolkitVersion};

use crate::checkpoint::parse_freeze_output;
use crate::fs_utils::copy_tree_cancellable;
use crate::interrupt::request_cancel;
use crate::runfile::{build_runfile_command, run_command};
use crate::transactions::operation_slug;

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn build_test_layout_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    let sequence = TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "dlmate-installer-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    path
}

struct Fixture {
    root: PathBuf,
    layout: HostLayout,
    env: Arc<MemoryEnv>,
    engine: TransactionEngine,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn fixture() -> Fixture {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let root = build_test_layout_path(nanos);
    let layout = HostLayout::new(root.join("state"), root.join("install"), root.join("home"))
        .with_system_environment_file(root.join("etc").join("environment"));
    for dir in ["install", "home", "etc"] {
        fs::create_dir_all(root.join(dir)).expect("must create fixture dir");
    }
    let env = Arc::new(MemoryEnv::from_pairs([("PATH", "/usr/bin:/bin")]));
    let engine = TransactionEngine::new(layout.clone(), env.clone());
    Fixture {
        root,
        layout,
        env,
        engine,
    }
}

fn version(raw: &str) -> ToolkitVersion {
    ToolkitVersion::parse(raw).expect("must parse version")
}

fn install_fake_toolkit(layout: &HostLayout, raw: &str) -> PathBuf {
    let version = version(raw);
    let dir = layout.install_dir(&version);
    fs::create_dir_all(dir.join("bin")).expect("must create bin dir");
    fs::create_dir_all(dir.join("lib64")).expect("must create lib dir");
    fs::write(layout.toolkit_marker_path(&version), format!("nvcc {raw}\n"))
        .expect("must write nvcc");
    fs::write(dir.join("lib64").join("libcudart.so"), raw).expect("must write lib");
    dir
}

fn cache_fake_toolkit(layout: &HostLayout, raw: &str) -> PathBuf {
    let dir = layout.version_cache_path(&version(raw));
    fs::create_dir_all(dir.join("bin")).expect("must create cached bin dir");
    fs::write(dir.join("bin").join("nvcc"), format!("nvcc {raw}\n")).expect("must write nvcc");
    dir
}

fn point_at(layout: &HostLayout, raw: &str) {
    repoint_active_pointer(layout, &version(raw)).expect("must point at version");
}

fn tree_state(root: &Path) -> BTreeMap<String, String> {
    let mut state = BTreeMap::new();
    collect_tree(root, root, &mut state);
    state
}

fn collect_tree(base: &Path, path: &Path, state: &mut BTreeMap<String, String>) {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return;
    };
    let rel = path
        .strip_prefix(base)
        .expect("must be under base")
        .display()
        .to_string();
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(path).expect("must read link");
        state.insert(rel, format!("link:{}", target.display()));
    } else if metadata.is_dir() {
        state.insert(rel, "dir".to_string());
        for entry in fs::read_dir(path).expect("must read dir") {
            collect_tree(base, &entry.expect("must read entry").path(), state);
        }
    } else {
        let contents = fs::read(path).expect("must read file");
        state.insert(
            rel,
            format!("file:{}", String::from_utf8_lossy(&contents)),
        );
    }
}

fn config_state(layout: &HostLayout) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
    layout
        .config_files()
        .into_iter()
        .map(|path| {
            let contents = fs::read(&path).ok();
            (path, contents)
        })
        .collect()
}

fn engine_error(err: &anyhow::Error) -> &EngineError {
    err.downcast_ref::<EngineError>()
        .expect("error should carry an EngineError")
}

#[derive(Clone, Default)]
struct FakeFetcher {
    supported: Vec<ToolkitVersion>,
    fail: bool,
    fetched: Arc<Mutex<Vec<ToolkitVersion>>>,
}

impl ArtifactFetcher for FakeFetcher {
    fn supports(&self, version: &ToolkitVersion, _platform: PlatformTag) -> bool {
        self.supported.contains(version)
    }

    fn fetch(
        &self,
        version: &ToolkitVersion,
        _platform: PlatformTag,
        dest_dir: &Path,
        _cancel: &AtomicBool,
    ) -> Result<FetchedArtifact> {
        self.fetched
            .lock()
            .expect("fetch log")
            .push(version.clone());
        if self.fail {
            return Err(anyhow!("mirror unreachable"));
        }
        let path = dest_dir.join(format!("cuda_{version}_linux.run"));
        if path.is_file() {
            return Ok(FetchedArtifact {
                path,
                downloaded: false,
            });
        }
        fs::write(&path, "#!/bin/sh\n").expect("must write artifact");
        Ok(FetchedArtifact {
            path,
            downloaded: true,
        })
    }
}

#[derive(Clone, Default)]
struct FakeInstaller {
    fail: bool,
    /// Installs run under this state root request cancellation of their own
    /// transaction midway, the way the signal handler would.
    cancel_under: Option<PathBuf>,
}

impl ToolkitInstaller for FakeInstaller {
    fn install(
        &self,
        artifact: &Path,
        version: &ToolkitVersion,
        install_dir: &Path,
        cancel: &AtomicBool,
    ) -> Result<()> {
        assert!(artifact.is_file(), "artifact should exist before install");
        fs::create_dir_all(install_dir.join("bin"))?;
        if let Some(state_root) = &self.cancel_under {
            assert!(request_cancel(state_root), "transaction should be registered");
            assert!(cancel.load(Ordering::SeqCst));
            return Err(anyhow!("installer stopped"));
        }
        if self.fail {
            return Err(anyhow!("installer exited with status 1"));
        }
        fs::write(install_dir.join("bin").join("nvcc"), format!("nvcc {version}\n"))?;
        Ok(())
    }
}

fn switcher(fx: &Fixture, fetcher: FakeFetcher, installer: FakeInstaller) -> VersionSwitcher {
    VersionSwitcher::new(
        fx.engine.clone(),
        Box::new(fetcher),
        Box::new(installer),
        Box::new(LayoutDetector::new(fx.layout.clone())),
        PlatformTag::Ubuntu22,
    )
}

fn default_switcher(fx: &Fixture) -> VersionSwitcher {
    switcher(fx, FakeFetcher::default(), FakeInstaller::default())
}

#[test]
fn build_test_layout_path_disambiguates_same_timestamp_calls() {
    let first = build_test_layout_path(7);
    let second = build_test_layout_path(7);
    assert_ne!(first, second);
}

#[test]
fn transaction_status_only_moves_forward_from_active() {
    use TransactionStatus::*;
    assert!(Active.can_transition_to(Committed));
    assert!(Active.can_transition_to(RolledBack));
    for (from, to) in [
        (Committed, RolledBack),
        (Committed, Active),
        (RolledBack, Committed),
        (RolledBack, Active),
        (Active, Active),
    ] {
        assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
    }
}

#[test]
fn operation_slug_is_filesystem_safe() {
    assert_eq!(operation_slug("switch_cuda_12.1"), "switch-cuda-12-1");
    assert_eq!(operation_slug("  Restore Checkpoint!! "), "restore-checkpoint");
    assert_eq!(operation_slug("___"), "op");
}

#[test]
fn rollback_action_serializes_as_tagged_record() {
    let action = RollbackAction::RestoreActiveVersion {
        version: version("11.8"),
    };
    let raw = serde_json::to_string(&action).expect("must serialize");
    assert_eq!(raw, r#"{"type":"restore_active_version","version":"11.8"}"#);

    let parsed: RollbackAction =
        serde_json::from_str(r#"{"type":"remove_path","path":"/tmp/x"}"#).expect("must parse");
    assert_eq!(
        parsed,
        RollbackAction::RemovePath {
            path: PathBuf::from("/tmp/x")
        }
    );
}

#[cfg(unix)]
#[test]
fn begin_persists_active_record_with_snapshot() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "11.8");
    point_at(&fx.layout, "11.8");
    fs::write(fx.layout.home_dir().join(".bashrc"), "alias ll='ls -l'\n")
        .expect("must write bashrc");

    let tx = fx.engine.begin("switch_cuda_12.1").expect("must begin");
    assert!(tx.txid().starts_with("tx-switch-cuda-12-1-"));

    let record = fx
        .engine
        .read_record(tx.txid())
        .expect("must read record")
        .expect("record should exist");
    assert_eq!(record.status, TransactionStatus::Active);
    assert_eq!(record.version, TRANSACTION_RECORD_VERSION);
    assert!(record.finished_at_unix.is_none());
    assert_eq!(
        record.backups.paths_backed_up,
        vec![
            fx.layout.active_pointer_path(),
            fx.layout.install_dir(&version("11.8"))
        ]
    );
    assert_eq!(
        record.backups.configs_backed_up,
        vec![fx.layout.home_dir().join(".bashrc")]
    );
    assert_eq!(record.backups.env_backed_up.len(), TRACKED_ENV_KEYS.len());
    assert!(fx.engine.snapshots().exists(tx.txid()));

    let snapshot_pointer = record.backups.snapshot_dir.join("paths").join("cuda");
    assert!(
        fs::symlink_metadata(&snapshot_pointer)
            .expect("pointer should be captured")
            .file_type()
            .is_symlink(),
        "pointer must be captured as a link"
    );

    let txid = tx.txid().to_string();
    tx.commit().expect("must commit");
    let record = fx
        .engine
        .read_record(&txid)
        .expect("must read record")
        .expect("record should exist");
    assert_eq!(record.status, TransactionStatus::Committed);
    assert!(record.finished_at_unix.is_some());
    assert!(
        fx.engine.snapshots().exists(&txid),
        "commit keeps the snapshot"
    );
}

#[test]
fn second_begin_fails_fast_while_transaction_active() {
    let fx = fixture();
    let first = fx.engine.begin("first").expect("must begin");

    let err = fx
        .engine
        .begin("second")
        .expect_err("second transaction must be rejected");
    assert!(matches!(
        engine_error(&err),
        EngineError::TransactionInProgress { .. }
    ));
    let records = fx.engine.list_records().expect("must list");
    assert_eq!(records.len(), 1, "rejected begin must not write a record");

    first.commit().expect("must commit");
    fx.engine
        .begin("third")
        .expect("lock must be free after commit")
        .commit()
        .expect("must commit");
}

#[cfg(unix)]
#[test]
fn rollback_restores_filesystem_environment_and_configs_exactly() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "11.8");
    install_fake_toolkit(&fx.layout, "12.1");
    point_at(&fx.layout, "11.8");
    let bashrc = fx.layout.home_dir().join(".bashrc");
    let system_env = fx.root.join("etc").join("environment");
    fs::write(&bashrc, "export EDITOR=vim\n").expect("must write bashrc");
    fs::write(&system_env, "LANG=C.UTF-8\n").expect("must write environment");
    fx.env.set("CUDA_ROOT", "");

    let install_before = tree_state(fx.layout.install_base());
    let configs_before = config_state(&fx.layout);
    let env_before = fx.env.snapshot();

    let tx = fx.engine.begin("mutate_everything").expect("must begin");
    point_at(&fx.layout, "12.1");
    fs::remove_dir_all(fx.layout.install_dir(&version("11.8"))).expect("must delete install");
    install_fake_toolkit(&fx.layout, "99.9");
    fs::write(&bashrc, "garbage\n").expect("must overwrite bashrc");
    fs::remove_file(&system_env).expect("must remove environment");
    fs::write(fx.layout.home_dir().join(".zshrc"), "new\n").expect("must write zshrc");
    fx.env.set("CUDA_HOME", "/somewhere");
    fx.env.remove("PATH");
    fx.env.remove("CUDA_ROOT");

    let report = tx.rollback().expect("must roll back");
    assert_eq!(report.outcome, RollbackOutcome::RolledBack);
    assert!(report.is_clean(), "unexpected failures: {:?}", report.failures);

    assert_eq!(tree_state(fx.layout.install_base()), install_before);
    assert_eq!(config_state(&fx.layout), configs_before);
    assert_eq!(fx.env.snapshot(), env_before);
    assert_eq!(fx.env.get("CUDA_ROOT").as_deref(), Some(""));
    assert_eq!(fx.env.get("CUDA_HOME"), None);

    let record = fx
        .engine
        .read_record(&report.txid)
        .expect("must read record")
        .expect("record should exist");
    assert_eq!(record.status, TransactionStatus::RolledBack);
    assert!(record.finished_at_unix.is_some());
}

#[cfg(unix)]
#[test]
fn rollback_is_idempotent_and_unknown_ids_are_noops() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "11.8");
    point_at(&fx.layout, "11.8");
    let before = tree_state(fx.layout.install_base());

    let tx = fx.engine.begin("noop").expect("must begin");
    install_fake_toolkit(&fx.layout, "12.1");
    let first = tx.rollback().expect("must roll back");
    let after_first = tree_state(fx.layout.install_base());

    let second = fx.engine.rollback(&first.txid).expect("second rollback must not error");
    assert_eq!(second.outcome, RollbackOutcome::AlreadyRolledBack);
    assert_eq!(tree_state(fx.layout.install_base()), after_first);
    assert_eq!(after_first, before);

    let missing = fx
        .engine
        .rollback("tx-missing-0-0-000000")
        .expect("missing record must not error");
    assert_eq!(missing.outcome, RollbackOutcome::NotFound);
}

#[cfg(unix)]
#[test]
fn rollback_actions_run_in_reverse_registration_order() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "11.8");
    install_fake_toolkit(&fx.layout, "12.1");
    let scratch = fx.root.join("scratch.run");
    fs::write(&scratch, "x").expect("must write scratch");

    let mut tx = fx.engine.begin("ordering").expect("must begin");
    let actions = vec![
        RollbackAction::RestoreActiveVersion {
            version: version("11.8"),
        },
        RollbackAction::RestoreActiveVersion {
            version: version("12.1"),
        },
        RollbackAction::RemovePath {
            path: scratch.clone(),
        },
    ];
    for action in &actions {
        tx.add_rollback_action(action.clone())
            .expect("must register action");
    }

    let persisted = fx
        .engine
        .read_record(tx.txid())
        .expect("must read record")
        .expect("record should exist");
    assert_eq!(
        persisted.rollback_actions, actions,
        "actions must be persisted as soon as they are registered"
    );

    let report = tx.rollback().expect("must roll back");
    assert!(report.is_clean(), "unexpected failures: {:?}", report.failures);
    assert_eq!(
        read_active_pointer(&fx.layout).expect("must read pointer"),
        Some(version("11.8")),
        "first-registered action must run last"
    );
    assert!(!scratch.exists());
}

#[test]
fn run_protected_rolls_back_and_returns_original_error() {
    let fx = fixture();
    let partial = fx.layout.install_base().join("cuda-99.9");

    let err = fx
        .engine
        .run_protected("failing", |_tx| -> Result<()> {
            fs::create_dir_all(partial.join("bin"))?;
            Err(anyhow!("boom"))
        })
        .expect_err("body error must propagate");
    assert_eq!(err.to_string(), "boom");
    assert!(!partial.exists(), "partial install must be removed");

    let records = fx.engine.list_records().expect("must list");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TransactionStatus::RolledBack);
}

#[test]
fn run_protected_commits_on_success() {
    let fx = fixture();
    let value = fx
        .engine
        .run_protected("succeeds", |tx| {
            tx.add_rollback_action(RollbackAction::RemovePath {
                path: PathBuf::from("/nonexistent/artifact"),
            })?;
            Ok(42)
        })
        .expect("must succeed");
    assert_eq!(value, 42);

    let record = fx
        .engine
        .latest_committed()
        .expect("must read records")
        .expect("committed record should exist");
    assert_eq!(record.operation, "succeeds");
    assert_eq!(record.rollback_actions.len(), 1);
}

#[test]
fn dropping_unresolved_transaction_rolls_it_back() {
    let fx = fixture();
    let partial = fx.layout.install_base().join("cuda-12.0");
    let txid = {
        let tx = fx.engine.begin("abandoned_scope").expect("must begin");
        fs::create_dir_all(&partial).expect("must create partial dir");
        fx.env.set("CUDA_HOME", "/half/done");
        tx.txid().to_string()
    };

    assert!(!partial.exists());
    assert_eq!(fx.env.get("CUDA_HOME"), None);
    let record = fx
        .engine
        .read_record(&txid)
        .expect("must read record")
        .expect("record should exist");
    assert_eq!(record.status, TransactionStatus::RolledBack);

    fx.engine
        .begin("after_drop")
        .expect("lock must be released by drop")
        .commit()
        .expect("must commit");
}

#[test]
fn recover_interrupted_rolls_back_records_left_active() {
    let fx = fixture();
    let partial = fx.layout.install_base().join("cuda-12.0");

    let tx = fx.engine.begin("killed_midway").expect("must begin");
    let txid = tx.txid().to_string();
    fs::create_dir_all(&partial).expect("must create partial dir");
    tx.abandon();

    let record = fx
        .engine
        .read_record(&txid)
        .expect("must read record")
        .expect("record should exist");
    assert_eq!(record.status, TransactionStatus::Active);

    let reports = fx.engine.recover_interrupted().expect("must recover");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].txid, txid);
    assert_eq!(reports[0].outcome, RollbackOutcome::RolledBack);
    assert!(!partial.exists());

    let again = fx.engine.recover_interrupted().expect("must recover");
    assert!(again.is_empty(), "nothing should be left active");
}

#[test]
fn recover_interrupted_skips_while_lock_is_held() {
    let fx = fixture();
    let tx = fx.engine.begin("live").expect("must begin");

    let reports = fx.engine.recover_interrupted().expect("must not fail");
    assert!(reports.is_empty());
    let record = fx
        .engine
        .read_record(tx.txid())
        .expect("must read record")
        .expect("record should exist");
    assert_eq!(record.status, TransactionStatus::Active);

    tx.commit().expect("must commit");
}

#[test]
fn commit_after_external_rollback_is_rejected() {
    let fx = fixture();
    let tx = fx.engine.begin("raced").expect("must begin");
    let txid = tx.txid().to_string();

    let report = fx.engine.rollback(&txid).expect("in-process rollback must work");
    assert_eq!(report.outcome, RollbackOutcome::RolledBack);

    let err = tx.commit().expect_err("commit must fail after rollback");
    assert!(matches!(
        engine_error(&err),
        EngineError::InvalidTransition { .. }
    ));
    let record = fx
        .engine
        .read_record(&txid)
        .expect("must read record")
        .expect("record should exist");
    assert_eq!(record.status, TransactionStatus::RolledBack);
}

#[cfg(unix)]
#[test]
fn failed_snapshot_leaves_no_record_and_releases_lock() {
    use std::os::unix::net::UnixListener;

    let fx = fixture();
    let toolkit = install_fake_toolkit(&fx.layout, "11.8");
    let socket = toolkit.join("bin").join("daemon.sock");
    let listener = UnixListener::bind(&socket).expect("must bind socket");

    fx.engine
        .begin("uncopyable")
        .expect_err("snapshot of a socket must fail");
    let leftovers = fs::read_dir(fx.layout.transactions_dir())
        .expect("must read transactions dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .filter(|name| name != "engine.lock")
        .collect::<Vec<_>>();
    assert!(leftovers.is_empty(), "unexpected leftovers: {leftovers:?}");

    drop(listener);
    fs::remove_file(&socket).expect("must remove socket");
    fx.engine
        .begin("after_failure")
        .expect("lock must be free")
        .commit()
        .expect("must commit");
}

#[test]
fn txids_are_unique_under_rapid_invocation() {
    let fx = fixture();
    let mut seen = std::collections::BTreeSet::new();
    for _ in 0..5 {
        let tx = fx.engine.begin("rapid").expect("must begin");
        assert!(seen.insert(tx.txid().to_string()), "duplicate txid");
        tx.commit().expect("must commit");
    }
}

#[test]
fn prune_keeps_newest_finished_transactions() {
    let fx = fixture();
    let mut txids = Vec::new();
    for _ in 0..4 {
        let tx = fx.engine.begin("housekeeping").expect("must begin");
        txids.push(tx.txid().to_string());
        tx.commit().expect("must commit");
    }

    let pruned = fx.engine.prune(2).expect("must prune");
    assert_eq!(pruned, txids[..2].to_vec());
    let remaining = fx
        .engine
        .list_records()
        .expect("must list")
        .into_iter()
        .map(|record| record.txid)
        .collect::<Vec<_>>();
    assert_eq!(remaining, txids[2..].to_vec());
    assert!(!fx.layout.snapshot_dir(&txids[0]).exists());
}

#[cfg(unix)]
#[test]
fn dangling_pointer_is_restored_as_the_same_link() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "12.1");
    let dangling = fx.layout.install_base().join("cuda-13.0");
    fs_utils::create_symlink(&dangling, &fx.layout.active_pointer_path())
        .expect("must create dangling pointer");

    let tx = fx.engine.begin("dangling").expect("must begin");
    point_at(&fx.layout, "12.1");
    tx.rollback().expect("must roll back");

    assert_eq!(
        fs::read_link(fx.layout.active_pointer_path()).expect("must read pointer"),
        dangling
    );
}

#[cfg(unix)]
#[test]
fn switch_to_active_version_opens_no_transaction() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "12.1");
    point_at(&fx.layout, "12.1");

    let switched = default_switcher(&fx).switch("12.1").expect("must switch");
    assert!(switched);
    assert!(fx.engine.list_records().expect("must list").is_empty());
}

#[cfg(unix)]
#[test]
fn switch_to_installed_version_caches_outgoing_and_updates_environment() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "11.8");
    let target_dir = install_fake_toolkit(&fx.layout, "12.1");
    point_at(&fx.layout, "11.8");
    fx.env.set("PATH", &format!("{}/cuda-11.8/bin:/usr/bin", fx.layout.install_base().display()));
    fs::write(fx.layout.home_dir().join(".bashrc"), "alias gs='git status'\n")
        .expect("must write bashrc");

    let switched = default_switcher(&fx).switch("12.1").expect("must switch");
    assert!(switched);

    assert_eq!(
        read_active_pointer(&fx.layout).expect("must read pointer"),
        Some(version("12.1"))
    );
    assert!(fx
        .layout
        .version_cache_path(&version("11.8"))
        .join("bin")
        .join("nvcc")
        .is_file());
    assert_eq!(
        fx.env.get("CUDA_HOME").as_deref(),
        Some(target_dir.to_string_lossy().as_ref())
    );
    assert_eq!(
        fx.env.get("PATH"),
        Some(format!("{}/bin:/usr/bin", target_dir.display()))
    );
    assert_eq!(
        fx.env.get("LD_LIBRARY_PATH"),
        Some(format!("{}/lib64", target_dir.display()))
    );

    let bashrc = fs::read_to_string(fx.layout.home_dir().join(".bashrc")).expect("must read");
    assert!(bashrc.starts_with("alias gs='git status'\n"));
    assert_eq!(
        read_managed_install_dir(&bashrc),
        Some(target_dir.display().to_string())
    );

    let record = fx
        .engine
        .latest_committed()
        .expect("must read records")
        .expect("switch should commit");
    assert_eq!(record.operation, "switch_cuda_12.1");
    assert_eq!(
        record.rollback_actions,
        vec![
            RollbackAction::RestoreActiveVersion {
                version: version("11.8")
            },
            RollbackAction::RemoveCachedVersion {
                version: version("11.8")
            },
        ]
    );
}

#[cfg(unix)]
#[test]
fn switch_restores_cached_version_without_consuming_cache() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "12.1");
    point_at(&fx.layout, "12.1");
    cache_fake_toolkit(&fx.layout, "11.8");
    let fetcher = FakeFetcher::default();
    let fetched = fetcher.fetched.clone();

    let switched = switcher(&fx, fetcher, FakeInstaller::default())
        .switch("11.8")
        .expect("must switch");
    assert!(switched);
    assert!(fetched.lock().expect("fetch log").is_empty());
    assert!(fx.layout.toolkit_marker_path(&version("11.8")).is_file());
    assert!(fx.layout.version_cache_path(&version("11.8")).is_dir());
    assert!(fx.layout.version_cache_path(&version("12.1")).is_dir());
    assert_eq!(
        read_active_pointer(&fx.layout).expect("must read pointer"),
        Some(version("11.8"))
    );
}

#[cfg(unix)]
#[test]
fn switch_fetches_and_installs_missing_version() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "11.8");
    point_at(&fx.layout, "11.8");
    let fetcher = FakeFetcher {
        supported: vec![version("12.0")],
        ..FakeFetcher::default()
    };

    let switched = switcher(&fx, fetcher, FakeInstaller::default())
        .switch("12.0")
        .expect("must switch");
    assert!(switched);
    assert!(fx.layout.toolkit_marker_path(&version("12.0")).is_file());

    let record = fx
        .engine
        .latest_committed()
        .expect("must read records")
        .expect("switch should commit");
    let artifact = fx.layout.downloads_dir().join("cuda_12.0_linux.run");
    assert_eq!(
        record.rollback_actions,
        vec![
            RollbackAction::RestoreActiveVersion {
                version: version("11.8")
            },
            RollbackAction::RemovePath { path: artifact },
            RollbackAction::RemovePath {
                path: fx.layout.install_dir(&version("12.0"))
            },
            RollbackAction::RemoveCachedVersion {
                version: version("11.8")
            },
        ]
    );
}

#[cfg(unix)]
#[test]
fn failed_install_rolls_back_everything_and_reports_false() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "11.8");
    point_at(&fx.layout, "11.8");
    fs::write(fx.layout.home_dir().join(".bashrc"), "original\n").expect("must write bashrc");
    let install_before = tree_state(fx.layout.install_base());
    let configs_before = config_state(&fx.layout);
    let env_before = fx.env.snapshot();

    let fetcher = FakeFetcher {
        supported: vec![version("12.0")],
        ..FakeFetcher::default()
    };
    let switched = switcher(&fx, fetcher, FakeInstaller {
            fail: true,
            ..FakeInstaller::default()
        })
        .switch("12.0")
        .expect("install failure is reported as false");
    assert!(!switched);

    assert_eq!(tree_state(fx.layout.install_base()), install_before);
    assert_eq!(config_state(&fx.layout), configs_before);
    assert_eq!(fx.env.snapshot(), env_before);
    assert!(!fx.layout.downloads_dir().join("cuda_12.0_linux.run").exists());

    let records = fx.engine.list_records().expect("must list");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TransactionStatus::RolledBack);
    assert!(records[0].rollback_failures.is_empty());
}

#[test]
fn failed_fetch_reports_false() {
    let fx = fixture();
    let fetcher = FakeFetcher {
        supported: vec![version("12.0")],
        fail: true,
        ..FakeFetcher::default()
    };
    let switched = switcher(&fx, fetcher, FakeInstaller::default())
        .switch("12.0")
        .expect("fetch failure is reported as false");
    assert!(!switched);
    assert!(!fx.layout.install_dir(&version("12.0")).exists());
}

#[cfg(unix)]
#[test]
fn failed_install_keeps_artifact_downloaded_by_an_earlier_run() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "11.8");
    point_at(&fx.layout, "11.8");
    let artifact = fx.layout.downloads_dir().join("cuda_12.0_linux.run");
    fs::create_dir_all(fx.layout.downloads_dir()).expect("must create downloads dir");
    fs::write(&artifact, "#!/bin/sh\n").expect("must write earlier download");

    let fetcher = FakeFetcher {
        supported: vec![version("12.0")],
        ..FakeFetcher::default()
    };
    let installer = FakeInstaller {
        fail: true,
        ..FakeInstaller::default()
    };
    let switched = switcher(&fx, fetcher, installer)
        .switch("12.0")
        .expect("install failure is reported as false");
    assert!(!switched);

    assert!(artifact.is_file(), "reused download must survive the rollback");
    assert!(!fx.layout.install_dir(&version("12.0")).exists());
    let records = fx.engine.list_records().expect("must list");
    assert_eq!(records.len(), 1);
    assert!(!records[0]
        .rollback_actions
        .contains(&RollbackAction::RemovePath { path: artifact }));
}

#[cfg(unix)]
#[test]
fn cancelled_install_rolls_back_on_the_owning_thread() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "11.8");
    point_at(&fx.layout, "11.8");
    let install_before = tree_state(fx.layout.install_base());
    let env_before = fx.env.snapshot();

    let fetcher = FakeFetcher {
        supported: vec![version("12.0")],
        ..FakeFetcher::default()
    };
    let installer = FakeInstaller {
        cancel_under: Some(fx.layout.state_root().to_path_buf()),
        ..FakeInstaller::default()
    };
    let err = switcher(&fx, fetcher, installer)
        .switch("12.0")
        .expect_err("cancellation must surface as an error");
    assert!(matches!(
        engine_error(&err),
        EngineError::Interrupted { .. }
    ));

    assert_eq!(tree_state(fx.layout.install_base()), install_before);
    assert_eq!(fx.env.snapshot(), env_before);
    assert!(!fx.layout.downloads_dir().join("cuda_12.0_linux.run").exists());
    let records = fx.engine.list_records().expect("must list");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TransactionStatus::RolledBack);
    assert!(!request_cancel(fx.layout.state_root()));
}

#[test]
fn run_protected_reports_interruption_when_body_stops_after_cancel() {
    let fx = fixture();
    let err = fx
        .engine
        .run_protected("cancelled", |tx| {
            assert!(!tx.is_cancelled());
            assert!(request_cancel(fx.layout.state_root()));
            tx.check_cancelled()?;
            Ok(())
        })
        .expect_err("cancelled body must fail");
    assert!(matches!(
        engine_error(&err),
        EngineError::Interrupted { .. }
    ));
    let records = fx.engine.list_records().expect("must list");
    assert_eq!(records[0].status, TransactionStatus::RolledBack);
}

#[test]
fn cancelled_copy_stops_before_writing() {
    let fx = fixture();
    let src = install_fake_toolkit(&fx.layout, "12.1");
    let dst = fx.root.join("copy");
    let cancel = AtomicBool::new(true);

    let err = copy_tree_cancellable(&src, &dst, &cancel).expect_err("copy must stop");
    assert!(err.to_string().contains("cancelled"));
    assert!(!dst.exists());
}

#[cfg(unix)]
#[test]
fn run_command_stops_child_once_cancelled() {
    let cancel = Arc::new(AtomicBool::new(false));
    let trigger = cancel.clone();
    let setter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        trigger.store(true, Ordering::SeqCst);
    });

    let started = Instant::now();
    let mut command = std::process::Command::new("sleep");
    command.arg("30");
    let err = run_command(&mut command, "CUDA 12.1 installer failed", &cancel)
        .expect_err("cancelled command must fail");
    setter.join().expect("setter thread");

    assert!(err.to_string().contains("cancelled"));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[cfg(unix)]
#[test]
fn run_command_reports_exit_status_and_stderr() {
    let cancel = AtomicBool::new(false);
    let mut command = std::process::Command::new("sh");
    command.arg("-c").arg("echo partial; echo boom >&2; exit 3");
    let err = run_command(&mut command, "CUDA 12.1 installer failed", &cancel)
        .expect_err("failing command must fail");
    let message = err.to_string();
    assert!(message.starts_with("CUDA 12.1 installer failed"));
    assert!(message.contains("stdout='partial'"));
    assert!(message.contains("stderr='boom'"));

    let mut ok = std::process::Command::new("true");
    run_command(&mut ok, "true failed", &cancel).expect("true must succeed");
}

#[test]
fn unsupported_or_malformed_versions_open_no_transaction() {
    let fx = fixture();
    let switcher = default_switcher(&fx);

    let err = switcher
        .switch("10.2")
        .expect_err("unsupported version must fail");
    assert!(matches!(
        engine_error(&err),
        EngineError::UnsupportedVersion { .. }
    ));
    switcher
        .switch("twelve")
        .expect_err("malformed version must fail");

    assert!(fx.engine.list_records().expect("must list").is_empty());
}

#[cfg(unix)]
#[test]
fn real_directory_at_pointer_is_moved_aside_and_restored_on_revert() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "12.1");
    let pointer = fx.layout.active_pointer_path();
    fs::create_dir_all(pointer.join("bin")).expect("must create real cuda dir");
    fs::write(pointer.join("bin").join("nvcc"), "vendor nvcc\n").expect("must write nvcc");
    let before = tree_state(fx.layout.install_base());

    assert!(default_switcher(&fx).switch("12.1").expect("must switch"));
    assert_eq!(
        pointer_state(&fx.layout).expect("must read pointer"),
        PointerState::Link(fx.layout.install_dir(&version("12.1")))
    );
    let aside = fx.layout.install_base().join("cuda.backup");
    assert_eq!(
        fs::read_to_string(aside.join("bin").join("nvcc")).expect("aside must keep contents"),
        "vendor nvcc\n"
    );

    let record = fx
        .engine
        .latest_committed()
        .expect("must read records")
        .expect("switch should commit");
    let report = fx.engine.rollback(&record.txid).expect("must revert");
    assert_eq!(report.outcome, RollbackOutcome::Reverted);
    assert_eq!(tree_state(fx.layout.install_base()), before);

    let record = fx
        .engine
        .read_record(&record.txid)
        .expect("must read record")
        .expect("record should exist");
    assert_eq!(record.status, TransactionStatus::Committed);
    assert!(record.reverted_at_unix.is_some());
}

#[cfg(unix)]
#[test]
fn reverting_a_committed_transaction_twice_leaves_later_work_alone() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "11.8");
    install_fake_toolkit(&fx.layout, "12.1");
    point_at(&fx.layout, "11.8");

    assert!(default_switcher(&fx).switch("12.1").expect("must switch"));
    let txid = fx
        .engine
        .latest_committed()
        .expect("must read records")
        .expect("switch should commit")
        .txid;
    let first = fx.engine.rollback(&txid).expect("must revert");
    assert_eq!(first.outcome, RollbackOutcome::Reverted);

    let later = install_fake_toolkit(&fx.layout, "12.0");
    point_at(&fx.layout, "12.0");
    let settled = tree_state(fx.layout.install_base());

    let second = fx.engine.rollback(&txid).expect("second revert must not error");
    assert_eq!(second.outcome, RollbackOutcome::AlreadyReverted);
    assert!(!second.restored_state());
    assert!(later.is_dir(), "later install must survive a repeated revert");
    assert_eq!(tree_state(fx.layout.install_base()), settled);
    assert_eq!(
        read_active_pointer(&fx.layout).expect("must read pointer"),
        Some(version("12.0"))
    );
}

#[cfg(unix)]
#[test]
fn remove_version_refuses_active_and_deletes_inactive() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "11.8");
    install_fake_toolkit(&fx.layout, "12.1");
    cache_fake_toolkit(&fx.layout, "11.8");
    point_at(&fx.layout, "12.1");
    let switcher = default_switcher(&fx);

    let err = switcher
        .remove_version(&version("12.1"))
        .expect_err("active version must not be removed");
    assert!(matches!(engine_error(&err), EngineError::VersionActive(_)));

    assert!(switcher
        .remove_version(&version("11.8"))
        .expect("must remove"));
    assert!(!fx.layout.install_dir(&version("11.8")).exists());
    assert!(!fx.layout.version_cache_path(&version("11.8")).exists());
    assert!(!switcher
        .remove_version(&version("11.8"))
        .expect("second removal is a no-op"));

    let inventory = switcher.inventory().expect("must read inventory");
    assert_eq!(inventory.active, Some(version("12.1")));
    assert_eq!(inventory.installed, vec![version("12.1")]);
    assert!(inventory.cached.is_empty());
}

#[test]
fn detector_requires_compiler_in_install_dir() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "12.1");
    fs::create_dir_all(fx.layout.install_base().join("cuda-11.8")).expect("must create empty dir");
    fs::create_dir_all(fx.layout.install_base().join("cuda-doc")).expect("must create dir");

    let detector = LayoutDetector::new(fx.layout.clone());
    assert_eq!(
        detector.detect_installed_versions().expect("must detect"),
        vec![version("12.1")]
    );
    assert_eq!(detector.detect_active_version().expect("must detect"), None);
}

#[test]
fn parse_nvcc_release_reads_major_minor() {
    let output = "nvcc: NVIDIA (R) Cuda compiler driver\nCuda compilation tools, release 12.1, V12.1.105\n";
    assert_eq!(parse_nvcc_release(output), Some(version("12.1")));
    assert_eq!(parse_nvcc_release("no version here"), None);
}

#[test]
fn toolkit_path_entry_replaces_stale_toolkit_entries() {
    let base = Path::new("/usr/local");
    let updated = with_toolkit_path_entry(
        Some("/usr/local/cuda-11.8/bin:/usr/bin:/usr/local/cuda/bin:/opt/cuda-tools/bin:"),
        Path::new("/usr/local/cuda-12.1/bin"),
        base,
        "bin",
    );
    assert_eq!(
        updated,
        "/usr/local/cuda-12.1/bin:/usr/bin:/opt/cuda-tools/bin"
    );
    assert_eq!(
        with_toolkit_path_entry(None, Path::new("/usr/local/cuda-12.1/lib64"), base, "lib64"),
        "/usr/local/cuda-12.1/lib64"
    );
}

#[test]
fn managed_block_is_idempotent_and_preserves_user_content() {
    let install_dir = Path::new("/usr/local/cuda-12.1");
    let original = "export EDITOR=vim\n\n";
    let once = apply_managed_block(original, install_dir);
    let twice = apply_managed_block(&once, install_dir);
    assert_eq!(once, twice);
    assert!(once.starts_with("export EDITOR=vim\n\n# >>> DeepLearningMate"));
    assert_eq!(once.matches(BLOCK_BEGIN).count(), 1);
    assert_eq!(strip_managed_block(&once), "export EDITOR=vim\n");

    let switched = apply_managed_block(&once, Path::new("/usr/local/cuda-11.8"));
    assert_eq!(
        read_managed_install_dir(&switched).as_deref(),
        Some("/usr/local/cuda-11.8")
    );
    assert!(!switched.contains("cuda-12.1"));
}

#[test]
fn managed_block_strips_unmarked_legacy_configuration() {
    let legacy = "alias ll='ls -l'\n\n# DeepLearningMate CUDA Configuration\nexport CUDA_HOME=/usr/local/cuda-11.8\nexport CUDA_ROOT=/usr/local/cuda-11.8\nexport PATH=/usr/local/cuda-11.8/bin:$PATH\nexport LD_LIBRARY_PATH=/usr/local/cuda-11.8/lib64:$LD_LIBRARY_PATH\nexport PATH=$HOME/bin:$PATH\n";
    let stripped = strip_managed_block(legacy);
    assert_eq!(stripped, "alias ll='ls -l'\n\nexport PATH=$HOME/bin:$PATH\n");
}

#[test]
fn unterminated_managed_block_keeps_the_lines_after_it() {
    let truncated = format!(
        "export EDITOR=vim\n{BLOCK_BEGIN}\nexport CUDA_HOME=/usr/local/cuda-11.8\nexport PATH=/usr/local/cuda-11.8/bin:$PATH\nalias gs='git status'\nexport GOPATH=$HOME/go\n"
    );
    let stripped = strip_managed_block(&truncated);
    assert_eq!(
        stripped,
        "export EDITOR=vim\nalias gs='git status'\nexport GOPATH=$HOME/go\n"
    );
    assert_eq!(strip_managed_block(&stripped), stripped);

    let repaired = apply_managed_block(&truncated, Path::new("/usr/local/cuda-12.1"));
    assert!(repaired.contains("alias gs='git status'"));
    assert_eq!(repaired.matches(BLOCK_BEGIN).count(), 1);
    assert_eq!(repaired.matches(BLOCK_END).count(), 1);
    assert!(!repaired.contains("cuda-11.8"));
}

#[test]
fn write_and_clear_profile_report_changes() {
    let fx = fixture();
    let profile = fx.layout.home_dir().join(".zshrc");
    let install_dir = fx.layout.install_dir(&version("12.1"));

    assert!(write_profile(&profile, &install_dir).expect("must write"));
    assert!(!write_profile(&profile, &install_dir).expect("must write"));
    assert!(clear_profile(&profile).expect("must clear"));
    assert_eq!(fs::read_to_string(&profile).expect("must read"), "");
    assert!(!clear_profile(&fx.layout.home_dir().join(".missing")).expect("must clear"));
}

#[cfg(unix)]
#[test]
fn uninstall_removes_toolkits_profiles_and_state() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "11.8");
    install_fake_toolkit(&fx.layout, "12.1");
    let bashrc = fx.layout.home_dir().join(".bashrc");
    fs::write(&bashrc, "alias ll='ls -l'\n").expect("must write bashrc");
    assert!(default_switcher(&fx).switch("12.1").expect("must switch"));
    assert!(fs::read_to_string(&bashrc)
        .expect("must read bashrc")
        .contains(BLOCK_BEGIN));

    let report = uninstall(&fx.engine, &[bashrc.clone()], UninstallOptions::default())
        .expect("must uninstall");

    assert_eq!(report.profiles_cleared, vec![bashrc.clone()]);
    assert_eq!(report.toolkits_removed.len(), 3);
    assert!(report.state_removed);
    assert_eq!(
        fs::read_to_string(&bashrc).expect("must read bashrc"),
        "alias ll='ls -l'\n"
    );
    assert!(fx.layout.protected_paths().expect("must list").is_empty());
    assert!(!fx.layout.state_root().exists());
    assert_eq!(fx.env.get("CUDA_HOME"), None);
    assert_eq!(fx.env.get("PATH").as_deref(), Some("/usr/bin:/bin"));
    assert_eq!(fx.env.get("LD_LIBRARY_PATH"), None);
}

#[cfg(unix)]
#[test]
fn uninstall_keeping_toolkits_and_state_can_be_reverted() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "12.1");
    let bashrc = fx.layout.home_dir().join(".bashrc");
    assert!(default_switcher(&fx).switch("12.1").expect("must switch"));
    let profile_before = fs::read_to_string(&bashrc).expect("must read bashrc");
    let tree_before = tree_state(fx.layout.install_base());

    let options = UninstallOptions {
        keep_state: true,
        keep_toolkits: true,
    };
    let report = uninstall(&fx.engine, &[bashrc.clone()], options).expect("must uninstall");
    assert!(report.toolkits_removed.is_empty());
    assert!(!report.state_removed);
    assert_eq!(tree_state(fx.layout.install_base()), tree_before);
    assert!(!fs::read_to_string(&bashrc)
        .expect("must read bashrc")
        .contains(BLOCK_BEGIN));

    let record = fx
        .engine
        .list_records()
        .expect("must read records")
        .into_iter()
        .find(|record| record.operation == "uninstall")
        .expect("uninstall should leave a record");
    assert_eq!(record.status, TransactionStatus::Committed);
    let reverted = fx.engine.rollback(&record.txid).expect("must revert");
    assert_eq!(reverted.outcome, RollbackOutcome::Reverted);
    assert_eq!(
        fs::read_to_string(&bashrc).expect("must read bashrc"),
        profile_before
    );
    assert!(fx.env.get("CUDA_HOME").is_some());
}

#[test]
fn toolkit_path_entries_are_stripped_from_search_paths() {
    let base = Path::new("/usr/local");
    assert_eq!(
        without_toolkit_path_entries(
            "/usr/local/cuda-12.1/bin:/usr/bin:/usr/local/cuda/bin:/opt/cuda-12.1/bin",
            base,
            "bin"
        ),
        "/usr/bin:/opt/cuda-12.1/bin"
    );
    assert_eq!(without_toolkit_path_entries("/usr/local/cuda-11.8/lib64", base, "lib64"), "");
}

#[derive(Clone, Default)]
struct FakeLister {
    packages: Arc<Mutex<Vec<String>>>,
}

impl PackageLister for FakeLister {
    fn list(&self) -> Result<Vec<String>> {
        Ok(self.packages.lock().expect("package list").clone())
    }
}

#[cfg(unix)]
#[test]
fn checkpoint_restore_switches_version_and_environment_back() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "11.8");
    install_fake_toolkit(&fx.layout, "12.1");
    let switcher = default_switcher(&fx);
    assert!(switcher.switch("11.8").expect("must switch"));

    let lister = FakeLister::default();
    *lister.packages.lock().expect("package list") =
        vec!["numpy==1.26.4".to_string(), "torch==2.1.0".to_string()];
    let manager = CheckpointManager::new(&switcher, Box::new(lister.clone()));
    let checkpoint = manager.create("before-upgrade").expect("must create");
    assert_eq!(checkpoint.active_version, Some(version("11.8")));
    assert!(fx.layout.checkpoint_path("before-upgrade").is_file());

    assert!(switcher.switch("12.1").expect("must switch"));
    fx.env.set("LD_LIBRARY_PATH", "/opt/extra");
    *lister.packages.lock().expect("package list") =
        vec!["numpy==1.26.4".to_string(), "torch==2.3.0".to_string()];

    let restored = manager.restore("before-upgrade").expect("must restore");
    assert!(restored.switched);
    assert!(restored.environment_restored);
    assert_eq!(
        read_active_pointer(&fx.layout).expect("must read pointer"),
        Some(version("11.8"))
    );
    assert!(!differs_from_captured(fx.env.as_ref(), &checkpoint.environment));
    let drift = restored.package_drift.expect("drift should be computed");
    assert_eq!(drift.missing, vec!["torch==2.1.0".to_string()]);
    assert_eq!(drift.added, vec!["torch==2.3.0".to_string()]);
}

#[cfg(unix)]
#[test]
fn checkpoint_restored_right_after_creation_changes_nothing() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "11.8");
    install_fake_toolkit(&fx.layout, "12.1");
    let switcher = default_switcher(&fx);
    assert!(switcher.switch("12.1").expect("must switch"));
    let records_before = fx.engine.list_records().expect("must list").len();
    let pointer_before = pointer_state(&fx.layout).expect("must read pointer");
    let tree_before = tree_state(fx.layout.install_base());
    let env_before = capture_tracked(fx.env.as_ref());

    let lister = FakeLister::default();
    *lister.packages.lock().expect("package list") = vec!["torch==2.1.0".to_string()];
    let manager = CheckpointManager::new(&switcher, Box::new(lister));
    manager.create("n").expect("must create");
    let restored = manager.restore("n").expect("must restore");

    assert!(!restored.switched);
    assert!(!restored.environment_restored);
    assert!(restored
        .package_drift
        .expect("drift should be computed")
        .is_empty());
    assert_eq!(
        pointer_state(&fx.layout).expect("must read pointer"),
        pointer_before
    );
    assert_eq!(tree_state(fx.layout.install_base()), tree_before);
    assert_eq!(capture_tracked(fx.env.as_ref()), env_before);
    assert_eq!(
        fx.engine.list_records().expect("must list").len(),
        records_before
    );
}

#[test]
fn restoring_unknown_checkpoint_changes_nothing() {
    let fx = fixture();
    let switcher = default_switcher(&fx);
    let manager = CheckpointManager::new(&switcher, Box::new(FakeLister::default()));

    let err = manager
        .restore("does-not-exist")
        .expect_err("unknown checkpoint must fail");
    assert!(matches!(
        engine_error(&err),
        EngineError::CheckpointNotFound(name) if name == "does-not-exist"
    ));
    assert!(fx.engine.list_records().expect("must list").is_empty());
}

#[test]
fn checkpoint_names_are_validated() {
    for name in ["base", "pre-12.1", "nightly_2"] {
        validate_checkpoint_name(name).expect("name should be accepted");
    }
    for name in ["", ".hidden", "../escape", "a/b", "with space"] {
        assert!(
            validate_checkpoint_name(name).is_err(),
            "'{name}' should be rejected"
        );
    }
}

#[test]
fn freeze_output_skips_blank_and_comment_lines() {
    let parsed = parse_freeze_output("numpy==1.26.4\n\n# editable\ntorch==2.1.0\n");
    assert_eq!(parsed, vec!["numpy==1.26.4", "torch==2.1.0"]);
}

struct FixedProbe {
    status: HealthStatus,
}

impl HealthProbe for FixedProbe {
    fn probe(&self) -> HealthStatus {
        self.status.clone()
    }
}

fn monitor(fx: &Fixture, status: HealthStatus) -> RecoveryMonitor {
    RecoveryMonitor::new(
        fx.engine.clone(),
        Box::new(FixedProbe { status }),
        std::time::Duration::from_secs(1),
    )
}

#[cfg(unix)]
#[test]
fn monitor_reverts_latest_committed_once() {
    let fx = fixture();
    install_fake_toolkit(&fx.layout, "11.8");
    install_fake_toolkit(&fx.layout, "12.1");
    point_at(&fx.layout, "11.8");
    assert!(default_switcher(&fx).switch("12.1").expect("must switch"));

    let unhealthy = HealthStatus::Unhealthy {
        reason: "nvcc exited with 127".to_string(),
    };
    let monitor = monitor(&fx, unhealthy);
    match monitor.check_once().expect("must check") {
        MonitorOutcome::Recovered { report, .. } => {
            assert_eq!(report.outcome, RollbackOutcome::Reverted);
            assert!(report.is_clean());
        }
        other => panic!("expected recovery, got {other:?}"),
    }
    assert_eq!(
        read_active_pointer(&fx.layout).expect("must read pointer"),
        Some(version("11.8"))
    );

    assert!(matches!(
        monitor.check_once().expect("must check"),
        MonitorOutcome::AlreadyReverted { .. }
    ));
}

#[test]
fn monitor_reports_health_and_empty_history() {
    let fx = fixture();
    let healthy = monitor(
        &fx,
        HealthStatus::Healthy {
            version: Some(version("12.1")),
        },
    );
    assert_eq!(
        healthy.check_once().expect("must check"),
        MonitorOutcome::Healthy {
            version: Some(version("12.1"))
        }
    );

    let unhealthy = monitor(
        &fx,
        HealthStatus::Unhealthy {
            reason: "missing".to_string(),
        },
    );
    assert!(matches!(
        unhealthy.check_once().expect("must check"),
        MonitorOutcome::NothingToRecover { .. }
    ));
}

#[test]
fn monitor_run_returns_when_stopped() {
    let fx = fixture();
    let monitor = monitor(&fx, HealthStatus::Healthy { version: None });
    let stop = std::sync::atomic::AtomicBool::new(true);
    monitor.run(&stop).expect("must stop immediately");
}

#[cfg(unix)]
#[test]
fn nvcc_probe_reports_missing_and_failing_programs() {
    let fx = fixture();
    let missing = NvccProbe::with_program(fx.root.join("no-such-nvcc"));
    assert!(matches!(missing.probe(), HealthStatus::Unhealthy { .. }));

    let failing = NvccProbe::with_program("false");
    assert!(matches!(failing.probe(), HealthStatus::Unhealthy { .. }));
}

#[test]
fn config_defaults_apply_to_missing_fields_and_files() {
    let fx = fixture();
    let loaded = DlmateConfig::load(&fx.layout.config_path()).expect("missing file is default");
    assert_eq!(loaded, DlmateConfig::default());

    let parsed = DlmateConfig::parse("mirror = \"china\"\nuse_sudo = false\n").expect("must parse");
    assert_eq!(parsed.mirror, dlmate_core::Mirror::China);
    assert!(!parsed.use_sudo);
    assert_eq!(parsed.install_base, PathBuf::from("/usr/local"));
    assert_eq!(parsed.keep_transactions, 20);
    assert_eq!(
        parsed.resolved_shell_profiles(Path::new("/home/dev")),
        vec![PathBuf::from("/home/dev/.bashrc")]
    );
}

#[test]
fn config_rejects_invalid_values() {
    assert!(DlmateConfig::parse("install_base = \"relative/dir\"\n").is_err());
    assert!(DlmateConfig::parse("monitor_interval_secs = 0\n").is_err());
    assert!(DlmateConfig::parse("keep_transactions = 0\n").is_err());
    assert!(DlmateConfig::parse("unknown_key = 1\n").is_err());
}

#[test]
fn runfile_command_installs_toolkit_silently() {
    let artifact = Path::new("/tmp/cuda_12.1.0_530.30.02_linux.run");
    let install_dir = Path::new("/usr/local/cuda-12.1");

    let command = build_runfile_command(artifact, install_dir, true);
    assert_eq!(command.get_program(), "sudo");
    let args = command
        .get_args()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    assert_eq!(
        args,
        vec![
            "sh".to_string(),
            artifact.display().to_string(),
            "--silent".to_string(),
            "--toolkit".to_string(),
            "--toolkitpath=/usr/local/cuda-12.1".to_string(),
            "--no-opengl-libs".to_string(),
        ]
    );

    let unprivileged = build_runfile_command(artifact, install_dir, false);
    assert_eq!(unprivileged.get_program(), "sh");
}

#[test]
fn protected_paths_cover_pointer_versions_and_aside_dirs() {
    let fx = fixture();
    for name in ["cuda-11.8", "cuda.backup", "cuda.backup-1", "include", "lib"] {
        fs::create_dir_all(fx.layout.install_base().join(name)).expect("must create dir");
    }
    let names = fx
        .layout
        .protected_paths()
        .expect("must list")
        .into_iter()
        .map(|path| path.file_name().expect("name").to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["cuda-11.8", "cuda.backup", "cuda.backup-1"]);
    assert_eq!(
        fx.layout.next_aside_path(),
        fx.layout.install_base().join("cuda.backup-2")
    );
}
