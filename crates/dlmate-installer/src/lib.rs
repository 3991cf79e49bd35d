mod actions;
mod checkpoint;
mod config;
mod detect;
mod env;
mod error;
mod fs_utils;
mod interrupt;
mod layout;
mod monitor;
mod pointer;
mod runfile;
mod shell_profile;
mod snapshot;
mod switch;
mod transactions;
mod uninstall;

pub use actions::RollbackAction;
pub use checkpoint::{
    validate_checkpoint_name, Checkpoint, CheckpointManager, CheckpointRestore, CheckpointStore,
    PackageDrift, PackageLister, PipPackageLister, CHECKPOINT_FORMAT_VERSION,
};
pub use config::DlmateConfig;
pub use detect::{parse_nvcc_release, LayoutDetector, VersionDetector};
pub use env::{
    apply_captured, capture_tracked, differs_from_captured, with_toolkit_path_entry,
    without_toolkit_path_entries, CapturedEnvironment, EnvStore, MemoryEnv, ProcessEnv,
    TRACKED_ENV_KEYS,
};
pub use error::EngineError;
pub use fs_utils::dir_size;
pub use interrupt::{install_interrupt_handler, interrupt_requested, INTERRUPT_EXIT_CODE};
pub use layout::{
    default_home_dir, default_state_root, is_protected_entry_name, HostLayout,
    ACTIVE_POINTER_NAME,
};
pub use monitor::{
    HealthProbe, HealthStatus, MonitorOutcome, NvccProbe, RecoveryMonitor, DEFAULT_PROBE_TIMEOUT,
};
pub use pointer::{pointer_state, read_active_pointer, repoint_active_pointer, PointerState, RepointOutcome};
pub use runfile::RunfileInstaller;
pub use shell_profile::{
    apply_managed_block, clear_profile, read_managed_install_dir, render_block,
    strip_managed_block, write_profile, BLOCK_BEGIN, BLOCK_END,
};
pub use snapshot::{
    CapturedConfig, CapturedPath, RestoreFailure, SnapshotManifest, SnapshotRequest,
    SnapshotStore,
};
pub use switch::{
    apply_toolkit_environment, ArtifactFetcher, FetchedArtifact, ToolkitInstaller, VersionInventory,
    VersionSwitcher,
};
pub use transactions::{
    current_unix_timestamp, BackupInfo, RollbackFailure, RollbackOutcome, RollbackReport,
    Transaction, TransactionEngine, TransactionRecord, TransactionStatus,
    TRANSACTION_RECORD_VERSION,
};
pub use uninstall::{uninstall, UninstallOptions, UninstallReport};

#[cfg(test)]
mod tests;
