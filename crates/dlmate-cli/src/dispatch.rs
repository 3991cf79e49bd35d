use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dlmate_core::{
    detect_host_platform, ArtifactCatalog, Mirror, PlatformDetection, ToolkitVersion,
    OS_RELEASE_PATH,
};
use dlmate_installer::{
    default_home_dir, default_state_root, dir_size, install_interrupt_handler,
    read_managed_install_dir, CheckpointManager, CheckpointRestore, DlmateConfig, HostLayout,
    LayoutDetector, MonitorOutcome, NvccProbe, PipPackageLister, ProcessEnv, RecoveryMonitor,
    RollbackOutcome, RollbackReport, RunfileInstaller, TransactionEngine, TransactionRecord,
    UninstallOptions, UninstallReport, VersionDetector, VersionInventory, VersionSwitcher,
};
use tracing::{debug, warn};

use crate::completion::write_completions_script;
use crate::download::HttpArtifactFetcher;
use crate::frameworks::{install_framework, FrameworkChoice};
use crate::render::{format_megabytes, render_status_line, OutputStyle, TerminalRenderer};
use crate::{Cli, Commands, MirrorArg};

pub(crate) struct AppContext {
    config: DlmateConfig,
    layout: HostLayout,
    engine: TransactionEngine,
    catalog: ArtifactCatalog,
    platform: PlatformDetection,
}

impl AppContext {
    pub(crate) fn load(state_root: Option<&Path>, install_base: Option<&Path>) -> Result<Self> {
        let state_root = match state_root {
            Some(path) => path.to_path_buf(),
            None => default_state_root()?,
        };
        let home_dir = default_home_dir()?;

        let defaults = DlmateConfig::default();
        let config_path =
            HostLayout::new(&state_root, &defaults.install_base, &home_dir).config_path();
        let mut config = DlmateConfig::load(&config_path)?;
        if let Some(install_base) = install_base {
            config.install_base = install_base.to_path_buf();
        }
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", config_path.display()))?;

        let layout = HostLayout::new(state_root, config.install_base.clone(), home_dir);
        layout.ensure_state_dirs()?;

        let catalog = match &config.catalog_path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read catalog: {}", path.display()))?;
                ArtifactCatalog::from_toml_str(&raw)
                    .with_context(|| format!("invalid catalog: {}", path.display()))?
            }
            None => ArtifactCatalog::builtin()?,
        };

        let platform = detect_host_platform(Path::new(OS_RELEASE_PATH));
        if !platform.exact {
            warn!(
                fallback = platform.tag.as_str(),
                "could not identify the host distribution"
            );
        }

        let engine = TransactionEngine::new(layout.clone(), Arc::new(ProcessEnv));
        Ok(Self {
            config,
            layout,
            engine,
            catalog,
            platform,
        })
    }

    fn mirror(&self, requested: Option<MirrorArg>) -> Mirror {
        requested.map(Mirror::from).unwrap_or(self.config.mirror)
    }

    fn switcher(&self, mirror: Mirror, style: OutputStyle) -> Result<VersionSwitcher> {
        let fetcher = HttpArtifactFetcher::new(self.catalog.clone(), mirror, style)?;
        Ok(VersionSwitcher::new(
            self.engine.clone(),
            Box::new(fetcher),
            Box::new(RunfileInstaller::new(self.config.use_sudo)),
            Box::new(LayoutDetector::new(self.layout.clone())),
            self.platform.tag,
        )
        .with_shell_profiles(self.config.resolved_shell_profiles(self.layout.home_dir())))
    }

    fn monitor(&self) -> RecoveryMonitor {
        RecoveryMonitor::new(
            self.engine.clone(),
            Box::new(NvccProbe::for_layout(&self.layout)),
            Duration::from_secs(self.config.monitor_interval_secs),
        )
    }
}

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = cli.command {
        let mut stdout = io::stdout().lock();
        return write_completions_script(shell, &mut stdout);
    }

    let renderer = TerminalRenderer::current();
    let context = AppContext::load(cli.state_root.as_deref(), cli.install_base.as_deref())?;
    install_interrupt_handler();
    recover_interrupted(&context, renderer)?;

    match cli.command {
        Commands::Status => run_status(&context, renderer),
        Commands::Install {
            version,
            framework,
            mirror,
        } => run_install(&context, renderer, &version, framework, context.mirror(mirror)),
        Commands::Switch { version, mirror } => {
            let switcher = context.switcher(context.mirror(mirror), renderer.style())?;
            switch_or_fail(&switcher, renderer, &version)
        }
        Commands::ListVersions => {
            let switcher = context.switcher(context.config.mirror, renderer.style())?;
            let inventory = switcher.inventory()?;
            renderer.print_lines(&format_version_lines(
                &context.catalog,
                &inventory,
                &context.platform,
            ));
            Ok(())
        }
        Commands::Remove { version } => {
            let version = ToolkitVersion::parse(&version)?;
            let switcher = context.switcher(context.config.mirror, renderer.style())?;
            if switcher.remove_version(&version)? {
                renderer.print_status("ok", &format!("removed CUDA {version}"));
            } else {
                renderer.print_status("warn", &format!("CUDA {version} is not installed"));
            }
            Ok(())
        }
        Commands::Cleanup { yes } => run_cleanup(&context, renderer, yes),
        Commands::Uninstall {
            yes,
            keep_config,
            keep_cuda,
        } => {
            if !yes {
                renderer.print_status(
                    "warn",
                    "nothing removed; rerun with --yes to uninstall DeepLearningMate",
                );
                return Ok(());
            }
            let options = UninstallOptions {
                keep_state: keep_config,
                keep_toolkits: keep_cuda,
            };
            let profiles = context
                .config
                .resolved_shell_profiles(context.layout.home_dir());
            let report = dlmate_installer::uninstall(&context.engine, &profiles, options)?;
            renderer.print_lines(&format_uninstall_lines(&report, renderer.style()));
            Ok(())
        }
        Commands::Checkpoint { name } => {
            let switcher = context.switcher(context.config.mirror, renderer.style())?;
            let manager = CheckpointManager::new(&switcher, Box::new(PipPackageLister::default()));
            let checkpoint = manager.create(&name)?;
            let active = checkpoint
                .active_version
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "none".to_string());
            renderer.print_status(
                "ok",
                &format!(
                    "saved checkpoint '{}' (cuda {active}, {} packages)",
                    checkpoint.name,
                    checkpoint.installed_packages.len()
                ),
            );
            Ok(())
        }
        Commands::Restore { name } => {
            let switcher = context.switcher(context.config.mirror, renderer.style())?;
            let manager = CheckpointManager::new(&switcher, Box::new(PipPackageLister::default()));
            let restored = manager.restore(&name)?;
            renderer.print_lines(&format_restore_lines(&restored, renderer.style()));
            Ok(())
        }
        Commands::Rollback { txid } => {
            let report = context.engine.rollback(&txid)?;
            if report.outcome == RollbackOutcome::NotFound {
                return Err(anyhow!("no transaction record found for '{txid}'"));
            }
            renderer.print_lines(&format_rollback_report_lines(&report, renderer.style()));
            if report.needs_manual_intervention() {
                return Err(anyhow!(
                    "rollback of {txid} finished with {} failed step(s)",
                    report.failures.len()
                ));
            }
            Ok(())
        }
        Commands::Recover => {
            let outcome = context
                .monitor()
                .auto_recover("recovery requested".to_string())?;
            renderer.print_lines(&format_monitor_lines(&outcome, renderer.style()));
            Ok(())
        }
        Commands::Monitor { once } => {
            let monitor = context.monitor();
            if once {
                let outcome = monitor.check_once()?;
                renderer.print_lines(&format_monitor_lines(&outcome, renderer.style()));
                return Ok(());
            }
            renderer.print_status(
                "step",
                &format!(
                    "monitoring CUDA health every {}s (Ctrl-C to stop)",
                    context.config.monitor_interval_secs
                ),
            );
            let stop = AtomicBool::new(false);
            monitor.run(&stop)
        }
        Commands::History => {
            let records = context.engine.list_records()?;
            renderer.print_lines(&format_history_lines(&records));
            Ok(())
        }
        Commands::InstallFramework {
            framework,
            cuda_version,
            mirror,
        } => {
            let cuda = match cuda_version {
                Some(raw) => ToolkitVersion::parse(&raw)?,
                None => LayoutDetector::new(context.layout.clone())
                    .detect_active_version()?
                    .ok_or_else(|| anyhow!("no active CUDA version; pass --cuda-version"))?,
            };
            install_frameworks(renderer, framework, &cuda, context.mirror(mirror))
        }
        Commands::Completions { .. } => Ok(()),
    }
}

fn recover_interrupted(context: &AppContext, renderer: TerminalRenderer) -> Result<()> {
    let reports = context
        .engine
        .recover_interrupted()
        .context("failed to recover interrupted transactions")?;
    for report in &reports {
        renderer.print_lines(&format_rollback_report_lines(report, renderer.style()));
    }
    Ok(())
}

fn run_install(
    context: &AppContext,
    renderer: TerminalRenderer,
    version: &str,
    framework: Option<FrameworkChoice>,
    mirror: Mirror,
) -> Result<()> {
    let cuda = ToolkitVersion::parse(version)?;
    let switcher = context.switcher(mirror, renderer.style())?;
    renderer.print_section(&format!("install cuda {cuda}"));
    if mirror == Mirror::China {
        renderer.print_status("step", "using the China mirror");
    }

    switch_or_fail(&switcher, renderer, version)?;
    if let Some(choice) = framework {
        install_frameworks(renderer, choice, &cuda, mirror)?;
    }
    Ok(())
}

fn switch_or_fail(switcher: &VersionSwitcher, renderer: TerminalRenderer, version: &str) -> Result<()> {
    if !switcher.switch(version)? {
        return Err(anyhow!(
            "CUDA {version} could not be installed; the previous state was restored"
        ));
    }
    renderer.print_status("ok", &format!("CUDA {version} is active"));
    renderer.print_status(
        "step",
        "open a new shell (or source your profile) to pick up the new PATH",
    );
    Ok(())
}

fn install_frameworks(
    renderer: TerminalRenderer,
    choice: FrameworkChoice,
    cuda: &ToolkitVersion,
    mirror: Mirror,
) -> Result<()> {
    let mut failed = Vec::new();
    for framework in choice.frameworks() {
        renderer.print_status(
            "step",
            &format!("installing {} for CUDA {cuda}", framework.as_str()),
        );
        match install_framework(framework, cuda, mirror) {
            Ok(()) => renderer.print_status("ok", &format!("{} installed", framework.as_str())),
            Err(err) => {
                renderer.print_status("err", &format!("{err:#}"));
                failed.push(framework.as_str());
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("framework install failed: {}", failed.join(", ")))
    }
}

fn run_status(context: &AppContext, renderer: TerminalRenderer) -> Result<()> {
    let switcher = context.switcher(context.config.mirror, renderer.style())?;
    let inventory = switcher.inventory()?;
    let profile_dir = context
        .config
        .resolved_shell_profiles(context.layout.home_dir())
        .into_iter()
        .find_map(|path| {
            fs::read_to_string(path)
                .ok()
                .and_then(|contents| read_managed_install_dir(&contents))
        });

    renderer.print_section("status");
    renderer.print_lines(&format_status_lines(
        &inventory,
        &context.platform,
        profile_dir.as_deref(),
    ));
    let (status, message) = match detect_gpu_driver() {
        DriverStatus::Ready => ("ok", "GPU driver: nvidia-smi ok"),
        DriverStatus::Failing => ("err", "GPU driver: nvidia-smi reported an error"),
        DriverStatus::Missing => ("warn", "GPU driver: nvidia-smi not found"),
    };
    renderer.print_status(status, message);
    Ok(())
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum DriverStatus {
    Ready,
    Failing,
    Missing,
}

fn detect_gpu_driver() -> DriverStatus {
    match Command::new("nvidia-smi").output() {
        Ok(output) if output.status.success() => DriverStatus::Ready,
        Ok(_) => DriverStatus::Failing,
        Err(err) => {
            debug!(error = %err, "nvidia-smi unavailable");
            DriverStatus::Missing
        }
    }
}

fn run_cleanup(context: &AppContext, renderer: TerminalRenderer, yes: bool) -> Result<()> {
    let targets = [context.layout.cache_dir(), context.layout.downloads_dir()];
    let mut total = 0_u64;
    for target in &targets {
        total += dir_size(target)?;
    }

    if total == 0 {
        renderer.print_status("ok", "cache is already empty");
    } else {
        renderer.print_status("step", &format!("cache size: {}", format_megabytes(total)));
        if !yes {
            renderer.print_status(
                "warn",
                "nothing removed; rerun with --yes to delete cached toolkits and downloads",
            );
            return Ok(());
        }
    }
    if !yes {
        return Ok(());
    }

    // prune holds the transaction lock, so this fails while a switch is running.
    let pruned = context.engine.prune(context.config.keep_transactions)?;
    if total > 0 {
        for target in &targets {
            clear_dir(target)?;
        }
        renderer.print_status("ok", &format!("removed {}", format_megabytes(total)));
    }
    if !pruned.is_empty() {
        renderer.print_status(
            "ok",
            &format!("pruned {} old transaction record(s)", pruned.len()),
        );
    }
    Ok(())
}

fn clear_dir(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to remove {}", path.display()));
        }
    }
    fs::create_dir_all(path).with_context(|| format!("failed to recreate {}", path.display()))
}

pub(crate) fn format_status_lines(
    inventory: &VersionInventory,
    platform: &PlatformDetection,
    profile_dir: Option<&str>,
) -> Vec<String> {
    let active = inventory
        .active
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string());
    let platform_note = if platform.exact { "" } else { " (fallback)" };

    vec![
        format!("active cuda: {active}"),
        format!("installed: {}", join_versions(&inventory.installed)),
        format!("cached: {}", join_versions(&inventory.cached)),
        format!("platform: {}{platform_note}", platform.tag.as_str()),
        format!("shell profile: {}", profile_dir.unwrap_or("not configured")),
    ]
}

fn join_versions(versions: &[ToolkitVersion]) -> String {
    if versions.is_empty() {
        return "none".to_string();
    }
    versions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn format_version_lines(
    catalog: &ArtifactCatalog,
    inventory: &VersionInventory,
    platform: &PlatformDetection,
) -> Vec<String> {
    let mut versions = BTreeSet::new();
    versions.extend(catalog.versions());
    versions.extend(inventory.installed.iter().cloned());
    versions.extend(inventory.cached.iter().cloned());
    versions.extend(inventory.active.iter().cloned());

    versions
        .into_iter()
        .map(|version| {
            let active = inventory.active.as_ref() == Some(&version);
            let mut tags = Vec::new();
            if active {
                tags.push("active");
            }
            if inventory.installed.contains(&version) {
                tags.push("installed");
            }
            if inventory.cached.contains(&version) {
                tags.push("cached");
            }
            if catalog.supports(&version, platform.tag) {
                tags.push("available");
            } else if tags.is_empty() {
                tags.push("unsupported");
            }
            let marker = if active { '*' } else { ' ' };
            format!("{marker} {version} ({})", tags.join(", "))
        })
        .collect()
}

pub(crate) fn format_uninstall_lines(report: &UninstallReport, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    for profile in &report.profiles_cleared {
        lines.push(render_status_line(
            style,
            "ok",
            &format!("removed CUDA configuration from {}", profile.display()),
        ));
    }
    for path in &report.toolkits_removed {
        lines.push(render_status_line(
            style,
            "ok",
            &format!("removed {}", path.display()),
        ));
    }
    if report.state_removed {
        lines.push(render_status_line(style, "ok", "removed dlmate state directory"));
    }
    lines.push(render_status_line(style, "ok", "DeepLearningMate uninstalled"));
    lines
}

pub(crate) fn format_rollback_report_lines(
    report: &RollbackReport,
    style: OutputStyle,
) -> Vec<String> {
    let (status, headline) = match report.outcome {
        RollbackOutcome::NotFound => (
            "warn",
            format!("no transaction record found for '{}'", report.txid),
        ),
        RollbackOutcome::AlreadyRolledBack => (
            "ok",
            format!("transaction {} was already rolled back", report.txid),
        ),
        RollbackOutcome::AlreadyReverted => (
            "ok",
            format!("transaction {} was already reverted", report.txid),
        ),
        RollbackOutcome::RolledBack => ("ok", format!("rolled back transaction {}", report.txid)),
        RollbackOutcome::Reverted => ("ok", format!("reverted transaction {}", report.txid)),
    };
    let status = if report.needs_manual_intervention() {
        "warn"
    } else {
        status
    };

    let mut lines = vec![render_status_line(style, status, &headline)];
    for failure in &report.failures {
        lines.push(render_status_line(
            style,
            "err",
            &format!("rollback step failed: {failure}"),
        ));
    }
    if report.needs_manual_intervention() {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "manual intervention required: transaction {} was only partially restored",
                report.txid
            ),
        ));
    }
    lines
}

pub(crate) fn format_monitor_lines(outcome: &MonitorOutcome, style: OutputStyle) -> Vec<String> {
    match outcome {
        MonitorOutcome::Healthy { version } => {
            let message = match version {
                Some(version) => format!("CUDA healthy (nvcc {version})"),
                None => "CUDA healthy".to_string(),
            };
            vec![render_status_line(style, "ok", &message)]
        }
        MonitorOutcome::NothingToRecover { reason } => vec![render_status_line(
            style,
            "warn",
            &format!("{reason}; no committed transaction to revert"),
        )],
        MonitorOutcome::AlreadyReverted { reason, txid } => vec![render_status_line(
            style,
            "warn",
            &format!("{reason}; latest transaction {txid} was already reverted"),
        )],
        MonitorOutcome::Recovered { reason, report } => {
            let mut lines = vec![render_status_line(style, "warn", reason)];
            lines.extend(format_rollback_report_lines(report, style));
            lines
        }
    }
}

pub(crate) fn format_restore_lines(restored: &CheckpointRestore, style: OutputStyle) -> Vec<String> {
    let name = &restored.checkpoint.name;
    let mut lines = Vec::new();
    if restored.switched {
        let version = restored
            .checkpoint
            .active_version
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "none".to_string());
        lines.push(render_status_line(
            style,
            "ok",
            &format!("switched to CUDA {version}"),
        ));
    }
    if restored.environment_restored {
        lines.push(render_status_line(style, "ok", "environment variables restored"));
    }
    lines.push(render_status_line(
        style,
        "ok",
        &format!("restored checkpoint '{name}'"),
    ));

    if let Some(drift) = &restored.package_drift {
        if !drift.missing.is_empty() {
            lines.push(render_status_line(
                style,
                "warn",
                &format!("packages missing since checkpoint: {}", drift.missing.join(", ")),
            ));
        }
        if !drift.added.is_empty() {
            lines.push(render_status_line(
                style,
                "warn",
                &format!("packages added since checkpoint: {}", drift.added.join(", ")),
            ));
        }
    }
    lines
}

pub(crate) fn format_history_lines(records: &[TransactionRecord]) -> Vec<String> {
    if records.is_empty() {
        return vec!["no transactions recorded".to_string()];
    }

    records
        .iter()
        .map(|record| {
            let reverted = if record.reverted_at_unix.is_some() {
                " (reverted)"
            } else {
                ""
            };
            format!(
                "{} {} {}{} started={}",
                record.txid, record.operation, record.status, reverted, record.started_at_unix
            )
        })
        .collect()
}
