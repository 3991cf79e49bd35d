mod completion;
mod dispatch;
mod download;
mod frameworks;
mod render;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use dlmate_core::Mirror;
use dlmate_installer::{interrupt_requested, INTERRUPT_EXIT_CODE};
use tracing_subscriber::EnvFilter;

use crate::dispatch::run_cli;
use crate::frameworks::FrameworkChoice;

#[derive(Parser, Debug)]
#[command(name = "dlmate")]
#[command(version)]
#[command(about = "CUDA toolkit version manager with transactional rollback", long_about = None)]
struct Cli {
    /// State directory (defaults to $DLMATE_HOME or ~/.deeplearningmate).
    #[arg(long, global = true)]
    state_root: Option<PathBuf>,
    /// Directory holding cuda-X.Y installs and the cuda pointer.
    #[arg(long, global = true)]
    install_base: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the active toolkit, installed versions and driver health.
    Status,
    /// Install (or switch to) a CUDA version, optionally with a framework.
    Install {
        version: String,
        #[arg(long, value_enum)]
        framework: Option<FrameworkChoice>,
        #[arg(long, value_enum)]
        mirror: Option<MirrorArg>,
    },
    /// Make an installed or cached CUDA version active.
    Switch {
        version: String,
        #[arg(long, value_enum)]
        mirror: Option<MirrorArg>,
    },
    ListVersions,
    /// Delete an inactive CUDA install and its cache entry.
    Remove { version: String },
    /// Delete cached toolkits, downloads and old transaction records.
    Cleanup {
        #[arg(long)]
        yes: bool,
    },
    /// Remove the managed profile block, CUDA installs and dlmate state.
    Uninstall {
        #[arg(long)]
        yes: bool,
        /// Keep the state directory (config, checkpoints, history).
        #[arg(long)]
        keep_config: bool,
        /// Keep the cuda pointer and every cuda-X.Y install.
        #[arg(long)]
        keep_cuda: bool,
    },
    /// Save the active version, environment and packages under a name.
    Checkpoint { name: String },
    Restore { name: String },
    /// Roll back (or revert) a transaction by id.
    Rollback { txid: String },
    /// Revert the most recent committed transaction.
    Recover,
    Monitor {
        #[arg(long)]
        once: bool,
    },
    History,
    InstallFramework {
        #[arg(value_enum)]
        framework: FrameworkChoice,
        #[arg(long)]
        cuda_version: Option<String>,
        #[arg(long, value_enum)]
        mirror: Option<MirrorArg>,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum MirrorArg {
    Official,
    China,
}

impl From<MirrorArg> for Mirror {
    fn from(value: MirrorArg) -> Self {
        match value {
            MirrorArg::Official => Mirror::Official,
            MirrorArg::China => Mirror::China,
        }
    }
}

fn init_logging() {
    let filter = std::env::var("DLMATE_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(err) = run_cli(cli) {
        eprintln!("error: {err:#}");
        if interrupt_requested() {
            std::process::exit(INTERRUPT_EXIT_CODE);
        }
        std::process::exit(1);
    }
}
