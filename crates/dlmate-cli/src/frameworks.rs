use std::process::Command;

use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use dlmate_core::{Mirror, ToolkitVersion};
use tracing::info;

pub(crate) const TUNA_PYPI_INDEX: &str = "https://pypi.tuna.tsinghua.edu.cn/simple";
const PYTORCH_WHEEL_INDEX: &str = "https://download.pytorch.org/whl";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Framework {
    PyTorch,
    TensorFlow,
}

impl Framework {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::PyTorch => "pytorch",
            Self::TensorFlow => "tensorflow",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum FrameworkChoice {
    Pytorch,
    Tensorflow,
    Both,
}

impl FrameworkChoice {
    pub(crate) fn frameworks(self) -> Vec<Framework> {
        match self {
            Self::Pytorch => vec![Framework::PyTorch],
            Self::Tensorflow => vec![Framework::TensorFlow],
            Self::Both => vec![Framework::PyTorch, Framework::TensorFlow],
        }
    }
}

/// CUDA wheel tag published by PyTorch for a toolkit release.
pub(crate) fn pytorch_wheel_tag(cuda: &ToolkitVersion) -> Option<&'static str> {
    match (cuda.major(), cuda.minor()) {
        (11, 8) => Some("cu118"),
        (12, 0) | (12, 1) => Some("cu121"),
        _ => None,
    }
}

fn tensorflow_supports(cuda: &ToolkitVersion) -> bool {
    matches!((cuda.major(), cuda.minor()), (11, 8) | (12, 0) | (12, 1))
}

pub(crate) fn build_pip_install_command(
    pip: &str,
    framework: Framework,
    cuda: &ToolkitVersion,
    mirror: Mirror,
) -> Result<Command> {
    let mut command = Command::new(pip);
    command.arg("install");

    match framework {
        Framework::PyTorch => {
            let tag = pytorch_wheel_tag(cuda)
                .ok_or_else(|| anyhow!("no PyTorch build is published for CUDA {cuda}"))?;
            command
                .arg("torch")
                .arg("torchvision")
                .arg("torchaudio")
                .arg("--index-url")
                .arg(format!("{PYTORCH_WHEEL_INDEX}/{tag}"));
            if mirror == Mirror::China {
                command.arg("--extra-index-url").arg(TUNA_PYPI_INDEX);
            }
        }
        Framework::TensorFlow => {
            if !tensorflow_supports(cuda) {
                return Err(anyhow!("no TensorFlow build is published for CUDA {cuda}"));
            }
            command.arg("tensorflow[and-cuda]");
            if mirror == Mirror::China {
                command.arg("-i").arg(TUNA_PYPI_INDEX);
            }
        }
    }

    Ok(command)
}

pub(crate) fn install_framework(
    framework: Framework,
    cuda: &ToolkitVersion,
    mirror: Mirror,
) -> Result<()> {
    let mut command = build_pip_install_command("pip", framework, cuda, mirror)?;
    info!(
        framework = framework.as_str(),
        cuda = %cuda,
        mirror = mirror.as_str(),
        "installing framework"
    );
    run_command(
        &mut command,
        &format!("pip install for {} failed", framework.as_str()),
    )
}

fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}
