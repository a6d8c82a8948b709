#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

use std::{
    fs::{self, File},
    path::PathBuf,
    sync::Arc,
};

use clap::Parser;
use eyre::WrapErr;
use tracing_subscriber::{
    Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};
use vkmem::device::DeviceContext;
use vkmembench::{bench, kernel};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Info,
    Debug,
    Warn,
    #[default]
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            //We clamp this to the lowest possible level but this shouldn't happen
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for vkmem::log::VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => vkmem::log::VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => vkmem::log::VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => vkmem::log::VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => vkmem::log::VulkanLogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum Mode {
    /// Host-to-device copy bandwidth sweep.
    #[default]
    Copy,
    /// Buffer device address compute kernel.
    Kernel,
    /// Copy sweep, then the kernel.
    All,
}

impl Mode {
    fn runs_copy(self) -> bool {
        matches!(self, Mode::Copy | Mode::All)
    }

    fn runs_kernel(self) -> bool {
        matches!(self, Mode::Kernel | Mode::All)
    }
}

/// Measure host-to-device copy bandwidth on the compute queue.
#[derive(clap::Parser, Debug)]
struct CliArgs {
    #[arg(short, long, default_value = "error")]
    tracing_log_level: TracingLogLevel,
    /// Enable the validation layer and forward its messages at this level.
    #[arg(short, long)]
    graphics_debug_level: Option<CliVulkanLogLevel>,
    #[arg(short, long, default_value = "copy")]
    mode: Mode,
    /// Smallest copy size in MiB, rounded up to a power of two.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    min_size_mib: u64,
    /// Largest copy size in MiB.
    #[arg(long, default_value_t = 1024, value_parser = clap::value_parser!(u64).range(1..))]
    max_size_mib: u64,
    /// SPIR-V for the kernel demo. Defaults to `shaders/copy_words.spv`
    /// next to the executable.
    #[arg(long)]
    shader: Option<PathBuf>,
}

fn default_shader_path() -> eyre::Result<PathBuf> {
    let exe = std::env::current_exe().wrap_err("Locating the executable")?;
    let dir = exe
        .parent()
        .ok_or_else(|| eyre::eyre!("executable {} has no parent", exe.display()))?;
    Ok(dir.join("shaders").join("copy_words.spv"))
}

/// Per-user directory for `vkmembench.log`, falling back to the working
/// directory.
fn log_dir() -> eyre::Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "vkmem", "vkmembench");
    match dirs {
        Some(dirs) => Ok(dirs.runtime_dir().unwrap_or(dirs.data_dir()).to_path_buf()),
        None => Ok(std::env::current_dir()?),
    }
}

/// Pretty stdout filtered at `level`, plus an unfiltered plain-text file.
/// Returns the log file path.
fn init_tracing(level: TracingLogLevel) -> eyre::Result<Option<PathBuf>> {
    if level == TracingLogLevel::Off {
        return Ok(None);
    }

    let dir = log_dir()?;
    fs::create_dir_all(&dir)
        .wrap_err_with(|| format!("Creating log directory {}", dir.display()))?;
    let path = dir.join("vkmembench.log");
    let file = File::create(&path)
        .wrap_err_with(|| format!("Creating log file {}", path.display()))?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_filter(LevelFilter::from_level(level.into()));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(stdout_layer.and_then(file_layer))
        .init();
    Ok(Some(path))
}

fn main() -> eyre::Result<()> {
    let cli_args = CliArgs::parse();

    if let Some(path) = init_tracing(cli_args.tracing_log_level)? {
        tracing::info!("Logging to {}", path.display());
    }
    tracing::debug!("cli_args: {:#?}", cli_args);

    let sizes = bench::sweep_sizes(cli_args.min_size_mib, cli_args.max_size_mib);
    if cli_args.mode.runs_copy() && sizes.is_empty() {
        eyre::bail!(
            "no power-of-two sizes between {} and {} MiB",
            cli_args.min_size_mib,
            cli_args.max_size_mib
        );
    }
    let shader_path = match cli_args.shader.clone() {
        Some(path) => path,
        None => default_shader_path()?,
    };

    // SAFETY: The only place the Vulkan loader is opened.
    let ctx = Arc::new(
        unsafe { DeviceContext::new(cli_args.graphics_debug_level.map(Into::into)) }
            .wrap_err("Creating the Vulkan compute context")?,
    );

    if cli_args.mode.runs_copy() {
        bench::run_copy_sweep(&ctx, &sizes)?;
    }
    if cli_args.mode.runs_kernel() {
        if cli_args.mode.runs_copy() {
            println!();
        }
        kernel::run_kernel_demo(&ctx, &shader_path)?;
    }

    tracing::trace!("Done, tearing down");
    ctx.wait_idle().wrap_err("Waiting for the device to go idle")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliArgs, clap::Error> {
        CliArgs::try_parse_from(std::iter::once("vkmembench").chain(args.iter().copied()))
    }

    #[test]
    fn defaults() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.tracing_log_level, TracingLogLevel::Error);
        assert_eq!(args.graphics_debug_level, None);
        assert_eq!(args.mode, Mode::Copy);
        assert_eq!(args.min_size_mib, 1);
        assert_eq!(args.max_size_mib, 1024);
        assert_eq!(args.shader, None);
    }

    #[test]
    fn graphics_debug_level_enables_validation() {
        let args = parse(&["--graphics-debug-level", "warning"]).unwrap();
        assert_eq!(args.graphics_debug_level, Some(CliVulkanLogLevel::Warning));
        let level: vkmem::log::VulkanLogLevel = CliVulkanLogLevel::Warning.into();
        assert_eq!(level, vkmem::log::VulkanLogLevel::Warning);
    }

    #[test]
    fn mode_and_sizes() {
        let args = parse(&[
            "--mode",
            "all",
            "--min-size-mib",
            "4",
            "--max-size-mib",
            "64",
            "--shader",
            "k.spv",
        ])
        .unwrap();
        assert_eq!(args.mode, Mode::All);
        assert!(args.mode.runs_copy() && args.mode.runs_kernel());
        assert_eq!(bench::sweep_sizes(args.min_size_mib, args.max_size_mib), [4, 8, 16, 32, 64]);
        assert_eq!(args.shader, Some(PathBuf::from("k.spv")));
    }

    #[test]
    fn kernel_mode_skips_copy() {
        let args = parse(&["-m", "kernel"]).unwrap();
        assert!(!args.mode.runs_copy());
        assert!(args.mode.runs_kernel());
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(parse(&["--min-size-mib", "0"]).is_err());
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(parse(&["--mode", "pipelined"]).is_err());
    }

    #[test]
    fn tracing_levels_map_to_tracing() {
        assert_eq!(tracing::Level::from(TracingLogLevel::Debug), tracing::Level::DEBUG);
        assert_eq!(tracing::Level::from(TracingLogLevel::Off), tracing::Level::TRACE);
    }
}
