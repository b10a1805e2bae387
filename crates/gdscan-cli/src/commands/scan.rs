//! scan command - ingest files through the device and match a pattern

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use gdscan_config::{BackendKind, ScanConfig};
use gdscan_core::{MatchMode, ScanReport, ScanSession, SessionOptions};
use gdscan_gpu::{GpuBackend, SimConfig, SimDevice};

use super::format_bytes;

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Match case-insensitively
    #[arg(short = 'i', long)]
    pub ignore_case: bool,

    /// Treat the pattern as a literal string instead of a regex
    #[arg(long)]
    pub literal: bool,

    /// Print results as a JSON array
    #[arg(long)]
    pub json: bool,

    /// Pattern to search for
    pub pattern: String,

    /// Files to scan, reported in this order
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

/// Execute the scan command
///
/// Returns exit status 1 when any file failed. Session-level failures
/// (device initialization, bad pattern) are returned as errors.
pub fn execute(args: &ScanArgs, config: &ScanConfig) -> Result<ExitCode> {
    let mut options = SessionOptions::from_config(config).context("Invalid configuration")?;
    if args.ignore_case {
        options.matcher.case_insensitive = true;
    }
    if args.literal {
        options.matcher.mode = MatchMode::Literal;
    }

    tracing::info!(
        backend = %config.device.backend,
        files = args.paths.len(),
        "Starting scan"
    );

    let report = match config.device.backend {
        BackendKind::Sim => run::<SimDevice>(SimConfig::default(), options, args)?,
        BackendKind::Cuda => run_cuda(config, options, args)?,
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if args.json {
        serde_json::to_writer_pretty(&mut out, &report.results).context("Failed to write results")?;
        writeln!(out)?;
    } else {
        for result in &report.results {
            writeln!(out, "{}", result)?;
        }
    }

    if report.resource_exhausted {
        tracing::warn!("Device memory was exhausted during the scan");
    }
    tracing::info!(
        "{} of {} files matched, {} failed, {} ingested",
        report.stats.matched,
        report.stats.files,
        report.stats.failed,
        format_bytes(report.stats.bytes_ingested)
    );

    Ok(if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn run<B: GpuBackend>(backend_config: B::Config, options: SessionOptions, args: &ScanArgs) -> Result<ScanReport> {
    let session = ScanSession::<B>::new(backend_config, options);
    session.start().context("Failed to start scan session")?;
    let report = session.scan(&args.paths, &args.pattern);
    session.stop();
    report.context("Scan failed")
}

#[cfg(feature = "cuda")]
fn run_cuda(config: &ScanConfig, options: SessionOptions, args: &ScanArgs) -> Result<ScanReport> {
    let backend_config = gdscan_gpu::CudaConfig {
        device_id: config.device.ordinal as usize,
    };
    run::<gdscan_gpu::CudaBackend>(backend_config, options, args)
}

#[cfg(not(feature = "cuda"))]
fn run_cuda(_config: &ScanConfig, _options: SessionOptions, _args: &ScanArgs) -> Result<ScanReport> {
    anyhow::bail!("gdscan was built without CUDA support; rebuild with `--features cuda` or use `--backend sim`")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pattern: &str, paths: Vec<PathBuf>) -> ScanArgs {
        ScanArgs {
            ignore_case: false,
            literal: false,
            json: false,
            pattern: pattern.to_string(),
            paths,
        }
    }

    #[test]
    fn test_run_on_sim() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, "foo bar").unwrap();

        let report = run::<SimDevice>(
            SimConfig::default(),
            SessionOptions::default(),
            &args("foo", vec![a, dir.path().join("missing.txt")]),
        )
        .unwrap();

        assert!(report.results[0].matched);
        assert!(report.has_failures());
    }

    #[test]
    fn test_session_errors_surface() {
        let err = run::<SimDevice>(SimConfig::default(), SessionOptions::default(), &args("", vec![PathBuf::from("a")]))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("pattern must not be empty"));
    }

    #[test]
    fn test_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, "foo").unwrap();
        let config = ScanConfig::default();

        let code = execute(&args("foo", vec![a.clone()]), &config).unwrap();
        assert_eq!(code, ExitCode::SUCCESS);

        let code = execute(&args("foo", vec![a, dir.path().join("missing.txt")]), &config).unwrap();
        assert_eq!(code, ExitCode::FAILURE);
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_unavailable() {
        let mut config = ScanConfig::default();
        config.device.backend = BackendKind::Cuda;
        let err = execute(&args("foo", vec![PathBuf::from("a")]), &config).unwrap_err();
        assert!(err.to_string().contains("without CUDA support"));
    }
}
