//! info command - show the selected device and effective settings

use anyhow::{Context, Result};
use gdscan_config::{BackendKind, ScanConfig};
use gdscan_core::{ScanSession, SessionOptions};
use gdscan_gpu::{DeviceInfo, GpuBackend, SimConfig, SimDevice};

use super::format_bytes;

/// Execute the info command
pub fn execute(config: &ScanConfig) -> Result<()> {
    let options = SessionOptions::from_config(config).context("Invalid configuration")?;

    let (info, available) = match config.device.backend {
        BackendKind::Sim => probe::<SimDevice>(SimConfig::default(), options)?,
        BackendKind::Cuda => probe_cuda(config, options)?,
    };

    println!("Device Information");
    println!("{}", "=".repeat(50));
    println!("  Name:             {}", info.name);
    println!("  Backend:          {}", info.backend);
    println!("  Ordinal:          {}", info.ordinal);
    println!("  Total Memory:     {}", format_bytes(info.total_memory));
    println!("  Available Memory: {}", format_bytes(available));
    println!();
    println!("Pipeline");
    println!("{}", "=".repeat(50));
    println!("  Idle Timeout:     {:?}", config.pipeline.idle_timeout());
    println!("  Fence Timeout:    {:?}", config.pipeline.fence_timeout());
    println!("  Max File Size:    {}", format_bytes(config.pipeline.max_file_size));
    println!("  Pattern Mode:     {:?}", config.matching.mode);
    println!(
        "  Case Sensitive:   {}",
        if config.matching.case_insensitive { "no" } else { "yes" }
    );

    Ok(())
}

fn probe<B: GpuBackend>(backend_config: B::Config, options: SessionOptions) -> Result<(DeviceInfo, u64)> {
    let session = ScanSession::<B>::new(backend_config, options);
    session.start().context("Failed to initialize device")?;

    let info = session.device_info()?;
    let available = session.with_context(|ctx| ctx.backend().map(|backend| backend.available_memory()))?;
    session.stop();

    Ok((info, available))
}

#[cfg(feature = "cuda")]
fn probe_cuda(config: &ScanConfig, options: SessionOptions) -> Result<(DeviceInfo, u64)> {
    if !gdscan_gpu::CudaBackend::is_available() {
        anyhow::bail!("No CUDA device found");
    }
    let backend_config = gdscan_gpu::CudaConfig {
        device_id: config.device.ordinal as usize,
    };
    probe::<gdscan_gpu::CudaBackend>(backend_config, options)
}

#[cfg(not(feature = "cuda"))]
fn probe_cuda(_config: &ScanConfig, _options: SessionOptions) -> Result<(DeviceInfo, u64)> {
    anyhow::bail!("gdscan was built without CUDA support; rebuild with `--features cuda` or use `--backend sim`")
}
