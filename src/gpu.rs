//! GPU detection
//!
//! Queries nvidia-smi for the devices visible to this process and their memory.
//! Only the first device matters for budget resolution; the rest are listed for
//! the `gpus` subcommand.

use crate::units::{MIB, format_size};
use std::process::Command;

/// Memory figures for one visible device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuDevice {
    /// Index as reported by nvidia-smi
    pub index: u32,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Information about available GPUs
#[derive(Debug, Clone, Default)]
pub struct GpuInfo {
    pub devices: Vec<GpuDevice>,
}

impl GpuInfo {
    pub fn count(&self) -> usize {
        self.devices.len()
    }

    /// First available device, the one budget sentinels resolve against
    pub fn first(&self) -> Option<&GpuDevice> {
        self.devices.first()
    }
}

/// Parse `nvidia-smi --query-gpu=index,memory.total,memory.free --format=csv,noheader,nounits`
///
/// Memory columns are MiB. Malformed lines are skipped.
pub fn parse_nvidia_smi(stdout: &str) -> Vec<GpuDevice> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let index = fields.next()?.parse::<u32>().ok()?;
            let total = fields.next()?.parse::<u64>().ok()?;
            let free = fields.next()?.parse::<u64>().ok()?;
            Some(GpuDevice {
                index,
                total_bytes: total * MIB,
                free_bytes: free * MIB,
            })
        })
        .collect()
}

/// Detect available GPUs using nvidia-smi
///
/// A missing or failing nvidia-smi yields an empty list; callers decide whether
/// that is acceptable for the requested budget.
pub fn detect_gpus() -> GpuInfo {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,memory.total,memory.free",
            "--format=csv,noheader,nounits",
        ])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let devices = parse_nvidia_smi(&stdout);

            for device in &devices {
                tracing::info!(
                    index = device.index,
                    total = %format_size(device.total_bytes),
                    free = %format_size(device.free_bytes),
                    "Detected GPU"
                );
            }

            GpuInfo { devices }
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                stderr = %stderr,
                "nvidia-smi failed, assuming no GPUs available"
            );
            GpuInfo::default()
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to run nvidia-smi, assuming no GPUs available"
            );
            GpuInfo::default()
        }
    }
}
