//! Device memory hygiene for a generation run.
//!
//! Candle frees device buffers as soon as the owning tensors drop, so the run
//! only needs to make sure queued kernels finish and everything is dropped on
//! every exit path. [`DeviceSession`] ties that to a scope.

use candle_core::Device;
use log::{debug, info, warn};
use std::process::Command;
use std::time::Instant;

/// Scoped guard over a compute device. Dropping it waits for outstanding
/// device work and logs the session's duration and memory state.
pub struct DeviceSession {
    device: Device,
    label: String,
    started: Instant,
}

impl DeviceSession {
    pub fn begin(device: &Device, label: impl Into<String>) -> Self {
        let label = label.into();
        debug!("[{label}] session start: {}", gpu_memory_info());
        Self {
            device: device.clone(),
            label,
            started: Instant::now(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Wait for queued device work to complete.
    pub fn synchronize(&self) {
        if let Err(e) = self.device.synchronize() {
            warn!("[{}] device synchronize failed: {e}", self.label);
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.synchronize();
        info!(
            "[{}] released device resources after {:.1}s",
            self.label,
            self.started.elapsed().as_secs_f64()
        );
        debug!("[{}] session end: {}", self.label, gpu_memory_info());
    }
}

/// Current GPU memory usage as reported by `nvidia-smi`.
pub fn gpu_memory_info() -> String {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.used,memory.free,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            parse_memory_query(&String::from_utf8_lossy(&output.stdout))
                .unwrap_or_else(|| "GPU memory info not available".to_string())
        }
        _ => "GPU memory info not available".to_string(),
    }
}

/// Format the first GPU line of `used, free, total` (MiB).
fn parse_memory_query(stdout: &str) -> Option<String> {
    let line = stdout.lines().next()?;
    let parts: Vec<f32> = line
        .split(',')
        .map(|part| part.trim().parse().ok())
        .collect::<Option<_>>()?;
    let [used, free, total] = parts[..] else {
        return None;
    };
    if total <= 0.0 {
        return None;
    }
    Some(format!(
        "GPU Memory: {:.1}GB/{:.1}GB used ({:.1}% free)",
        used / 1024.0,
        total / 1024.0,
        (free / total) * 100.0
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_query() {
        assert_eq!(
            parse_memory_query("12288, 12288, 24576\n").as_deref(),
            Some("GPU Memory: 12.0GB/24.0GB used (50.0% free)")
        );
        assert_eq!(parse_memory_query(""), None);
        assert_eq!(parse_memory_query("1, 2"), None);
        assert_eq!(parse_memory_query("[N/A], 1, 2"), None);
    }

    #[test]
    fn test_session_drops_on_cpu() {
        let session = DeviceSession::begin(&Device::Cpu, "test");
        assert!(session.device().is_cpu());
        session.synchronize();
        drop(session);
    }
}
