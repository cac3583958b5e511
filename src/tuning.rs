//! Auto-tuning module
//!
//! Detects hardware capabilities and derives the bucket count and
//! outbound queue depth from them.

use sysinfo::System;

/// Tuned configuration values based on hardware detection
#[derive(Debug, Clone)]
pub struct TunedConfig {
    /// Number of buckets (lock stripes)
    pub buckets: usize,
    /// Outbound channel capacity
    pub send_queue_len: usize,
    /// Detected CPU cores
    pub detected_cores: usize,
    /// Detected RAM in MB
    pub detected_ram_mb: u64,
}

impl Default for TunedConfig {
    fn default() -> Self {
        Self {
            buckets: 8,
            send_queue_len: 1024,
            detected_cores: 4,
            detected_ram_mb: 8192,
        }
    }
}

/// Detect the number of available CPU cores
pub fn detect_cpu_cores() -> usize {
    let sys = System::new_all();
    sys.cpus().len().max(1)
}

/// Detect total RAM in megabytes
pub fn detect_ram_mb() -> u64 {
    let sys = System::new_all();
    sys.total_memory() / 1024 / 1024
}

/// Auto-tune configuration based on detected hardware
///
/// Two buckets per core keep producers on different cores from contending
/// for the same lock. The outbound queue scales with the bucket count so a
/// push of every bucket at once still fits.
pub fn auto_tune() -> TunedConfig {
    let cores = detect_cpu_cores();
    let ram_mb = detect_ram_mb();

    let buckets = (cores * 2).clamp(2, 256);
    let send_queue_len = (buckets * 64).max(1024);

    let config = TunedConfig {
        buckets,
        send_queue_len,
        detected_cores: cores,
        detected_ram_mb: ram_mb,
    };

    tracing::info!(
        cores = cores,
        ram_mb = ram_mb,
        buckets = config.buckets,
        send_queue_len = config.send_queue_len,
        "Auto-tuned configuration based on hardware"
    );

    config
}

/// Get a human-readable summary of the tuned configuration
pub fn tuning_summary(config: &TunedConfig) -> String {
    format!(
        "Detected: {} cores, {} MB RAM\n\
         WolfSync: {} buckets, send queue {}",
        config.detected_cores, config.detected_ram_mb, config.buckets, config.send_queue_len,
    )
}
