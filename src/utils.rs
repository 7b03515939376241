//! # Utility Functions Module
//!
//! Small helpers shared by the library and the binary:
//!
//! - **Identifiers**: unique run ids for benchmark artifacts
//! - **Formatting**: human-readable durations and throughput figures
//! - **Validation**: sanity checks for user-supplied ports and device lists
//!
//! ## Usage Examples
//!
//! ```rust
//! use backend_supervisor::utils::{format_speed, validate_api_port};
//!
//! # fn main() -> anyhow::Result<()> {
//! assert_eq!(format_speed(812.4, "H/s"), "812.40 H/s");
//! validate_api_port(4000)?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use std::time::Duration;
use uuid::Uuid;

/// Generate a unique identifier for a run
///
/// Creates a UUID v4 string. Benchmark log artifacts are named with it so
/// that two benchmarks of the same backend never write to the same file,
/// even when several supervisors share a log directory.
///
/// ## Returns
/// String representation of a UUID v4 (e.g., "550e8400-e29b-41d4-a716-446655440000")
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Format a duration for log output
///
/// Sub-second durations are shown in milliseconds, durations under a minute
/// in seconds, and anything longer as minutes and seconds (plus hours when
/// needed).
///
/// ## Examples
///
/// ```rust
/// # use backend_supervisor::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
/// assert_eq!(format_duration(Duration::from_secs(5)), "5s");
/// assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
/// assert_eq!(format_duration(Duration::from_secs(180)), "3m 0s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    if duration < Duration::from_secs(1) {
        return format!("{}ms", duration.as_millis());
    }

    let seconds = duration.as_secs();
    if seconds < 60 {
        if duration.subsec_millis() == 0 {
            format!("{}s", seconds)
        } else {
            format!("{:.2}s", duration.as_secs_f64())
        }
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!(
            "{}h {}m {}s",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    }
}

/// Format a throughput figure with a decimal SI prefix
///
/// `unit` is the backend's base unit, e.g. `"H/s"` or `"Sol/s"`.
///
/// ## Unit Scaling
///
/// Uses decimal scaling (powers of 1000), which is how hashrates are
/// conventionally reported:
/// - Base: < 1,000 (e.g., "812.40 H/s")
/// - Kilo: < 1,000,000 (e.g., "1.50 kH/s")
/// - Mega: < 1,000,000,000 (e.g., "2.30 MH/s")
/// - Giga: everything above
///
/// ## Examples
///
/// ```rust
/// # use backend_supervisor::utils::format_speed;
/// assert_eq!(format_speed(14.7, "Sol/s"), "14.70 Sol/s");
/// assert_eq!(format_speed(1500.0, "H/s"), "1.50 kH/s");
/// assert_eq!(format_speed(2_300_000.0, "H/s"), "2.30 MH/s");
/// ```
pub fn format_speed(speed: f64, unit: &str) -> String {
    const K: f64 = 1_000.0;
    const M: f64 = K * 1_000.0;
    const G: f64 = M * 1_000.0;

    let magnitude = speed.abs();
    if magnitude < K {
        format!("{:.2} {}", speed, unit)
    } else if magnitude < M {
        format!("{:.2} k{}", speed / K, unit)
    } else if magnitude < G {
        format!("{:.2} M{}", speed / M, unit)
    } else {
        format!("{:.2} G{}", speed / G, unit)
    }
}

/// Validate a telemetry API port
///
/// The backend binds the port on loopback, so it must be non-zero and
/// outside the privileged range to work without root.
pub fn validate_api_port(port: u16) -> Result<()> {
    if port < 1024 {
        anyhow::bail!("API port {} is too low (below 1024)", port);
    }
    Ok(())
}

/// Validate a device selection
///
/// At least one device is required; duplicates are tolerated because
/// [`crate::setup::MiningSetup`] drops them.
pub fn validate_devices(devices: &[u32]) -> Result<()> {
    if devices.is_empty() {
        anyhow::bail!("At least one device must be selected");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_run_id_unique() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0ms");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m 0s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(0.0, "H/s"), "0.00 H/s");
        assert_eq!(format_speed(999.0, "Sol/s"), "999.00 Sol/s");
        assert_eq!(format_speed(1_500_000_000.0, "H/s"), "1.50 GH/s");
    }

    #[test]
    fn test_validate_api_port() {
        assert!(validate_api_port(4000).is_ok());
        assert!(validate_api_port(65535).is_ok());
        assert!(validate_api_port(0).is_err());
        assert!(validate_api_port(80).is_err());
    }

    #[test]
    fn test_validate_devices() {
        assert!(validate_devices(&[0]).is_ok());
        assert!(validate_devices(&[]).is_err());
    }
}
