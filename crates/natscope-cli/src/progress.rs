//! Discovery progress display.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner shown while discovery runs
pub struct DiscoveryProgress {
    bar: ProgressBar,
}

impl DiscoveryProgress {
    /// Create a spinner for a run against `server`
    #[must_use]
    pub fn new(server: &str) -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_message(format!("Discovering NAT via {server}"));

        Self { bar }
    }

    /// Set custom message
    pub fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    /// Remove the spinner
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Format a round-trip time in milliseconds
///
/// # Example
///
/// ```ignore
/// assert_eq!(format_rtt(0.0), "n/a");
/// assert_eq!(format_rtt(12.345), "12.3 ms");
/// ```
#[must_use]
pub fn format_rtt(ms: f64) -> String {
    if ms <= 0.0 {
        "n/a".to_string()
    } else {
        format!("{ms:.1} ms")
    }
}

/// Format uptime in human-readable format
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_rtt() {
        assert_eq!(format_rtt(0.0), "n/a");
        assert_eq!(format_rtt(12.345), "12.3 ms");
        assert_eq!(format_rtt(1.0), "1.0 ms");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m");
    }
}
