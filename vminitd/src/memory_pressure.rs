//! Guest-wide memory-pressure watcher. Referenced but never detailed by the
//! component table's data-flow line and the concurrency model's long-running
//! task list; logging-only since scheduling policy is out of scope.
//!
//! Polls `memory.pressure` in the agent's own cgroup (the PSI `some` line)
//! on a fixed interval rather than registering a `POLLPRI` trigger with the
//! event poller — the poller's own doc contract is level-triggered
//! readable/writable/hangup, not the kernel's separate PSI trigger
//! mechanism, so this stays a plain cooperative task like the DNS monitor.

use std::time::Duration;

use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const SOME_AVG10_WARN_THRESHOLD: f64 = 10.0;

/// Run forever, logging whenever the `some avg10` PSI figure in
/// `pressure_file` crosses [`SOME_AVG10_WARN_THRESHOLD`].
pub async fn run(pressure_file: impl AsRef<std::path::Path>) {
    let pressure_file = pressure_file.as_ref();
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    loop {
        interval.tick().await;
        match tokio::fs::read_to_string(pressure_file).await {
            Ok(contents) => {
                if let Some(avg10) = parse_some_avg10(&contents) {
                    if avg10 >= SOME_AVG10_WARN_THRESHOLD {
                        warn!(avg10, "guest-wide memory pressure crossed warn threshold");
                    }
                }
            }
            Err(e) => warn!("failed to read {}: {e}", pressure_file.display()),
        }
    }
}

/// Parse the `avg10` field off the `some` line of a PSI pressure file:
/// `some avg10=0.00 avg60=0.00 avg300=0.00 total=0`.
fn parse_some_avg10(contents: &str) -> Option<f64> {
    let line = contents.lines().find(|l| l.starts_with("some "))?;
    let field = line.split_whitespace().find(|f| f.starts_with("avg10="))?;
    field.strip_prefix("avg10=")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_avg10_off_the_some_line() {
        let body = "some avg10=12.34 avg60=5.00 avg300=1.00 total=9876\nfull avg10=0.00 avg60=0.00 avg300=0.00 total=0\n";
        assert_eq!(parse_some_avg10(body), Some(12.34));
    }

    #[test]
    fn missing_some_line_returns_none() {
        assert_eq!(parse_some_avg10("full avg10=0.00\n"), None);
    }
}
