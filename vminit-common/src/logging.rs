//! Tracing bootstrap shared by the `agent`, `init` and `pause` subcommands.

use tracing_subscriber::EnvFilter;

/// Log levels accepted on the CLI surface (`--log-level`). Anything else
/// falls back to `info`, matching the rest of the `--log-level` parsing in
/// the binary's argument parser.
const KNOWN_LEVELS: &[&str] = &[
    "trace", "debug", "info", "notice", "warning", "error", "critical",
];

/// Normalize a requested log level against the accepted set, defaulting to
/// `info` for anything unrecognized (§6: "invalid values fall back to info").
pub fn normalize_level(requested: &str) -> &'static str {
    match requested.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        // tracing has no notice/critical levels; map onto the nearest ones.
        "notice" => "info",
        "warning" | "warn" => "warn",
        "error" => "error",
        "critical" => "error",
        _ => "info",
    }
}

/// Install a global tracing subscriber writing to stderr.
pub fn init_tracing(requested_level: &str) {
    let level = normalize_level(requested_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(normalize_level("bogus"), "info");
        assert_eq!(normalize_level("CRITICAL"), "error");
        assert_eq!(normalize_level("warning"), "warn");
    }
}
