use anyhow::{Context, Result};
use std::time::Duration;

/// Builds the shared reqwest client. System proxy discovery is opt-in
/// via `TRAINWATCH_ENABLE_SYSTEM_PROXY`; on some hosts discovery itself
/// misbehaves, so the default path skips it entirely.
pub fn build_http_client(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let allow_system_proxy = std::env::var("TRAINWATCH_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        if let Ok(client) = attempt_build(timeout, false) {
            return Ok(client);
        }
        tracing::warn!(
            "HTTP client initialization with system proxy discovery failed; retrying with no_proxy"
        );
    }

    attempt_build(timeout, true).context("Failed to initialize HTTP client (no_proxy fallback)")
}

fn attempt_build(
    timeout: Option<Duration>,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
