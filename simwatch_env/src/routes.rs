//! Control-plane routes and stream URL construction.

use crate::error::EnvError;
use crate::types::RunId;
use reqwest::header::HeaderMap;
use reqwest::Url;

/// `POST`: start a scenario.
pub const START_PATH: &str = "/api/scenario";

/// `PUT`: emergency stop, no body.
pub const PANIC_PATH: &str = "/api/scenario/panic";

/// Response header carrying the streaming endpoint path.
pub const STREAM_HEADER: &str = "x-scenario-ws";

/// Placeholder id used in the stop path when no scenario is known.
pub const NO_SCENARIO: &str = "NO_SCENARIO";

/// `PATCH` path that stops the given run (or the sentinel when absent).
pub fn stop_path(id: Option<&RunId>) -> String {
    let key = id.map(RunId::as_key).unwrap_or_else(|| NO_SCENARIO.to_string());
    format!("/api/scenario/{}/stop", key)
}

/// Reads the stream locator from start-response headers.
///
/// Blank or non-ASCII header values count as absent.
pub fn locator_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(STREAM_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Builds the stream URL for a locator on the same host as `base`.
///
/// `http` maps to `ws`, `https` to `wss`.
pub fn stream_url(base: &Url, locator: &str) -> Result<String, EnvError> {
    let scheme = match base.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    let host = base
        .host_str()
        .ok_or_else(|| EnvError::invalid_url(format!("base URL has no host: {}", base)))?;
    let authority = match base.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let path = if locator.starts_with('/') {
        locator.to_string()
    } else {
        format!("/{}", locator)
    };

    Ok(format!("{}://{}{}", scheme, authority, path))
}
