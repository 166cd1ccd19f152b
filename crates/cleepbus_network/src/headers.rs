//! Mesh bus header codec.
//!
//! The mesh bus only carries string headers. Booleans travel as `"1"`/`"0"`,
//! lists and maps as JSON text. Decoding never fails as a whole: a malformed
//! value only affects its own field.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::peer::{DEFAULT_PEER_PORT, ExtraValue, PeerInfos};

/// Flat string headers exchanged with the mesh bus.
pub type Headers = BTreeMap<String, String>;

/// Header keys mapped onto dedicated [`PeerInfos`] fields.
const KNOWN_KEYS: [&str; 7] = ["uuid", "hostname", "port", "ssl", "auth", "cleepdesktop", "macs"];

/// Build the headers this bridge announces when joining the mesh.
pub fn announcement_headers(uuid: &str, version: &str, hostname: &str, macs: &[String]) -> Headers {
    let macs = serde_json::to_string(macs).unwrap_or_else(|_| "[]".to_string());

    let mut headers = Headers::new();
    headers.insert("uuid".into(), uuid.to_string());
    headers.insert("version".into(), version.to_string());
    headers.insert("hostname".into(), hostname.to_string());
    headers.insert("port".into(), DEFAULT_PEER_PORT.to_string());
    headers.insert("macs".into(), macs);
    headers.insert("ssl".into(), encode_bool(false).to_string());
    headers.insert("auth".into(), encode_bool(false).to_string());
    headers.insert("cleepdesktop".into(), encode_bool(true).to_string());
    headers.insert("apps".into(), "{}".into());
    headers
}

/// Decode peer headers into a [`PeerInfos`].
pub fn decode_peer_infos(headers: &Headers) -> PeerInfos {
    debug!("Decoding peer headers: {headers:?}");

    let mut infos = PeerInfos {
        uuid: headers.get("uuid").cloned(),
        hostname: headers.get("hostname").cloned(),
        ..PeerInfos::default()
    };

    if let Some(port) = headers.get("port") {
        infos.port = port.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid port header '{port}', using {DEFAULT_PEER_PORT}");
            DEFAULT_PEER_PORT
        });
    }
    infos.ssl = bool_header(headers, "ssl", infos.ssl);
    infos.auth = bool_header(headers, "auth", infos.auth);
    infos.cleepdesktop = bool_header(headers, "cleepdesktop", infos.cleepdesktop);
    if let Some(macs) = headers.get("macs") {
        infos.macs = serde_json::from_str(macs).unwrap_or_else(|e| {
            warn!("Invalid macs header '{macs}': {e}");
            Vec::new()
        });
    }

    infos.extra = headers
        .iter()
        .filter(|(key, _)| !KNOWN_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), decode_header_value(key, value)))
        .collect();

    infos
}

/// Decode a single header value: JSON when it parses, the raw string
/// otherwise.
///
/// Older peers send `apps` as a comma separated list; any `apps` value not
/// starting with `[` is split on commas first.
pub fn decode_header_value(key: &str, value: &str) -> ExtraValue {
    let decoded = if key == "apps" && !value.starts_with('[') {
        let apps: Vec<&str> = value.split(',').collect();
        serde_json::to_value(apps).ok()
    } else {
        serde_json::from_str::<Value>(value).ok()
    };

    match decoded {
        Some(json) => ExtraValue::from(json),
        None => ExtraValue::Str(value.to_string()),
    }
}

/// Parse a boolean header value.
///
/// Accepts `y, yes, t, true, on, 1` and `n, no, f, false, off, 0` in any
/// case.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "t" | "true" | "on" | "1" => Some(true),
        "n" | "no" | "f" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

pub fn encode_bool(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

fn bool_header(headers: &Headers, key: &str, default: bool) -> bool {
    match headers.get(key) {
        None => default,
        Some(raw) => parse_bool(raw).unwrap_or_else(|| {
            warn!("Invalid boolean header {key}='{raw}', using {default}");
            default
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
