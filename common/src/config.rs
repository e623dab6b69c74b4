//! Configuration parsing – reads a KEY=VALUE file (same format as the
//! `gateway.conf` shipped with the service).
//!
//! The file is loaded once at startup and the resulting [`Config`] is handed
//! to every component that needs it.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── HTTP ─────────────────────────────────────────────────────────
    /// Address the MJPEG HTTP server listens on.
    pub listen_addr: String,

    // ── external pipeline ────────────────────────────────────────────
    /// Path to `gst-launch-1.0` (or anything accepting the same arguments).
    pub gst_bin: PathBuf,
    /// Where the child writes its own debug log (`GST_DEBUG_FILE`).
    pub gst_log_file: PathBuf,
    /// Value for `GST_DEBUG` in the child environment.
    pub gst_debug_level: String,
    /// Optional TOML file replacing the built-in pipeline table.
    pub pipelines_file: Option<PathBuf>,
    /// How long a child gets to exit after SIGTERM before it is killed.
    pub terminate_grace: Duration,

    // ── network ──────────────────────────────────────────────────────
    /// Receive timeout while sniffing the payload type.
    pub socket_timeout: Duration,
    /// Interface address used for multicast joins and `udpsrc`.
    pub multicast_interface: Ipv4Addr,
    pub auto_multicast: bool,
    /// `rtpjitterbuffer latency` in milliseconds.
    pub jitter_buffer_latency: u32,

    // ── cache ────────────────────────────────────────────────────────
    pub cache_file: PathBuf,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/mcast-mjpeg/gateway.conf"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8081".into(),
            gst_bin: PathBuf::from("gst-launch-1.0"),
            gst_log_file: PathBuf::from("gst_debug.log"),
            gst_debug_level: "4".into(),
            pipelines_file: None,
            terminate_grace: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(5),
            multicast_interface: Ipv4Addr::UNSPECIFIED,
            auto_multicast: true,
            jitter_buffer_latency: 200,
            cache_file: PathBuf::from("payload_cache.json"),
        }
    }
}

/// Load a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored, but a known key with
/// a value that does not parse is an error.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let config = from_map(&parse_conf(&text))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

fn from_map(map: &HashMap<String, String>) -> Result<Config> {
    let defaults = Config::default();
    let get = |key: &str| -> Option<&str> {
        map.get(key).map(String::as_str).filter(|v| !v.is_empty())
    };

    let socket_timeout = match get("SOCKET_TIMEOUT_SECS") {
        Some(v) => {
            let secs: f64 = parse_value("SOCKET_TIMEOUT_SECS", v)?;
            Duration::try_from_secs_f64(secs)
                .ok()
                .filter(|d| !d.is_zero())
                .with_context(|| format!("SOCKET_TIMEOUT_SECS must be positive, got {v}"))?
        }
        None => defaults.socket_timeout,
    };

    let terminate_grace = match get("TERMINATE_GRACE_SECS") {
        Some(v) => Duration::from_secs(parse_value("TERMINATE_GRACE_SECS", v)?),
        None => defaults.terminate_grace,
    };

    Ok(Config {
        listen_addr: get("LISTEN_ADDR")
            .map(str::to_string)
            .unwrap_or(defaults.listen_addr),
        gst_bin: get("GST_BIN").map(PathBuf::from).unwrap_or(defaults.gst_bin),
        gst_log_file: get("GST_LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.gst_log_file),
        gst_debug_level: get("GST_DEBUG_LEVEL")
            .map(str::to_string)
            .unwrap_or(defaults.gst_debug_level),
        pipelines_file: get("PIPELINES_FILE").map(PathBuf::from),
        terminate_grace,
        socket_timeout,
        multicast_interface: get("MULTICAST_IFACE")
            .map(|v| parse_value("MULTICAST_IFACE", v))
            .transpose()?
            .unwrap_or(defaults.multicast_interface),
        auto_multicast: get("AUTO_MULTICAST")
            .map(|v| parse_bool("AUTO_MULTICAST", v))
            .transpose()?
            .unwrap_or(defaults.auto_multicast),
        jitter_buffer_latency: get("JITTER_BUFFER_LATENCY")
            .map(|v| parse_value("JITTER_BUFFER_LATENCY", v))
            .transpose()?
            .unwrap_or(defaults.jitter_buffer_latency),
        cache_file: get("CACHE_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_file),
    })
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid value for {key}: {value:?}"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("Invalid value for {key}: {value:?} (expected true/false)"),
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
