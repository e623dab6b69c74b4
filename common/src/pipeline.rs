//! Pipeline construction – maps an RTP payload type onto a `gst-launch-1.0`
//! argument list that decodes the stream and emits multipart JPEG on stdout.
//!
//! The set of supported payload types is a [`PipelineTable`]. The built-in
//! table covers MPEG-PS (96) and MPEG-TS (33, 103); a TOML file can replace
//! it to pick other decoders:
//!
//! ```toml
//! [[profile]]
//! name = "mpeg-ts"
//! payload_types = [33, 103]
//! encoding_name = "MP2T"
//! depayloader = "rtpmp2tdepay2"
//! demuxer = "tsdemux"
//! parser = "h264parse"
//! decoder = "d3d11h264dec"
//! jpeg_quality = 85
//! queue_max_buffers = 2
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::endpoint::StreamEndpoint;

// ── boundary ─────────────────────────────────────────────────────────────

/// Multipart boundary shared by `multipartmux` and the HTTP `Content-Type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary(String);

impl Boundary {
    /// A fresh token, generated once per process.
    pub fn generate() -> Self {
        Self(format!("mjpegframe{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `multipart/x-mixed-replace; boundary=<token>`
    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.0)
    }
}

impl From<&str> for Boundary {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── table ────────────────────────────────────────────────────────────────

/// Decode chain for one family of payload types.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PipelineProfile {
    pub name: String,
    pub payload_types: Vec<u8>,
    /// `encoding-name` in the RTP caps, e.g. `MP2P`.
    pub encoding_name: String,
    pub depayloader: String,
    pub demuxer: String,
    pub parser: String,
    pub decoder: String,
    /// Overrides the global `JITTER_BUFFER_LATENCY`.
    #[serde(default)]
    pub latency_ms: Option<u32>,
    #[serde(default)]
    pub drop_on_latency: bool,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Frames held before the oldest is dropped.
    #[serde(default = "default_queue_max_buffers")]
    pub queue_max_buffers: u32,
    /// `fdsink sync`; off keeps latency minimal.
    #[serde(default)]
    pub sync: bool,
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_queue_max_buffers() -> u32 {
    2
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("pipeline table has no profiles")]
    Empty,
    #[error("profile `{profile}`: payload type {payload_type} is not a 7-bit value")]
    OutOfRange { profile: String, payload_type: u8 },
    #[error("payload type {payload_type} claimed by both `{first}` and `{second}`")]
    Duplicate {
        payload_type: u8,
        first: String,
        second: String,
    },
    #[error("profile `{0}` lists no payload types")]
    NoPayloadTypes(String),
    #[error("profile `{0}`: queue_max_buffers must be at least 1")]
    UnboundedQueue(String),
    #[error("profile `{profile}`: jpeg_quality {quality} is outside 0-100")]
    JpegQuality { profile: String, quality: u8 },
}

/// Closed allow-list of payload types and how to decode each.
#[derive(Debug, Clone)]
pub struct PipelineTable {
    profiles: Vec<PipelineProfile>,
    by_payload_type: BTreeMap<u8, usize>,
}

#[derive(Deserialize)]
struct TableFile {
    profile: Vec<PipelineProfile>,
}

impl PipelineTable {
    pub fn new(profiles: Vec<PipelineProfile>) -> Result<Self, TableError> {
        if profiles.is_empty() {
            return Err(TableError::Empty);
        }
        let mut by_payload_type = BTreeMap::new();
        for (idx, profile) in profiles.iter().enumerate() {
            if profile.payload_types.is_empty() {
                return Err(TableError::NoPayloadTypes(profile.name.clone()));
            }
            // `max-size-buffers=0` disables the limit, and with it leaky dropping.
            if profile.queue_max_buffers == 0 {
                return Err(TableError::UnboundedQueue(profile.name.clone()));
            }
            if profile.jpeg_quality > 100 {
                return Err(TableError::JpegQuality {
                    profile: profile.name.clone(),
                    quality: profile.jpeg_quality,
                });
            }
            for &pt in &profile.payload_types {
                if pt > 0x7F {
                    return Err(TableError::OutOfRange {
                        profile: profile.name.clone(),
                        payload_type: pt,
                    });
                }
                if let Some(prev) = by_payload_type.insert(pt, idx) {
                    return Err(TableError::Duplicate {
                        payload_type: pt,
                        first: profiles[prev].name.clone(),
                        second: profile.name.clone(),
                    });
                }
            }
        }
        Ok(Self {
            profiles,
            by_payload_type,
        })
    }

    /// Parse a TOML table (see module docs).
    pub fn from_toml(text: &str) -> Result<Self> {
        let file: TableFile = toml::from_str(text).context("Invalid pipeline table")?;
        Ok(Self::new(file.profile)?)
    }

    /// Load a TOML table from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let table =
            Self::from_toml(&text).with_context(|| format!("In {}", path.display()))?;
        info!(
            "Loaded {} pipeline profile(s) from {}",
            table.profiles.len(),
            path.display()
        );
        Ok(table)
    }

    /// The table configured by `PIPELINES_FILE`, or the built-in one.
    pub fn from_config(config: &Config) -> Result<Self> {
        match &config.pipelines_file {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn profile(&self, payload_type: u8) -> Option<&PipelineProfile> {
        self.by_payload_type
            .get(&payload_type)
            .map(|&idx| &self.profiles[idx])
    }

    pub fn supported(&self) -> impl Iterator<Item = u8> + '_ {
        self.by_payload_type.keys().copied()
    }
}

impl Default for PipelineTable {
    fn default() -> Self {
        let profiles = vec![
            PipelineProfile {
                name: "mpeg-ps".into(),
                payload_types: vec![96],
                encoding_name: "MP2P".into(),
                depayloader: "rtpmp2pdepay".into(),
                demuxer: "mpegpsdemux".into(),
                parser: "mpegvideoparse".into(),
                decoder: "avdec_mpeg2video".into(),
                latency_ms: None,
                drop_on_latency: true,
                jpeg_quality: default_jpeg_quality(),
                queue_max_buffers: default_queue_max_buffers(),
                sync: false,
            },
            PipelineProfile {
                name: "mpeg-ts".into(),
                payload_types: vec![33, 103],
                encoding_name: "MP2T".into(),
                depayloader: "rtpmp2tdepay2".into(),
                demuxer: "tsdemux".into(),
                parser: "h264parse".into(),
                decoder: "avdec_h264".into(),
                latency_ms: None,
                drop_on_latency: false,
                jpeg_quality: default_jpeg_quality(),
                queue_max_buffers: default_queue_max_buffers(),
                sync: false,
            },
        ];
        // Static data; the invariants hold by construction.
        match Self::new(profiles) {
            Ok(table) => table,
            Err(e) => unreachable!("built-in pipeline table is invalid: {e}"),
        }
    }
}

// ── builder ──────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("unsupported payload type: {0}")]
    UnsupportedPayloadType(u8),
}

/// Executable plus arguments for one external pipeline process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    tokens: Vec<String>,
}

impl PipelineSpec {
    /// `tokens[0]` is the program, the rest are its arguments.
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    pub fn program(&self) -> &str {
        self.tokens.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.tokens.get(1..).unwrap_or_default()
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Space-joined form for the operational log.
    pub fn command_line(&self) -> String {
        self.tokens.join(" ")
    }
}

/// Turns payload types into [`PipelineSpec`]s. Pure: holds only
/// configuration.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    gst_bin: String,
    multicast_interface: String,
    auto_multicast: bool,
    jitter_buffer_latency: u32,
    table: PipelineTable,
    boundary: Boundary,
}

impl PipelineBuilder {
    pub fn new(config: &Config, table: PipelineTable, boundary: Boundary) -> Self {
        Self {
            gst_bin: config.gst_bin.to_string_lossy().into_owned(),
            multicast_interface: config.multicast_interface.to_string(),
            auto_multicast: config.auto_multicast,
            jitter_buffer_latency: config.jitter_buffer_latency,
            table,
            boundary,
        }
    }

    pub fn boundary(&self) -> &Boundary {
        &self.boundary
    }

    pub fn table(&self) -> &PipelineTable {
        &self.table
    }

    pub fn build(
        &self,
        payload_type: u8,
        endpoint: &StreamEndpoint,
    ) -> Result<PipelineSpec, PipelineError> {
        let profile = self
            .table
            .profile(payload_type)
            .ok_or(PipelineError::UnsupportedPayloadType(payload_type))?;

        let latency = profile.latency_ms.unwrap_or(self.jitter_buffer_latency);
        let mut tokens: Vec<String> = Vec::with_capacity(48);
        let mut push = |items: &[String]| tokens.extend_from_slice(items);

        push(&[
            self.gst_bin.clone(),
            "-q".into(),
            "udpsrc".into(),
            format!("address={}", endpoint.address()),
            format!("port={}", endpoint.port()),
            format!("multicast-iface={}", self.multicast_interface),
            format!("auto-multicast={}", self.auto_multicast),
            "!".into(),
            "capsfilter".into(),
            format!(
                "caps=application/x-rtp,media=video,encoding-name={},payload={payload_type},clock-rate=90000",
                profile.encoding_name
            ),
            "!".into(),
            "rtpjitterbuffer".into(),
            format!("latency={latency}"),
        ]);
        if profile.drop_on_latency {
            push(&["drop-on-latency=true".into()]);
        }
        push(&[
            "!".into(),
            profile.depayloader.clone(),
            "!".into(),
            profile.demuxer.clone(),
            "!".into(),
            profile.parser.clone(),
            "!".into(),
            profile.decoder.clone(),
            "!".into(),
            "videoconvert".into(),
            "!".into(),
            "jpegenc".into(),
            format!("quality={}", profile.jpeg_quality),
            "!".into(),
            "queue".into(),
            format!("max-size-buffers={}", profile.queue_max_buffers),
            "leaky=downstream".into(),
            "!".into(),
            "multipartmux".into(),
            format!("boundary={}", self.boundary),
            "!".into(),
            "fdsink".into(),
            "fd=1".into(),
            format!("sync={}", profile.sync),
        ]);

        Ok(PipelineSpec::new(tokens))
    }
}
