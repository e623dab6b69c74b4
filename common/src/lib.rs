//! Building blocks shared by the MJPEG gateway: configuration, stream
//! endpoints, payload-type detection and caching, and pipeline construction.

pub mod cache;
pub mod config;
pub mod detector;
pub mod endpoint;
pub mod pipeline;
pub mod protocol;
