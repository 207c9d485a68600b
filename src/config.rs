//! Process configuration.
//!
//! Everything is read from the environment once at startup, with compiled-in
//! defaults for every knob. A `.env` file is honored via dotenvy before this
//! runs (see main).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration for the pad server.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port for the HTTP/WebSocket listener.
    pub port: u16,
    /// Path of the persisted document file.
    pub doc_path: PathBuf,
    /// Period of the background save tick.
    pub save_interval: Duration,
    /// Hard cap on document size, in bytes.
    pub max_doc_bytes: usize,
    /// Hard cap on a decoded inbound image payload, in bytes.
    pub max_image_bytes: usize,
    /// Bounding box edge for image rescale, in pixels.
    pub image_max_dimension: u32,
    /// JPEG re-encode quality (1-100).
    pub image_jpeg_quality: u8,
    /// Caret display timeout relayed to the client shell; not enforced here.
    pub cursor_timeout: Duration,
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", 3000),
            doc_path: env::var("DOC_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/document.html")),
            save_interval: Duration::from_millis(env_parse("SAVE_INTERVAL", 15_000u64)),
            max_doc_bytes: env_parse("MAX_DOC_MB", 50usize) * 1024 * 1024,
            max_image_bytes: env_parse("MAX_IMAGE_KB", 250usize) * 1024,
            image_max_dimension: env_parse("IMAGE_MAX_DIMENSION", 400),
            image_jpeg_quality: env_parse("IMAGE_JPEG_QUALITY", 40u8).clamp(1, 100),
            cursor_timeout: Duration::from_millis(env_parse("CURSOR_TIMEOUT", 30_000u64)),
        }
    }
}

/// Parse an environment variable, falling back to `default` when the variable
/// is absent or unparseable.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
