use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything needed to request raw bytes of a file from the platform.
/// Immutable for a given message id; access hashes are identity-scoped, so
/// locators are cached per identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLocator {
    pub message_id: i64,
    pub dc_id: i32,
    pub volume_id: i64,
    pub local_id: i32,
    pub access_hash: i64,
    pub size: u64,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    /// Timestamp of the platform message carrying the file; drives the
    /// link-expiry gate.
    pub message_date: DateTime<Utc>,
}

impl FileLocator {
    pub fn content_type(&self) -> &str {
        self.mime_type
            .as_deref()
            .unwrap_or("application/octet-stream")
    }
}

/// Profile of a bot identity as reported by the platform, exposed through
/// the info endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotProfile {
    pub id: i64,
    pub username: String,
    pub first_name: String,
}

impl BotProfile {
    pub fn mention(&self) -> String {
        format!("@{}", self.username)
    }
}

/// Public URLs built for a freshly uploaded file. Shortening, when the size
/// threshold applies, is the caller's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicUrls {
    pub download_url: String,
    pub stream_url: Option<String>,
    pub player_url: Option<String>,
}

/// Current-month ledger reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthUsage {
    pub month: String,
    pub bytes_used: u64,
}

/// Snapshot of one identity for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityStatus {
    pub id: String,
    pub ready: bool,
    pub active_streams: u32,
}

/// Video MIME types the player front-end can handle.
pub const VIDEO_MIME_TYPES: &[&str] = &[
    "video/mp4",
    "video/webm",
    "video/ogg",
    "video/quicktime",
    "video/x-msvideo",
    "video/x-matroska",
    "video/avi",
    "video/mkv",
];

pub fn is_video_file(mime_type: &str) -> bool {
    let mime = mime_type.to_ascii_lowercase();
    VIDEO_MIME_TYPES.contains(&mime.as_str())
}

/// Convert bytes to a human-readable size for log lines.
pub fn humanbytes(size: u64) -> String {
    if size == 0 {
        return "0 B".to_string();
    }
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", size)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Strip path separators and control characters from a user-visible file
/// name, capping length. Falls back to "download".
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(['.', ' ']).to_string();
    let capped: String = trimmed.chars().take(255).collect();
    if capped.is_empty() {
        "download".to_string()
    } else {
        capped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_detection_covers_the_player_set() {
        assert!(is_video_file("video/mp4"));
        assert!(is_video_file("VIDEO/MP4"));
        assert!(is_video_file("video/x-matroska"));
        assert!(!is_video_file("application/pdf"));
        assert!(!is_video_file(""));
    }

    #[test]
    fn humanbytes_formats() {
        assert_eq!(humanbytes(0), "0 B");
        assert_eq!(humanbytes(512), "512 B");
        assert_eq!(humanbytes(1536), "1.50 KB");
        assert_eq!(humanbytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn sanitize_strips_separators_and_controls() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("a\x00b.mp4"), "a_b.mp4");
        assert_eq!(sanitize_filename("  . "), "download");
        assert_eq!(sanitize_filename("movie.mkv"), "movie.mkv");
    }
}
