//! JSON-line events on stdout.
//!
//! stdout is the machine interface: one JSON object per line, in pipeline
//! order. Human-oriented diagnostics go to stderr via `tracing` instead.

use serde::Serialize;
use std::path::Path;

/// Progress events emitted before and after the poll loop. Poll status
/// records are not wrapped in this type; they are re-emitted as received.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Event {
    Info {
        message: String,
        artist: Option<String>,
        title: Option<String>,
    },
    Pending {
        message: String,
        handoff_id: String,
    },
    Downloading {
        message: String,
        path: String,
    },
}

impl Event {
    pub fn track_info(artist: Option<&str>, title: Option<&str>) -> Self {
        Event::Info {
            message: "Track information retrieved".to_string(),
            artist: artist.map(str::to_string),
            title: title.map(str::to_string),
        }
    }

    pub fn download_initiated(handoff_id: &str) -> Self {
        Event::Pending {
            message: "Download initiated".to_string(),
            handoff_id: handoff_id.to_string(),
        }
    }

    pub fn downloading(file_name: &str, path: &Path) -> Self {
        Event::Downloading {
            message: format!("Downloading file: {file_name}"),
            path: path.display().to_string(),
        }
    }
}

/// Prints one value as a single JSON line on stdout.
pub fn emit<T: Serialize>(event: &T) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(err) => tracing::warn!(%err, "failed to encode event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn as_value(event: &Event) -> Value {
        serde_json::to_value(event).unwrap()
    }

    #[test]
    fn info_event_keeps_missing_metadata_as_null() {
        let value = as_value(&Event::track_info(None, None));
        assert_eq!(value["status"], "info");
        assert_eq!(value["message"], "Track information retrieved");
        assert!(value["artist"].is_null());
        assert!(value["title"].is_null());
    }

    #[test]
    fn pending_event_carries_the_handoff_id() {
        let value = as_value(&Event::download_initiated("abc123"));
        assert_eq!(value["status"], "pending");
        assert_eq!(value["handoff_id"], "abc123");
    }

    #[test]
    fn downloading_event_names_file_and_path() {
        let value = as_value(&Event::downloading(
            "A - B.flac",
            Path::new("/music/A - B.flac"),
        ));
        assert_eq!(value["status"], "downloading");
        assert_eq!(value["message"], "Downloading file: A - B.flac");
        assert_eq!(value["path"], "/music/A - B.flac");
    }
}
