// Log Configuration
//
// Where the file-backed log lives and how hard it tries to be durable.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Log configuration loaded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub path: PathBuf,

    /// fsync after every append.
    #[serde(default = "default_sync_on_write")]
    pub sync_on_write: bool,
}

fn default_sync_on_write() -> bool {
    true
}

impl LogConfig {
    /// Built-in configuration (used if no config is provided).
    pub fn default_config() -> Self {
        Self {
            path: PathBuf::from("./data/seqfold.jsonl"),
            sync_on_write: default_sync_on_write(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_json() {
        let config: LogConfig = serde_json::from_str(r#"{ "path": "/tmp/x.jsonl" }"#).unwrap();
        assert_eq!(config.path, PathBuf::from("/tmp/x.jsonl"));
        assert!(config.sync_on_write);

        let config: LogConfig =
            serde_json::from_str(r#"{ "path": "a.jsonl", "sync_on_write": false }"#).unwrap();
        assert!(!config.sync_on_write);
    }
}
