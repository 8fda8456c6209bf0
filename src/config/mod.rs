pub mod types;

use std::path::Path;

use tracing::{info, warn};

pub use types::Config;

/// Load the configuration document, falling back to defaults when the file
/// is missing or malformed. Never fails: invalid values are replaced during
/// sanitize and logged.
pub fn load_config(path: &str) -> Config {
    let mut config = match std::fs::read_to_string(Path::new(path)) {
        Ok(content) => match serde_yml::from_str::<Config>(&content) {
            Ok(config) => {
                info!(path, "config loaded");
                config
            }
            Err(e) => {
                warn!(path, error = %e, "config file malformed, using defaults");
                Config::default()
            }
        },
        Err(_) => {
            warn!(path, "config file not found, using defaults");
            Config::default()
        }
    };

    config.sanitize();
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config("/nonexistent/subprobe.yaml");
        assert_eq!(config.network.user_bandwidth, 100);
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, ":: not yaml ::[").unwrap();
        let config = load_config(path.to_str().unwrap());
        assert_eq!(config.test.max_nodes, 50);
    }

    #[test]
    fn file_overrides_are_applied_and_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "network:\n  user_bandwidth: 50\nproxy:\n  port_range:\n    start: 10\n    end: 5\n",
        )
        .unwrap();
        let config = load_config(path.to_str().unwrap());
        assert_eq!(config.network.user_bandwidth, 50);
        // invalid range reverted
        assert_eq!(config.proxy.port_range.start, 10800);
    }
}
