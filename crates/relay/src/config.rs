use std::path::Path;

use anyhow::{Context, Result};
use relay_protocol::RelayConfig;
use tracing::Level;

pub(crate) const DEFAULT_CONFIG_PATH: &str = "config/relay.toml";

/// A log line `load_config` wants emitted once the global subscriber exists.
/// `load_config` runs before `logging::init` (it determines `log_level` and
/// `log_file`), so it cannot log directly — anything it emitted would be
/// dropped for lack of a subscriber. It hands these back instead, and the
/// caller emits them right after `logging::init`.
pub(crate) struct ConfigLoadNote {
    pub(crate) level: Level,
    pub(crate) message: String,
}

/// Load configuration from a TOML file at the given path.
/// If the file doesn't exist, returns default configuration.
pub(crate) fn load_config(path: &Path) -> Result<(RelayConfig, Vec<ConfigLoadNote>)> {
    if !path.exists() {
        let note = ConfigLoadNote {
            level: Level::WARN,
            message: format!("Config file not found at {}, using defaults", path.display()),
        };
        return Ok((RelayConfig::default(), vec![note]));
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: RelayConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    let note = ConfigLoadNote {
        level: Level::INFO,
        message: format!("Loaded config from {}", path.display()),
    };
    Ok((config, vec![note]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_returns_defaults() {
        let (config, notes) = load_config(Path::new("/nonexistent/relay.toml")).unwrap();
        assert_eq!(config.source_port, 9002);
        assert_eq!(config.sink_port, 9003);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].level, Level::WARN);
    }
}
