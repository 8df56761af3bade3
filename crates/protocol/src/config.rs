use serde::{Deserialize, Serialize};

/// Top-level relay configuration: signaling ports, TURN credentials, and
/// logging. Every field has a default, so an absent or partial TOML file is
/// never a startup error — only `validate()` can reject a loaded config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_source_port")]
    pub source_port: u16,
    #[serde(default = "default_sink_port")]
    pub sink_port: u16,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Path to append a plain-text log to, in addition to stderr. `None`
    /// disables the file appender.
    #[serde(default)]
    pub log_file: Option<String>,
}

/// TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_turn_host")]
    pub turn_host: String,
    #[serde(default = "default_turn_port")]
    pub turn_port: u16,
    #[serde(default)]
    pub turn_username: Option<String>,
    #[serde(default)]
    pub turn_password: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            source_port: default_source_port(),
            sink_port: default_sink_port(),
            ice: IceConfig::default(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            turn_host: default_turn_host(),
            turn_port: default_turn_port(),
            turn_username: None,
            turn_password: None,
        }
    }
}

impl RelayConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, relay should not start) or
    /// "WARNING:" (advisory, relay can start but the config is likely
    /// wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.source_port == 0 {
            issues.push("ERROR: source_port must be between 1 and 65535, got 0.".to_string());
        }
        if self.sink_port == 0 {
            issues.push("ERROR: sink_port must be between 1 and 65535, got 0.".to_string());
        }
        if self.source_port == self.sink_port {
            issues.push(format!(
                "ERROR: source_port and sink_port must differ, both are {}.",
                self.source_port
            ));
        }

        match (&self.ice.turn_username, &self.ice.turn_password) {
            (Some(_), None) => issues.push(
                "WARNING: turn_username is set but turn_password is not; \
                 the TURN server will likely reject every allocation request."
                    .to_string(),
            ),
            (None, Some(_)) => issues.push(
                "WARNING: turn_password is set but turn_username is not; \
                 the TURN server will likely reject every allocation request."
                    .to_string(),
            ),
            _ => {}
        }

        match self.log_level.to_ascii_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => issues.push(format!(
                "WARNING: log_level '{other}' is not one of error/warn/info/debug/trace; \
                 tracing-subscriber will fall back to its default filter."
            )),
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_source_port() -> u16 {
    9002
}
fn default_sink_port() -> u16 {
    9003
}
fn default_turn_host() -> String {
    "127.0.0.1".to_string()
}
fn default_turn_port() -> u16 {
    3478
}
fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: RelayConfig =
            toml::from_str("").expect("empty string should deserialize to default config");
        assert_eq!(config.source_port, 9002);
        assert_eq!(config.sink_port, 9003);
        assert_eq!(config.ice.turn_host, "127.0.0.1");
        assert_eq!(config.ice.turn_port, 3478);
        assert!(config.ice.turn_username.is_none());
        assert!(config.ice.turn_password.is_none());
        assert_eq!(config.log_level, "info");
        assert!(config.log_file.is_none());
    }

    #[test]
    fn partial_config_only_ice_section() {
        let toml_str = r#"
[ice]
turn_host = "turn.example.com"
turn_username = "user"
turn_password = "pass"
"#;
        let config: RelayConfig =
            toml::from_str(toml_str).expect("partial config should deserialize");
        assert_eq!(config.ice.turn_host, "turn.example.com");
        assert_eq!(config.ice.turn_username.as_deref(), Some("user"));
        assert_eq!(config.source_port, 9002);
        assert_eq!(config.sink_port, 9003);
    }

    #[test]
    fn default_trait_matches_toml_defaults() {
        let from_toml: RelayConfig = toml::from_str("").unwrap();
        let defaulted = RelayConfig::default();
        assert_eq!(defaulted.source_port, from_toml.source_port);
        assert_eq!(defaulted.sink_port, from_toml.sink_port);
        assert_eq!(defaulted.ice.turn_host, from_toml.ice.turn_host);
        assert_eq!(defaulted.log_level, from_toml.log_level);
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_same_port_is_error() {
        let mut config = RelayConfig::default();
        config.sink_port = config.source_port;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("differ")));
    }

    #[test]
    fn validate_zero_port_is_error() {
        let mut config = RelayConfig::default();
        config.source_port = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("source_port")));
    }

    #[test]
    fn validate_turn_username_without_password_warns() {
        let mut config = RelayConfig::default();
        config.ice.turn_username = Some("user".to_string());
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("WARNING:")));
    }

    #[test]
    fn validate_unknown_log_level_warns() {
        let mut config = RelayConfig::default();
        config.log_level = "verbose".to_string();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("log_level")));
    }
}
