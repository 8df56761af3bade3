use anyhow::Context;

/// Command-line overrides for `RelayConfig`. Every field is optional: the
/// relay must run with zero flags, picking up its defaults (and whatever a
/// config file supplies), so every flag here only ever narrows a default.
#[derive(Debug, Default)]
pub(crate) struct Args {
    pub config_path: Option<String>,
    pub source_port: Option<u16>,
    pub sink_port: Option<u16>,
    pub turn_host: Option<String>,
    pub turn_port: Option<u16>,
    pub turn_username: Option<String>,
    pub turn_password: Option<String>,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut out = Args::default();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("screenshare-relay {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("screenshare-relay - WebRTC screen-sharing relay");
                println!();
                println!("USAGE:");
                println!("    screenshare-relay [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --config <PATH>           Config file [default: ./config/relay.toml]");
                println!("    --source-port <PORT>      Source signaling port [default: 9002]");
                println!("    --sink-port <PORT>        Sink signaling port [default: 9003]");
                println!("    --turn-host <HOST>        TURN server host");
                println!("    --turn-port <PORT>        TURN server port");
                println!("    --turn-username <NAME>    TURN username");
                println!("    --turn-password <PASS>    TURN password");
                println!("    -V, --version             Print version and exit");
                println!("    -h, --help                Print this help and exit");
                std::process::exit(0);
            }
            "--config" => {
                i += 1;
                out.config_path = Some(args.get(i).context("Missing --config value")?.clone());
            }
            "--source-port" => {
                i += 1;
                out.source_port = Some(
                    args.get(i)
                        .context("Missing --source-port value")?
                        .parse()
                        .context("Invalid --source-port value")?,
                );
            }
            "--sink-port" => {
                i += 1;
                out.sink_port = Some(
                    args.get(i)
                        .context("Missing --sink-port value")?
                        .parse()
                        .context("Invalid --sink-port value")?,
                );
            }
            "--turn-host" => {
                i += 1;
                out.turn_host = Some(args.get(i).context("Missing --turn-host value")?.clone());
            }
            "--turn-port" => {
                i += 1;
                out.turn_port = Some(
                    args.get(i)
                        .context("Missing --turn-port value")?
                        .parse()
                        .context("Invalid --turn-port value")?,
                );
            }
            "--turn-username" => {
                i += 1;
                out.turn_username =
                    Some(args.get(i).context("Missing --turn-username value")?.clone());
            }
            "--turn-password" => {
                i += 1;
                out.turn_password =
                    Some(args.get(i).context("Missing --turn-password value")?.clone());
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(out)
}

/// Layer CLI overrides on top of a loaded config.
pub(crate) fn apply(args: &Args, config: &mut relay_protocol::RelayConfig) {
    if let Some(p) = args.source_port {
        config.source_port = p;
    }
    if let Some(p) = args.sink_port {
        config.sink_port = p;
    }
    if let Some(h) = &args.turn_host {
        config.ice.turn_host = h.clone();
    }
    if let Some(p) = args.turn_port {
        config.ice.turn_port = p;
    }
    if let Some(u) = &args.turn_username {
        config.ice.turn_username = Some(u.clone());
    }
    if let Some(p) = &args.turn_password {
        config.ice.turn_password = Some(p.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::RelayConfig;

    #[test]
    fn apply_overrides_only_set_fields() {
        let mut config = RelayConfig::default();
        let args = Args {
            source_port: Some(19002),
            ..Args::default()
        };
        apply(&args, &mut config);
        assert_eq!(config.source_port, 19002);
        assert_eq!(config.sink_port, 9003);
    }

    #[test]
    fn apply_overrides_turn_credentials() {
        let mut config = RelayConfig::default();
        let args = Args {
            turn_host: Some("turn.example.com".to_string()),
            turn_username: Some("user".to_string()),
            turn_password: Some("pass".to_string()),
            ..Args::default()
        };
        apply(&args, &mut config);
        assert_eq!(config.ice.turn_host, "turn.example.com");
        assert_eq!(config.ice.turn_username.as_deref(), Some("user"));
        assert_eq!(config.ice.turn_password.as_deref(), Some("pass"));
    }
}
