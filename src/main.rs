use anyhow::{Context, Result};
use clap::{App, Arg, ArgMatches};
use tracing::info;

use natstun::error::ConfigError;
use natstun::{logging, Role, ServerConfig, StunServer};

fn main() -> Result<()> {
    let matches = App::new("natstun-server")
        .about("STUN server for NAT type discovery over two IPs and two ports")
        .arg(
            Arg::with_name("CONFIG")
                .short("f")
                .long("config")
                .takes_value(true)
                .help("JSON config file; flags override its values"),
        )
        .arg(
            Arg::with_name("PRIMARY")
                .short("p")
                .long("primary")
                .takes_value(true)
                .help("primary host[:port]"),
        )
        .arg(
            Arg::with_name("SECONDARY")
                .short("s")
                .long("secondary")
                .takes_value(true)
                .help("secondary host[:port]"),
        )
        .arg(
            Arg::with_name("ROLE")
                .short("r")
                .long("role")
                .takes_value(true)
                .possible_values(&["both", "primary", "pri", "secondary", "sec"])
                .help("which IP this process serves"),
        )
        .arg(
            Arg::with_name("RELAY")
                .long("relay")
                .visible_alias("p2s")
                .takes_value(true)
                .help("primary: secondary's relay listener; secondary: listen address"),
        )
        .arg(
            Arg::with_name("WORKERS")
                .short("w")
                .long("workers")
                .takes_value(true)
                .help("receive sockets per endpoint, 0 for one per CPU"),
        )
        .arg(
            Arg::with_name("SOFTWARE")
                .long("software")
                .takes_value(true)
                .help("SOFTWARE attribute sent in replies"),
        )
        .arg(
            Arg::with_name("DEBUG")
                .short("d")
                .long("debug")
                .multiple(true)
                .help("more logging, repeat for trace"),
        )
        .get_matches();

    let config = load_config(&matches)?;
    logging::init(config.log_level());

    let server = StunServer::new(config).context("invalid server configuration")?;
    let handle = server.start().context("cannot start STUN server")?;
    info!(
        role = %handle.role(),
        endpoints = ?handle.endpoints(),
        relay = ?handle.relay_addr(),
        "natstun server running"
    );
    handle.wait();
    Ok(())
}

fn load_config(matches: &ArgMatches) -> Result<ServerConfig> {
    let mut config = match matches.value_of("CONFIG") {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(p) = matches.value_of("PRIMARY") {
        config.primary_addr = p.to_string();
    }
    if let Some(s) = matches.value_of("SECONDARY") {
        config.secondary_addr = s.to_string();
    }
    if let Some(r) = matches.value_of("ROLE") {
        config.role = r.parse::<Role>()?;
    }
    if let Some(relay) = matches.value_of("RELAY") {
        config.relay_addr = Some(relay.to_string());
    }
    if let Some(w) = matches.value_of("WORKERS") {
        config.workers = w.parse().map_err(|_| ConfigError::InvalidValue {
            field: "workers",
            value: w.to_string(),
        })?;
    }
    if let Some(sw) = matches.value_of("SOFTWARE") {
        config.software = Some(sw.to_string());
    }
    let verbosity = matches.occurrences_of("DEBUG");
    if verbosity > 0 {
        config.debug_level = verbosity.min(2) as u8;
    }
    Ok(config)
}
