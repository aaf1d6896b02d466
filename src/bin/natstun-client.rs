use std::time::Duration;

use anyhow::{Context, Result};
use clap::{App, Arg, ArgMatches};

use natstun::error::ConfigError;
use natstun::{discover, logging, CancelToken, ClientConfig};

fn main() -> Result<()> {
    let matches = App::new("natstun-client")
        .about("Discovers the NAT type in front of this host")
        .arg(
            Arg::with_name("HOST")
                .short("H")
                .long("host")
                .takes_value(true)
                .default_value("stun.sipgate.net")
                .help("STUN server host"),
        )
        .arg(
            Arg::with_name("PORT")
                .short("P")
                .long("port")
                .takes_value(true)
                .default_value("3478")
                .help("STUN server port"),
        )
        .arg(
            Arg::with_name("ALTERNATE")
                .short("a")
                .long("alternate")
                .takes_value(true)
                .help("server's other IP as host[:port], enables the address mapping test"),
        )
        .arg(
            Arg::with_name("LOCAL")
                .short("i")
                .long("local")
                .takes_value(true)
                .help("local ip or ip:port to probe from"),
        )
        .arg(
            Arg::with_name("TIMEOUT")
                .long("timeout")
                .takes_value(true)
                .help("per-attempt wait in milliseconds"),
        )
        .arg(
            Arg::with_name("RETRIES")
                .long("retries")
                .takes_value(true)
                .help("retransmissions per probe"),
        )
        .arg(
            Arg::with_name("DEADLINE")
                .long("deadline")
                .takes_value(true)
                .help("give up on the whole discovery after this many seconds"),
        )
        .arg(Arg::with_name("JSON").long("json").help("print the full result as JSON"))
        .arg(Arg::with_name("VERBOSE").short("v").long("verbose").help("debug logging"))
        .get_matches();

    let config = client_config(&matches)?;
    logging::init(if config.verbose { "debug" } else { "warn" });

    let result = discover(&config, CancelToken::new())
        .with_context(|| format!("discovery against {} failed", config.server))?;

    if matches.is_present("JSON") {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    println!("NAT Type: {}", result.nat_type);
    println!("External IP: {}", result.external_ip());
    println!("External Port: {}", result.external_port());
    if let (Some(mapping), Some(filtering)) = (result.mapping, result.filtering) {
        println!("Mapping: {mapping:?}");
        println!("Filtering: {filtering:?}");
    }
    Ok(())
}

fn number<T: std::str::FromStr>(
    matches: &ArgMatches,
    name: &str,
    field: &'static str,
) -> Result<Option<T>, ConfigError> {
    matches
        .value_of(name)
        .map(|v| {
            v.parse().map_err(|_| ConfigError::InvalidValue {
                field,
                value: v.to_string(),
            })
        })
        .transpose()
}

fn client_config(matches: &ArgMatches) -> Result<ClientConfig> {
    let mut config = ClientConfig::default();
    let host = matches.value_of("HOST").unwrap_or("stun.sipgate.net");
    let port = matches.value_of("PORT").unwrap_or("3478");
    config.server = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    config.alternate = matches.value_of("ALTERNATE").map(str::to_string);
    if let Some(local) = matches.value_of("LOCAL") {
        config.local = local.to_string();
    }
    if let Some(ms) = number::<u64>(matches, "TIMEOUT", "timeout")? {
        config.timeout = Duration::from_millis(ms);
    }
    if let Some(n) = number::<u32>(matches, "RETRIES", "retries")? {
        config.retries = n;
    }
    config.deadline = number::<u64>(matches, "DEADLINE", "deadline")?.map(Duration::from_secs);
    config.verbose = matches.is_present("VERBOSE");
    Ok(config)
}
