//! Command-line surface and service bootstrap

use std::{io, process::ExitCode, sync::Arc, time::Duration};

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, info};

use shadowtun::{CipherKind, ServerConfig};
use shadowtun_service::{
    config::{parse_pair_list, LocalConfig, DEFAULT_UDP_TIMEOUT},
    local, server,
};

/// Defines the whole command line of `sstun`
pub fn define_command_line_options(app: Command) -> Command {
    app.arg(
        Arg::new("LIST_CIPHERS")
            .long("list-ciphers")
            .action(ArgAction::SetTrue)
            .help("List supported ciphers and exit"),
    )
    .arg(
        Arg::new("SERVER_URL")
            .short('s')
            .long("server")
            .num_args(1)
            .action(ArgAction::Append)
            .help("Server listen URL (ss://method:password@host:port), repeatable"),
    )
    .arg(
        Arg::new("CLIENT_URL")
            .short('c')
            .long("client")
            .num_args(1)
            .action(ArgAction::Append)
            .help("Client connect URL (ss://method:password@host:port), repeatable"),
    )
    .arg(
        Arg::new("SOCKS")
            .long("socks")
            .num_args(1)
            .action(ArgAction::Set)
            .help("(client-only) SOCKS5 listen address"),
    )
    .arg(
        Arg::new("TCP_TUN")
            .long("tcptun")
            .num_args(1)
            .action(ArgAction::Set)
            .help("(client-only) TCP tunnel list (laddr1=raddr1,laddr2=raddr2,...)"),
    )
    .arg(
        Arg::new("UDP_TUN")
            .long("udptun")
            .num_args(1)
            .action(ArgAction::Set)
            .help("(client-only) UDP tunnel list (laddr1=raddr1,laddr2=raddr2,...)"),
    )
    .arg(
        Arg::new("REDIR")
            .long("redir")
            .num_args(1)
            .action(ArgAction::Set)
            .help("(client-only) redirect TCP from this address (Linux only)"),
    )
    .arg(
        Arg::new("REDIR6")
            .long("redir6")
            .num_args(1)
            .action(ArgAction::Set)
            .help("(client-only) redirect TCP IPv6 from this address (Linux only)"),
    )
    .arg(
        Arg::new("UDP_TIMEOUT")
            .long("udp-timeout")
            .num_args(1)
            .action(ArgAction::Set)
            .value_parser(clap::value_parser!(u64))
            .help("UDP NAT session timeout seconds"),
    )
    .arg(
        Arg::new("VERBOSE")
            .short('v')
            .long("verbose")
            .action(ArgAction::SetTrue)
            .help("Verbose logging"),
    )
}

/// Program entry
pub fn main(matches: &ArgMatches) -> ExitCode {
    let mut builder = env_logger::Builder::from_default_env();
    if matches.get_flag("VERBOSE") {
        builder.filter_level(log::LevelFilter::Debug);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }
    builder.init();

    if matches.get_flag("LIST_CIPHERS") {
        println!("{}", CipherKind::supported().join(" "));
        return ExitCode::SUCCESS;
    }

    match build_and_run(matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn build_and_run(matches: &ArgMatches) -> io::Result<()> {
    let udp_timeout = matches
        .get_one::<u64>("UDP_TIMEOUT")
        .map(|secs| Duration::from_secs(*secs))
        .unwrap_or(DEFAULT_UDP_TIMEOUT);

    let client_urls: Vec<&String> = matches
        .get_many::<String>("CLIENT_URL")
        .map(|v| v.collect())
        .unwrap_or_default();
    let server_urls: Vec<&String> = matches
        .get_many::<String>("SERVER_URL")
        .map(|v| v.collect())
        .unwrap_or_default();

    if client_urls.is_empty() && server_urls.is_empty() {
        return Err(config_err("either --server or --client must be given, see --help"));
    }

    let mut local_task = None;
    if !client_urls.is_empty() {
        // multi-server racing stays an external concern; the first URL is
        // the dialer for everything
        let svr_cfg = parse_server_url(client_urls[0])?;

        let mut config = LocalConfig {
            socks: parse_opt_addr(matches, "SOCKS")?,
            redir: parse_opt_addr(matches, "REDIR")?,
            redir6: parse_opt_addr(matches, "REDIR6")?,
            ..LocalConfig::default()
        };

        if let Some(pairs) = matches.get_one::<String>("TCP_TUN") {
            config.tcp_tunnels = parse_pair_list(pairs).map_err(|err| config_err(&err.to_string()))?;
        }
        if let Some(pairs) = matches.get_one::<String>("UDP_TUN") {
            config.udp_tunnels = parse_pair_list(pairs).map_err(|err| config_err(&err.to_string()))?;
        }

        if config.is_empty() {
            return Err(config_err(
                "client mode needs at least one of --socks/--tcptun/--udptun/--redir/--redir6",
            ));
        }

        local_task = Some((config, Arc::new(svr_cfg)));
    }

    let mut servers = Vec::new();
    for url in &server_urls {
        servers.push(parse_server_url(url)?);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    runtime.block_on(async move {
        let mut services = Vec::new();

        if let Some((config, svr_cfg)) = local_task {
            services.push(tokio::spawn(local::run(config, svr_cfg, udp_timeout)));
        }

        if !servers.is_empty() {
            services.push(tokio::spawn(server::run(servers, udp_timeout)));
        }

        tokio::select! {
            res = wait_services(services) => res,
            res = wait_signal() => {
                res?;
                info!("shutting down");
                Ok(())
            }
        }
    })
}

/// Resolve when the first service task completes (always a failure)
async fn wait_services(services: Vec<tokio::task::JoinHandle<io::Result<()>>>) -> io::Result<()> {
    let (res, ..) = futures::future::select_all(services).await;
    match res {
        Ok(res) => res,
        Err(join_err) => Err(io::Error::new(io::ErrorKind::Other, join_err)),
    }
}

async fn wait_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = sigterm.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

fn parse_server_url(url: &str) -> io::Result<ServerConfig> {
    ServerConfig::from_url(url).map_err(|err| config_err(&format!("invalid server URL {url:?}: {err}")))
}

fn parse_opt_addr(matches: &ArgMatches, key: &str) -> io::Result<Option<shadowtun::ServerAddr>> {
    match matches.get_one::<String>(key) {
        None => Ok(None),
        Some(s) => match s.parse() {
            Ok(addr) => Ok(Some(addr)),
            Err(..) => Err(config_err(&format!("invalid listen address {s:?}"))),
        },
    }
}

fn config_err(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}
