use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, Command};
use metrics_exporter_prometheus::PrometheusBuilder;
use soundmesh_files::ContentHash;
use soundmesh_node::{telemetry, Node};
use soundmesh_p2p::{Endpoint, MeshClient};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

mod app_config;
mod instance;
mod version;

use app_config::{dialable_local, AppConfig};
use instance::{running_instance, Instance};
use version::{git_commit_hash, MESH_PROTOCOL_VERSION, SOUNDMESH_VERSION};

/// Crates whose events follow `--log-level`; everything else logs at warn.
const LOG_TARGETS: &[&str] = &["soundmesh_node", "soundmesh_p2p", "soundmesh_files"];

fn cli() -> Command {
    let peer_arg = || {
        Arg::new("peer")
            .long("peer")
            .value_name("HOST:PORT")
            .help("Node to query (defaults to the node running on --data-dir)")
    };

    Command::new("soundmesh-node")
        .version(SOUNDMESH_VERSION)
        .about("Peer-to-peer audio content mesh node")
        .disable_version_flag(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory")
                .global(true),
        )
        .arg(
            Arg::new("in-memory")
                .long("in-memory")
                .action(ArgAction::SetTrue)
                .help("Keep content in memory instead of the data directory")
                .global(true),
        )
        .arg(
            Arg::new("bind")
                .long("bind")
                .value_name("ADDR")
                .help("Mesh listener address, e.g. 0.0.0.0:7400")
                .global(true),
        )
        .arg(
            Arg::new("advertise-host")
                .long("advertise-host")
                .value_name("HOST")
                .help("Host other peers should dial")
                .global(true),
        )
        .arg(
            Arg::new("bootstrap")
                .long("bootstrap")
                .value_name("HOST:PORT")
                .action(ArgAction::Append)
                .help("Bootstrap peer (repeatable); replaces configured peers")
                .global(true),
        )
        .arg(
            Arg::new("version")
                .short('V')
                .long("version")
                .action(ArgAction::SetTrue)
                .help("Print detailed version information and exit")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "compact"])
                .help("Select log output format")
                .global(true),
        )
        .arg(
            Arg::new("disable-metrics")
                .long("disable-metrics")
                .action(ArgAction::SetTrue)
                .help("Disable the Prometheus metrics endpoint")
                .global(true),
        )
        .arg(
            Arg::new("pid-file")
                .long("pid-file")
                .value_name("FILE")
                .help("PID file written while the node runs")
                .global(true),
        )
        .subcommand(Command::new("start").about("Start the node and serve the mesh protocol"))
        .subcommand(
            Command::new("status")
                .about("Ping a running node")
                .arg(peer_arg()),
        )
        .subcommand(
            Command::new("peers")
                .about("List the peers a node knows")
                .arg(peer_arg()),
        )
        .subcommand(
            Command::new("catalog")
                .about("List the content records a node holds")
                .arg(peer_arg()),
        )
        .subcommand(
            Command::new("fetch")
                .about("Download one content object and verify its digest")
                .arg(
                    Arg::new("hash")
                        .value_name("HASH")
                        .required(true)
                        .help("Hex content hash"),
                )
                .arg(peer_arg())
                .arg(
                    Arg::new("out")
                        .short('o')
                        .long("out")
                        .value_name("FILE")
                        .help("Output path (defaults to <HASH> in the working directory)"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    if matches.get_flag("version") {
        print_version_info();
        return Ok(());
    }

    let config = load_config_with_overrides(&matches)?;

    match matches.subcommand() {
        Some(("status", sub)) => return check_status(&config, sub).await,
        Some(("peers", sub)) => return list_peers(&config, sub).await,
        Some(("catalog", sub)) => return list_catalog(&config, sub).await,
        Some(("fetch", sub)) => return fetch_content(&config, sub).await,
        _ => {}
    }

    init_logging(&config)?;
    info!(
        version = SOUNDMESH_VERSION,
        commit = git_commit_hash(),
        protocol = MESH_PROTOCOL_VERSION,
        "starting soundmesh node"
    );
    if let Some(path) = &config.config_path {
        info!("loaded configuration from {}", path.display());
    }

    init_metrics(&config);

    let mut instance = Instance::claim(
        (!config.in_memory).then(|| config.data_path()),
        config.pid_file.as_deref(),
    )?;

    let node = Node::open(config.node_config()?)
        .await
        .context("failed to open node")?;
    let addr = node.start().await.context("failed to start mesh server")?;
    if let Err(err) = instance.record_listener(node.peer_id(), addr) {
        warn!("client subcommands will not find this node: {:#}", err);
    }
    info!(
        peer_id = node.peer_id(),
        %addr,
        advertised = %node.endpoint(),
        "node is serving"
    );

    shutdown_signal().await;
    info!("shutdown requested");

    node.stop().await.context("failed to stop node")?;
    info!("node stopped");
    Ok(())
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<AppConfig> {
    let config_path = matches
        .get_one::<String>("config")
        .map(|value| value.as_str());
    let mut config = AppConfig::load(config_path)?;
    apply_overrides(matches, &mut config);
    config.validate()?;

    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) {
    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        config.data_dir = data_dir.clone();
    }

    if matches.get_flag("in-memory") {
        config.in_memory = true;
    }

    if let Some(bind) = matches.get_one::<String>("bind") {
        config.bind = bind.clone();
    }

    if let Some(host) = matches.get_one::<String>("advertise-host") {
        config.advertise_host = Some(host.clone());
    }

    if let Some(peers) = matches.get_many::<String>("bootstrap") {
        config.bootstrap_peers = peers.cloned().collect();
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if matches.get_flag("disable-metrics") {
        config.metrics_enabled = false;
    }

    if let Some(pid_file) = matches.get_one::<String>("pid-file") {
        config.pid_file = Some(PathBuf::from(pid_file));
    }
}

fn print_version_info() {
    println!(
        "soundmesh-node {} (commit {}) [protocol v{}]",
        SOUNDMESH_VERSION,
        git_commit_hash(),
        MESH_PROTOCOL_VERSION
    );
}

/// `--peer`, else the listener recorded by the node running on the data
/// directory, else the configured bind address.
fn target_endpoint(config: &AppConfig, matches: &clap::ArgMatches) -> Result<Endpoint> {
    if let Some(raw) = matches.get_one::<String>("peer") {
        return Endpoint::parse(raw).with_context(|| format!("invalid peer address {raw:?}"));
    }
    let running = (!config.in_memory)
        .then(|| running_instance(config.data_path()))
        .flatten()
        .and_then(|info| info.mesh_addr);
    let addr = match running {
        Some(addr) => dialable_local(addr),
        None => config.local_peer_address()?,
    };
    Ok(Endpoint::new(addr.ip().to_string(), addr.port()))
}

fn client_for(config: &AppConfig) -> Result<MeshClient> {
    MeshClient::new(Duration::from_millis(config.request_timeout_ms))
        .context("failed to build HTTP client")
}

async fn check_status(config: &AppConfig, matches: &clap::ArgMatches) -> Result<()> {
    let endpoint = target_endpoint(config, matches)?;
    let response = client_for(config)?
        .ping(&endpoint)
        .await
        .with_context(|| format!("ping {endpoint} failed"))?;
    println!("GET {}/ping -> {}", endpoint.base_url(), response.status);
    if response.is_ok() {
        Ok(())
    } else {
        anyhow::bail!("node at {endpoint} reported status {:?}", response.status)
    }
}

async fn list_peers(config: &AppConfig, matches: &clap::ArgMatches) -> Result<()> {
    let endpoint = target_endpoint(config, matches)?;
    let peers = client_for(config)?.list_peers(&endpoint).await?;
    println!("{}", serde_json::to_string_pretty(&peers)?);
    Ok(())
}

async fn list_catalog(config: &AppConfig, matches: &clap::ArgMatches) -> Result<()> {
    let endpoint = target_endpoint(config, matches)?;
    let records = client_for(config)?.catalog(&endpoint).await?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

async fn fetch_content(config: &AppConfig, matches: &clap::ArgMatches) -> Result<()> {
    let raw_hash = matches
        .get_one::<String>("hash")
        .ok_or_else(|| anyhow!("missing content hash"))?;
    let hash = ContentHash::from_hex(raw_hash)?;
    let endpoint = target_endpoint(config, matches)?;

    let bytes = client_for(config)?
        .fetch_content(&endpoint, &hash, None)
        .await?;
    let actual = ContentHash::from_data(&bytes);
    if actual != hash {
        anyhow::bail!("{endpoint} returned bytes hashing to {actual}, expected {hash}");
    }

    let out = matches
        .get_one::<String>("out")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(hash.to_hex()));
    fs::write(&out, &bytes).with_context(|| format!("failed to write {}", out.display()))?;
    println!("{} bytes verified and written to {}", bytes.len(), out.display());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_metrics(config: &AppConfig) {
    if !config.metrics_enabled {
        info!("Prometheus metrics exporter disabled via configuration");
        return;
    }

    let addr = match config.metrics_addr() {
        Ok(addr) => addr,
        Err(err) => {
            warn!("Metrics exporter not started: {}", err);
            return;
        }
    };

    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            info!("Prometheus metrics exporter listening on {}", addr);
            telemetry::describe_metrics();
        }
        Err(err) => {
            warn!("Failed to install Prometheus metrics exporter: {}", err);
        }
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_log_directives(&config.log_level))
            .with_context(|| format!("invalid log level {:?}", config.log_level))?,
    };
    let output: Box<dyn Layer<Registry> + Send + Sync> = match config.log_format.as_str() {
        "compact" => fmt::layer().compact().boxed(),
        _ => fmt::layer().pretty().boxed(),
    };
    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()?;
    Ok(())
}

fn default_log_directives(level: &str) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(LOG_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}
