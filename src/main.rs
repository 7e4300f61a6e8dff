//! # metastorage
//!
//! Entry point of a metastorage node: starts the configured raft groups and serves
//! them until SIGTERM or SIGINT.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

use metastorage::raft::{GroupId, LocalCluster};
use metastorage::server::{AutoCompactionMode, MetaStorageServer, ServerConfig};

/// Raft-replicated metadata store with conditional multi-key transactions.
#[derive(Parser, Debug)]
#[command(
    name = "metastorage",
    version,
    about = "Raft-replicated, strongly consistent metadata store"
)]
struct Args {
    /// Human-readable name for this member.
    #[arg(long, default_value = "default")]
    name: String,

    /// Raft node id of this member. A random id is generated when omitted.
    #[arg(long)]
    node_id: Option<u64>,

    /// Path to the data directory holding the raft logs.
    #[arg(long, default_value = "default.metastorage")]
    data_dir: String,

    /// Raft groups hosted by this node, comma separated.
    #[arg(long, default_value = "metastorage")]
    groups: String,

    /// Initial voters of every group, comma separated node ids.
    /// Defaults to this node alone, the only set a standalone replica accepts.
    #[arg(long, default_value = "")]
    peers: String,

    /// Time in milliseconds of a heartbeat interval.
    #[arg(long, default_value_t = 50)]
    heartbeat_interval: u64,

    /// Time in milliseconds for an election to timeout.
    #[arg(long, default_value_t = 300)]
    election_timeout: u64,

    /// Time in milliseconds a proposal may wait to be applied.
    #[arg(long, default_value_t = 5000)]
    proposal_timeout: u64,

    /// Deepest accepted nesting of a transaction program.
    #[arg(long, default_value_t = metastorage::invoke::DEFAULT_MAX_DEPTH)]
    max_program_depth: usize,

    /// Auto compaction mode - 'periodic' or 'revision'.
    #[arg(long, default_value = "periodic")]
    auto_compaction_mode: String,

    /// Auto compaction retention for the specified mode.
    /// For periodic mode: duration string (e.g., "10m" for 10 minutes).
    /// For revision mode: number of revisions to keep.
    #[arg(long, default_value = "0")]
    auto_compaction_retention: String,

    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level)?;

    let config = build_server_config(&args)?;
    print_startup_banner(&config, &args.log_level);

    // Peers of other processes are out of reach; replicas in this process share one cluster.
    let server = MetaStorageServer::new(config, LocalCluster::new()).await?;

    let shutdown = setup_signal_handlers()?;

    info!("Starting metastorage server...");
    match server.run(shutdown).await {
        Ok(()) => {
            info!("Server shut down gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {:?}", e);
            Err(e)
        }
    }
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" => EnvFilter::new("trace"),
        "debug" => EnvFilter::new("debug"),
        "info" => EnvFilter::new("info"),
        "warn" => EnvFilter::new("warn"),
        "error" => EnvFilter::new("error"),
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            EnvFilter::new("info")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

fn print_startup_banner(config: &ServerConfig, log_level: &str) {
    let version = env!("CARGO_PKG_VERSION");
    println!("metastorage v{}", version);
    println!();
    println!("Configuration:");
    println!("  Name:                  {}", config.name);
    println!("  Node id:               {}", config.node_id);
    println!("  Data directory:        {}", config.data_dir.display());
    println!(
        "  Groups:                {}",
        config
            .groups
            .iter()
            .map(|g| g.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  Peers:                 {:?}", config.peers);
    println!("  Heartbeat interval:    {}ms", config.heartbeat_interval_ms);
    println!("  Election timeout:      {}ms", config.election_timeout_ms);
    println!(
        "  Auto compaction:       {:?} {}",
        config.auto_compaction_mode, config.auto_compaction_retention
    );
    println!("  Log level:             {}", log_level);
    println!();
}

/// Build ServerConfig from CLI arguments.
fn build_server_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let node_id = args
        .node_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().as_u64_pair().0);

    let groups: Vec<GroupId> = parse_list(&args.groups)
        .into_iter()
        .map(GroupId::new)
        .collect();
    if groups.is_empty() {
        return Err(anyhow::anyhow!("At least one group must be configured"));
    }

    let peers = parse_peers(&args.peers)?;
    let peers = if peers.is_empty() { vec![node_id] } else { peers };
    if !peers.contains(&node_id) {
        return Err(anyhow::anyhow!(
            "Peers {:?} must include this node ({})",
            peers,
            node_id
        ));
    }
    // Replicas of this binary only reach each other through an in-process cluster.
    if peers.len() > 1 {
        return Err(anyhow::anyhow!(
            "Peers {:?} name other nodes, but this binary has no network transport and hosts a single replica",
            peers
        ));
    }

    let config = ServerConfig {
        name: args.name.clone(),
        node_id,
        data_dir: PathBuf::from(&args.data_dir),
        groups,
        peers,
        heartbeat_interval_ms: args.heartbeat_interval,
        election_timeout_ms: args.election_timeout,
        proposal_timeout_ms: args.proposal_timeout,
        max_program_depth: args.max_program_depth,
        auto_compaction_mode: AutoCompactionMode::from_str(&args.auto_compaction_mode)?,
        auto_compaction_retention: args.auto_compaction_retention.clone(),
    };

    // Surface a bad retention string at startup.
    config.compaction()?;
    Ok(config)
}

/// Parse a comma-separated list, trimming whitespace.
fn parse_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_peers(list: &str) -> anyhow::Result<Vec<u64>> {
    parse_list(list)
        .iter()
        .map(|id| {
            id.parse::<u64>()
                .map_err(|_| anyhow::anyhow!("Invalid peer id: {}", id))
        })
        .collect()
}

/// Set up signal handlers for graceful shutdown (SIGTERM, SIGINT).
fn setup_signal_handlers() -> anyhow::Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT signal");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["metastorage"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("a, b ,c"), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
        assert_eq!(parse_list("a,,b"), vec!["a", "b"]);
    }

    #[test]
    fn test_parse_peers() {
        assert_eq!(parse_peers("1,2,3").unwrap(), vec![1, 2, 3]);
        assert!(parse_peers("1,two").is_err());
    }

    #[test]
    fn test_defaults_to_single_voter() {
        let config = build_server_config(&args(&["--node-id", "7"])).unwrap();
        assert_eq!(config.node_id, 7);
        assert_eq!(config.peers, vec![7]);
        assert_eq!(config.groups, vec![GroupId::new("metastorage")]);
    }

    #[test]
    fn test_generated_node_id() {
        let config = build_server_config(&args(&[])).unwrap();
        assert_eq!(config.peers, vec![config.node_id]);
    }

    #[test]
    fn test_peers_must_include_self() {
        assert!(build_server_config(&args(&["--node-id", "4", "--peers", "1,2,3"])).is_err());

        let config =
            build_server_config(&args(&["--node-id", "2", "--peers", "2", "--groups", "a,b"]))
                .unwrap();
        assert_eq!(config.peers, vec![2]);
        assert_eq!(config.groups, vec![GroupId::new("a"), GroupId::new("b")]);
    }

    #[test]
    fn test_other_peers_rejected() {
        let err = build_server_config(&args(&["--node-id", "2", "--peers", "1,2,3"])).unwrap_err();
        assert!(err.to_string().contains("single replica"));
    }

    #[test]
    fn test_invalid_compaction_settings() {
        assert!(build_server_config(&args(&["--auto-compaction-mode", "hourly"])).is_err());
        assert!(build_server_config(&args(&[
            "--auto-compaction-mode",
            "revision",
            "--auto-compaction-retention",
            "ten"
        ]))
        .is_err());
    }
}
