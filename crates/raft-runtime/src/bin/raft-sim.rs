//! Run a replicated key-value cluster inside one process.
//!
//! Every node is a [`Replica`] wired to the others through a [`LocalNetwork`].
//! A client session then issues `set` commands; with `--partition-leader` the
//! current leader is cut off halfway through so a new one has to take over.
//!
//! ```bash
//! cargo run --bin raft-sim -- --nodes 5 --commands 20 --partition-leader
//! RUST_LOG=raft_runtime=debug cargo run --bin raft-sim -- --config sim.json
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueHint};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use raft_core::{KvStateMachine, Log, MemoryLog, MemoryMetaStore, MetaStore, RaftNode};
use raft_runtime::{load_config, Client, LocalNetwork, Replica, SimConfig};

/// Command-line arguments for the simulator.
#[derive(Parser, Debug)]
#[command(author, version, about = "Simulate a raft cluster in one process")]
struct Cli {
    /// JSON configuration file; defaults apply when omitted
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Cluster size; overrides cluster.nodes with n1..nN
    #[arg(long)]
    nodes: Option<usize>,

    /// Number of commands the client submits
    #[arg(long, default_value_t = 10)]
    commands: usize,

    /// Override raft.rtt_ms
    #[arg(long)]
    rtt_ms: Option<u64>,

    /// Isolate the leader halfway through, then heal before exiting
    #[arg(long)]
    partition_leader: bool,
}

fn init_tracing(config: &SimConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_config(cli: &Cli) -> Result<SimConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => SimConfig::default(),
    };
    if let Some(nodes) = cli.nodes {
        if nodes == 0 {
            bail!("--nodes must be at least 1");
        }
        config.cluster.nodes = (1..=nodes).map(|i| format!("n{i}")).collect();
    }
    if let Some(rtt_ms) = cli.rtt_ms {
        config.raft.rtt_ms = rtt_ms;
    }
    config.validate()?;
    Ok(config)
}

fn start_cluster(config: &SimConfig, network: &LocalNetwork) -> Result<Vec<Replica>> {
    let nodes = &config.cluster.nodes;
    let mut replicas = Vec::with_capacity(nodes.len());

    for id in nodes {
        let (meta, log): (Box<dyn MetaStore>, Box<dyn Log>) = match &config.storage.dir {
            Some(dir) => {
                let (meta, log) = raft_storage::open(dir.join(id))
                    .with_context(|| format!("opening storage for {id}"))?;
                (Box::new(meta), Box::new(log))
            }
            None => (Box::new(MemoryMetaStore::new()), Box::new(MemoryLog::new())),
        };

        let raft = RaftNode::new(id.clone(), nodes.clone(), log, meta)
            .with_context(|| format!("restoring state of {id}"))?;
        let replica = Replica::start(
            raft,
            config.raft.clone(),
            Box::new(KvStateMachine::new()),
            network.transport(id.clone()),
        );
        network.register(replica.clone());
        replicas.push(replica);
    }
    Ok(replicas)
}

async fn run_commands(client: &mut Client, range: std::ops::Range<usize>) -> Result<()> {
    for i in range {
        let output = client
            .execute(format!("set k{i} v{i}"))
            .await
            .with_context(|| format!("command {i}"))?;
        info!(
            command = i,
            leader = ?client.leader(),
            output = %String::from_utf8_lossy(&output),
            "command committed"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;
    init_tracing(&config);

    info!(
        nodes = config.cluster.nodes.len(),
        rtt_ms = config.raft.rtt_ms,
        pre_vote = config.raft.pre_vote,
        persistent = config.storage.dir.is_some(),
        "starting cluster"
    );

    let network = LocalNetwork::new(config.network.latency())
        .with_rpc_timeout(config.network.rpc_timeout());
    let replicas = start_cluster(&config, &network)?;
    let mut client = Client::new("raft-sim", replicas.iter().cloned())
        .with_attempt_timeout(config.raft.rtt() * 10);

    let half = cli.commands / 2;
    run_commands(&mut client, 0..half).await?;

    if cli.partition_leader {
        match client.leader().cloned() {
            Some(leader) => {
                network.isolate(&leader);
                run_commands(&mut client, half..cli.commands).await?;
                network.heal();
                // give the old leader a few heartbeats to learn the new term
                tokio::time::sleep(config.raft.rtt() * 5).await;
            }
            None => {
                warn!("no known leader to partition");
                run_commands(&mut client, half..cli.commands).await?;
            }
        }
    } else {
        run_commands(&mut client, half..cli.commands).await?;
    }

    // followers learn the final commit index on the next heartbeat
    tokio::time::sleep(config.raft.heartbeat_interval() * 2).await;

    let statuses: Vec<_> = replicas.iter().map(Replica::status).collect();
    println!("{}", serde_json::to_string_pretty(&statuses)?);

    for replica in &replicas {
        replica.shutdown();
    }
    Ok(())
}
