//! Committee Node
//!
//! Runs a whole committee in one process: every member gets its own consensus
//! operator, members talk over an in-memory network, and a memory ledger
//! confirms the transactions they finalize. Demo requests are fed to every
//! member so the chain advances.

use anyhow::Result;
use clap::Parser;
use committee_consensus::{
    Address, Balances, Color, Committee, CommitteeMember, Digest, DigestExecutor, LocalNetwork,
    NotifiedBatchSelector, OperatorBuilder, OperatorHandle, RequestMessage, ResultTransaction,
    StateIndex,
};
use ledger_bridge::{ConfirmationRelay, MemoryLedger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{NodeConfig, RotationKind};

/// Committee consensus node
#[derive(Parser, Debug)]
#[command(name = "committee-node")]
#[command(about = "Leader-based committee consensus over an in-memory ledger", long_about = None)]
struct Args {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of committee members (overrides the config file)
    #[arg(long)]
    committee_size: Option<u16>,

    /// Operator tick period in milliseconds (overrides the config file)
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Leader rotation (overrides the config file)
    #[arg(long, value_enum)]
    rotation: Option<RotationKind>,

    /// Demo requests to post at startup
    #[arg(long, default_value = "10")]
    requests: u64,

    /// Stop once the ledger reaches this state index
    #[arg(long)]
    target_state: Option<StateIndex>,

    /// Key generation seed (random when unset)
    #[arg(long)]
    seed: Option<u64>,

    /// Member to cut off from the network
    #[arg(long)]
    offline_peer: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(size) = self.committee_size {
            config.committee_size = size;
        }
        if let Some(tick) = self.tick_ms {
            config.tick_interval_ms = tick;
        }
        if let Some(rotation) = self.rotation {
            config.rotation = rotation;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.node_config()?;
    run_committee(args, config).await
}

/// Start every member, feed demo requests and run until stopped
async fn run_committee(args: Args, config: NodeConfig) -> Result<()> {
    let seed = args.seed.unwrap_or_else(rand::random);
    let mut key_seed = [0u8; 32];
    key_seed[..8].copy_from_slice(&seed.to_le_bytes());

    let (committee, shares) = Committee::generate(config.committee_size, key_seed)?;
    let committee = Arc::new(committee);
    let consensus = config.consensus()?;

    tracing::info!("Starting committee of {} members", committee.size());
    tracing::info!("  Address: {}", committee.address());
    tracing::info!("  Quorum: {}", committee.quorum());
    tracing::info!("  Rotation: {:?} (seed {})", config.rotation, seed);
    tracing::info!("  Tick: {}ms", config.tick_interval_ms);

    let origin = ResultTransaction::origin(
        committee.address(),
        Balances::from([(Color::NATIVE, config.native_balance)]),
    );
    let ledger = Arc::new(MemoryLedger::new(committee.clone(), origin));
    let network = LocalNetwork::new(committee.size());
    let rotation = config.rotation.build(Digest::of(&seed.to_le_bytes()));
    let (stop, shutdown) = watch::channel(false);

    let mut relay = ConfirmationRelay::new();
    let mut handles: Vec<OperatorHandle> = Vec::new();
    let mut operators = Vec::new();
    for share in shares {
        let index = share.index();
        let member = CommitteeMember::new(committee.clone(), share)?;
        let mut builder = OperatorBuilder::new(member)
            .config(consensus.clone())
            .rotation(rotation.clone())
            .executor(Arc::new(DigestExecutor))
            .oracle(ledger.clone())
            .submitter(ledger.clone())
            .transport(Arc::new(network.transport(index)));
        if let Some(min) = config.min_notifications {
            builder = builder.selector(Box::new(NotifiedBatchSelector::with_min_notifications(min)));
        }
        let (operator, events) = builder.build()?;

        let handle = operator.handle();
        network.register(index, handle.clone());
        relay = relay.with_target(handle.clone());
        handles.push(handle);
        operators.push(tokio::spawn(operator.run(events, shutdown.clone())));
    }

    if let Some(peer) = args.offline_peer {
        network.set_reachable(peer, false);
        tracing::warn!("Member {} is offline", peer);
    }

    let last_relayed = relay.last_confirmed();
    let relay_task = relay.spawn(ledger.subscribe(), shutdown.clone());

    // Operators start from the ledger's current state
    let genesis = ledger.confirmation().await;
    for handle in &handles {
        handle.confirm_state(genesis.state_tx.clone(), genesis.snapshot);
    }

    let sender = Address(rand::random());
    for nonce in 0..args.requests {
        let request = RequestMessage::new(sender, format!("demo-{}", nonce).into_bytes(), nonce);
        for handle in &handles {
            handle.post_request(request.clone());
        }
    }
    tracing::info!("Posted {} demo requests from {}", args.requests, sender);
    tracing::info!("Press Ctrl+C to stop.");

    let started = chrono::Utc::now();
    let mut status = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Shutting down...");
                break;
            }
            _ = status.tick() => {
                let state = ledger.state_index().await;
                tracing::info!(
                    "Ledger at state {} (relayed {:?}, {} messages delivered, {} dropped)",
                    state,
                    *last_relayed.read().await,
                    network.messages_delivered(),
                    network.messages_dropped()
                );
                if args.target_state.map_or(false, |target| state >= target) {
                    tracing::info!("Target state {} reached", state);
                    break;
                }
            }
        }
    }

    let _ = stop.send(true);
    for (index, result) in futures::future::join_all(operators).await.into_iter().enumerate() {
        match result {
            Ok(stats) => tracing::info!("Operator {} stats: {}", index, serde_json::to_string(&stats)?),
            Err(e) => tracing::error!("Operator {} task failed: {}", index, e),
        }
    }
    relay_task.await?;

    let elapsed = chrono::Utc::now() - started;
    let summary = ledger.summary().await;
    tracing::info!(
        "Final ledger after {}s: {}",
        elapsed.num_seconds(),
        serde_json::to_string_pretty(&summary)?
    );

    Ok(())
}
