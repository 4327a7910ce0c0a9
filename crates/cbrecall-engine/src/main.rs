#![warn(missing_docs)]

//! Recall engine simulator: runs one recall scenario against the in-memory
//! back-end and a scripted client, then prints what happened.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cbrecall_engine::error::{NFS4ERR_DELAY, NFS4ERR_NOMATCHING_LAYOUT};
use cbrecall_engine::memory::BackendEvent;
use cbrecall_engine::state::DelegationType;
use cbrecall_engine::types::{
    ClientFilter, ClientId, DeviceId, ExportId, FileHandle, IoMode, LayoutType,
    NotifyDeviceType, RecallCookie, Segment,
};
use cbrecall_engine::{
    CallbackOp, Clock, Collaborators, MemoryBackend, RecallConfig, RecallEngine,
    RecallStatsSnapshot, ScriptedReply, ScriptedTransport, TokioClock, TokioExecutor,
};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::time::Instant;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Lease used when neither a config file nor --lease says otherwise
const SIM_LEASE_SECS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Client acknowledges the CB_RECALL and returns the delegation
    DelegReturn,
    /// Client never answers; the delegation is revoked after two leases
    DelegSilent,
    /// Client acknowledges but never returns; revoked one lease later
    DelegHold,
    /// Client delays CB_LAYOUTRECALL six times, then has nothing to return
    LayoutDelay,
    /// Layout recall over three layouts, two of which overlap the range
    LayoutRange,
    /// Device change fan-out to a mix of 4.0 and 4.1 clients
    DeviceNotify,
}

#[derive(Debug, Parser)]
#[command(name = "cbrecall-sim", about = "Delegation and layout recall simulator")]
struct Cli {
    /// Scenario to run
    #[arg(value_enum)]
    scenario: Scenario,

    /// Engine configuration file (TOML or JSON)
    #[arg(short, long, env = "CBRECALL_CONFIG")]
    config: Option<PathBuf>,

    /// Lease lifetime in seconds, overriding the config file
    #[arg(short, long)]
    lease: Option<u32>,

    /// JSON log lines and a JSON report
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    scenario: String,
    lease_secs: u32,
    stats: RecallStatsSnapshot,
    events: Vec<ReportEvent>,
    callbacks: Vec<ReportCallback>,
}

#[derive(Debug, Serialize)]
struct ReportEvent {
    at_ms: u128,
    event: BackendEvent,
}

#[derive(Debug, Serialize)]
struct ReportCallback {
    at_ms: u128,
    client: ClientId,
    op: &'static str,
    accepted: bool,
}

struct Sim {
    backend: Arc<MemoryBackend>,
    transport: Arc<ScriptedTransport>,
    engine: Arc<RecallEngine>,
}

impl Sim {
    fn new(config: RecallConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let backend = Arc::new(MemoryBackend::new(clock.clone(), config.callback_ident));
        let transport = Arc::new(ScriptedTransport::new(clock.clone()));
        let engine = RecallEngine::new(
            config,
            Collaborators {
                store: backend.clone(),
                states: backend.clone(),
                exports: backend.clone(),
                clients: backend.clone(),
                transport: transport.clone(),
                executor: Arc::new(TokioExecutor::current()),
                clock,
            },
        )
        .context("building recall engine")?;
        Ok(Self {
            backend,
            transport,
            engine,
        })
    }
}

fn load_config(cli: &Cli) -> Result<RecallConfig> {
    let mut config = match &cli.config {
        Some(path) => RecallConfig::from_file(path)?,
        None => RecallConfig::with_lease(SIM_LEASE_SECS),
    };
    if let Some(lease) = cli.lease {
        config.lease_lifetime_secs = lease;
        config.validate()?;
    }
    Ok(config)
}

async fn run(scenario: Scenario, sim: &Sim) -> Result<()> {
    let export = ExportId(1);
    sim.backend.add_export(export, "/sim");
    let handle = FileHandle::new(b"sim-file-0001".to_vec());
    let file = sim.backend.add_file(export, handle.clone());
    let client = ClientId(0x5151);
    sim.backend.add_client(client, 1);

    match scenario {
        Scenario::DelegReturn => {
            let other = sim
                .backend
                .grant_delegation(&file, client, DelegationType::Write);
            let backend = sim.backend.clone();
            sim.transport.set_observer(move |_, compound| {
                if let CallbackOp::Recall { .. } = compound.op {
                    let backend = backend.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        if let Err(e) = backend.return_delegation(&other) {
                            tracing::debug!(error = %e, "simulated DELEGRETURN refused");
                        }
                    });
                }
            });
            sim.engine.delegrecall(export, &handle)?;
        }
        Scenario::DelegSilent => {
            sim.backend
                .grant_delegation(&file, client, DelegationType::Read);
            sim.transport.always(
                client,
                ScriptedReply::TimeOut(Duration::from_millis(200)),
            );
            sim.engine.delegrecall(export, &handle)?;
        }
        Scenario::DelegHold => {
            sim.backend
                .grant_delegation(&file, client, DelegationType::Read);
            sim.engine.delegrecall(export, &handle)?;
        }
        Scenario::LayoutDelay => {
            sim.backend.grant_layout(
                &file,
                client,
                LayoutType::Files,
                vec![Segment::whole_file()],
            );
            sim.transport.script(
                client,
                std::iter::repeat(ScriptedReply::Status(NFS4ERR_DELAY)).take(6),
                ScriptedReply::Status(NFS4ERR_NOMATCHING_LAYOUT),
            );
            sim.engine.layoutrecall(
                export,
                &handle,
                LayoutType::Files,
                true,
                Segment::whole_file(),
                RecallCookie(1),
                ClientFilter::All,
            )?;
        }
        Scenario::LayoutRange => {
            for (i, offset) in [0u64, 100, 200].into_iter().enumerate() {
                let owner = ClientId(0x100 + i as u64);
                sim.backend.add_client(owner, 1);
                sim.backend.grant_layout(
                    &file,
                    owner,
                    LayoutType::Files,
                    vec![Segment::new(offset, 100, IoMode::ReadWrite)],
                );
                sim.transport
                    .always(owner, ScriptedReply::Status(NFS4ERR_NOMATCHING_LAYOUT));
            }
            sim.engine.layoutrecall(
                export,
                &handle,
                LayoutType::Files,
                false,
                Segment::new(50, 100, IoMode::Any),
                RecallCookie(2),
                ClientFilter::All,
            )?;
        }
        Scenario::DeviceNotify => {
            sim.backend.add_client(ClientId(0x40), 0);
            sim.backend.add_client(ClientId(0x42), 2);
            sim.engine.notify_device(
                NotifyDeviceType::Change,
                LayoutType::Files,
                DeviceId::new(export, 7),
                false,
            )?;
        }
    }
    Ok(())
}

fn report(scenario: Scenario, sim: &Sim, start: Instant) -> Report {
    let since = |at: Instant| at.saturating_duration_since(start).as_millis();
    Report {
        scenario: format!("{:?}", scenario),
        lease_secs: sim.engine.config().lease_lifetime_secs,
        stats: sim.engine.stats().snapshot(),
        events: sim
            .backend
            .events()
            .into_iter()
            .map(|e| ReportEvent {
                at_ms: since(e.at),
                event: e.event,
            })
            .collect(),
        callbacks: sim
            .transport
            .calls()
            .into_iter()
            .map(|c| ReportCallback {
                at_ms: since(c.at),
                client: c.client,
                op: c.compound.op.name(),
                accepted: c.accepted,
            })
            .collect(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(EnvFilter::from_default_env())
            .init();
    }

    let config = load_config(&cli)?;
    let lease = config.lease_lifetime();
    tracing::info!(scenario = ?cli.scenario, lease_secs = lease.as_secs(), "recall simulator starting");

    let sim = Sim::new(config)?;
    let start = Instant::now();
    run(cli.scenario, &sim).await?;

    // every scenario settles within two leases
    tokio::time::sleep(lease * 2 + Duration::from_secs(1)).await;

    let report = report(cli.scenario, &sim, start);
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("scenario: {} (lease {}s)", report.scenario, report.lease_secs);
        for call in &report.callbacks {
            println!(
                "  {:>6}ms  {} -> {}{}",
                call.at_ms,
                call.op,
                call.client,
                if call.accepted { "" } else { " (refused)" }
            );
        }
        for event in &report.events {
            println!("  {:>6}ms  {:?}", event.at_ms, event.event);
        }
        println!("{}", serde_json::to_string(&report.stats)?);
    }
    Ok(())
}
