use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use holo_reactor::directory::Mismatch;
use holo_reactor::{LocalCluster, PeerId, ReactorConfig, ReactorError, StatsSnapshot};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-reactor")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive an in-process cluster through a sequence of blueprints.
    Simulate(SimulateArgs),
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    #[arg(long, default_value_t = 2)]
    peers: usize,

    /// Role string per step, e.g. `p,n` then `pn,np`. Token i describes peer i.
    #[arg(long = "blueprint", required = true)]
    blueprints: Vec<String>,

    /// Keys written through the router after each step.
    #[arg(long, default_value_t = 100)]
    writes: usize,

    /// Bound on the satisfaction wait of each step.
    #[arg(long = "timeout-ms", default_value_t = 2_000)]
    timeout_ms: u64,

    #[command(flatten)]
    tuning: TuningArgs,
}

/// Per-run overrides on top of [`ReactorConfig::from_env`].
#[derive(Parser, Debug)]
struct TuningArgs {
    #[arg(long)]
    backoff_base_ms: Option<u64>,

    #[arg(long)]
    backoff_max_ms: Option<u64>,

    #[arg(long)]
    echo_ack_timeout_ms: Option<u64>,

    #[arg(long)]
    write_ack_timeout_ms: Option<u64>,

    #[arg(long)]
    stall_report_after_ms: Option<u64>,

    #[arg(long)]
    erase_grace_ms: Option<u64>,

    #[arg(long)]
    backfill_chunk_keys: Option<usize>,

    #[arg(long)]
    backfill_channel_depth: Option<usize>,

    #[arg(long)]
    router_timeout_ms: Option<u64>,
}

fn override_millis(slot: &mut Duration, flag: Option<u64>) {
    if let Some(ms) = flag {
        *slot = Duration::from_millis(ms);
    }
}

impl TuningArgs {
    fn config(&self) -> anyhow::Result<ReactorConfig> {
        let mut config = ReactorConfig::from_env().context("reading HOLO_REACTOR_* settings")?;
        self.apply(&mut config)?;
        Ok(config)
    }

    fn apply(&self, config: &mut ReactorConfig) -> anyhow::Result<()> {
        override_millis(&mut config.backoff_base, self.backoff_base_ms);
        override_millis(&mut config.backoff_max, self.backoff_max_ms);
        override_millis(&mut config.echo_ack_timeout, self.echo_ack_timeout_ms);
        override_millis(&mut config.write_ack_timeout, self.write_ack_timeout_ms);
        override_millis(&mut config.stall_report_after, self.stall_report_after_ms);
        override_millis(&mut config.erase_grace, self.erase_grace_ms);
        override_millis(&mut config.router_timeout, self.router_timeout_ms);
        if let Some(keys) = self.backfill_chunk_keys {
            config.backfill_chunk_keys = keys;
        }
        if let Some(depth) = self.backfill_channel_depth {
            config.backfill_channel_depth = depth;
        }
        config.validate().context("invalid tuning flags")
    }
}

#[derive(Serialize)]
struct StepReport {
    blueprint: String,
    satisfied: bool,
    elapsed_ms: u64,
    writes: usize,
    mismatches: Vec<Mismatch>,
}

#[derive(Serialize)]
struct Report {
    peers: usize,
    steps: Vec<StepReport>,
    validated_keys: usize,
    primary_conflicts: usize,
    stats: BTreeMap<PeerId, StatsSnapshot>,
    totals: StatsSnapshot,
}

/// Key `i` of the letter keyspace; consecutive keys land in different shards.
fn key_for(i: usize) -> Vec<u8> {
    let letter = b'a' + (i % 26) as u8;
    let mut key = vec![letter];
    key.extend_from_slice(format!("key{i:06}").as_bytes());
    key
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<Report> {
    let config = args.tuning.config()?;
    let cluster = LocalCluster::start(args.peers, config)?;
    let timeout = Duration::from_millis(args.timeout_ms);
    let router = cluster.router(0)?.clone();
    let mut expected: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut steps = Vec::with_capacity(args.blueprints.len());

    for (step, roles) in args.blueprints.iter().enumerate() {
        let blueprint = cluster.compile_blueprint(roles)?;
        tracing::info!(step, blueprint = %roles, "applying blueprint");
        let started = Instant::now();
        cluster.set_all_blueprints(&blueprint);
        match cluster.wait_until_blueprint_satisfied(&blueprint, timeout).await {
            Ok(()) => {}
            Err(ReactorError::WaitTimeout { mismatches, .. }) => {
                for mismatch in &mismatches {
                    tracing::warn!(step, %mismatch, "blueprint not satisfied");
                }
                steps.push(StepReport {
                    blueprint: roles.clone(),
                    satisfied: false,
                    elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    writes: 0,
                    mismatches,
                });
                break;
            }
            Err(err) => return Err(err).with_context(|| format!("waiting for blueprint {roles:?}")),
        }
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(step, blueprint = %roles, elapsed_ms, "blueprint satisfied");

        for i in 0..args.writes {
            let key = key_for(i);
            let value = format!("step{step}-{i}").into_bytes();
            router
                .write(key.clone(), value.clone())
                .await
                .with_context(|| format!("writing {}", String::from_utf8_lossy(&key)))?;
            expected.insert(key, value);
        }
        steps.push(StepReport {
            blueprint: roles.clone(),
            satisfied: true,
            elapsed_ms,
            writes: args.writes,
            mismatches: Vec::new(),
        });
    }

    let all_satisfied = steps.iter().all(|step| step.satisfied);
    let mut validated_keys = 0;
    if all_satisfied {
        for (key, value) in &expected {
            let entry = router
                .read(key.clone())
                .await
                .with_context(|| format!("reading {}", String::from_utf8_lossy(key)))?;
            match entry {
                Some(entry) if entry.value == *value => validated_keys += 1,
                other => anyhow::bail!(
                    "key {} holds {:?}, expected {:?}",
                    String::from_utf8_lossy(key),
                    other.map(|e| String::from_utf8_lossy(&e.value).into_owned()),
                    String::from_utf8_lossy(value)
                ),
            }
        }
    }

    let stats = cluster.stats();
    let mut totals = StatsSnapshot::default();
    for snapshot in stats.values() {
        totals.merge(snapshot);
    }
    let primary_conflicts = cluster.primary_conflicts().len();
    cluster.shutdown().await;
    Ok(Report {
        peers: args.peers,
        steps,
        validated_keys,
        primary_conflicts,
        stats,
        totals,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,holo_reactor=info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Simulate(args) => {
            let report = simulate(args).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.steps.iter().any(|step| !step.satisfied) {
                anyhow::bail!("simulation did not converge");
            }
            Ok(())
        }
    }
}
