mod aggregate;
mod config;
mod error;
mod logger;
mod merge;
mod output;
mod pool;
mod probe;
mod rank;
mod sources;
#[cfg(test)]
mod testutil;
mod traits;
mod tunnel;
mod types;
mod utils;

use aggregate::RoundAggregator;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use config::Settings;
use pool::WorkerPool;
use probe::ProbeRunner;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use types::{ProxyNode, RankMode, RankedNode};

#[derive(Parser)]
#[command(name = "nodecheck")]
#[command(about = "Validate proxy nodes from multiple subscriptions and keep the stable ones", long_about = None)]
struct Cli {
    /// Settings file (default: ~/.config/nodecheck/settings.toml if present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v, -vv, -vvv). RUST_LOG takes precedence.
    #[arg(long, short, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and merge all subscriptions, then list the nodes
    Merge,
    /// Probe every node for several rounds and print the ranking
    Test {
        #[command(flatten)]
        probe: ProbeArgs,
    },
    /// Probe, rank, and write the surviving nodes into the output config
    Run {
        #[command(flatten)]
        probe: ProbeArgs,

        /// Output file (overrides [output].path)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Restore the output config from its latest backup
    Restore,
    /// Print the effective settings
    Config,
}

#[derive(Args)]
struct ProbeArgs {
    /// Number of rounds a node must pass
    #[arg(long)]
    rounds: Option<u32>,

    /// Number of concurrent probes
    #[arg(long)]
    concurrency: Option<usize>,

    /// First local port; worker i uses base_port + i
    #[arg(long)]
    base_port: Option<u16>,

    /// Ranking policy
    #[arg(long, value_enum)]
    mode: Option<RankMode>,

    /// Skip the download speed test (ranks by latency)
    #[arg(long)]
    no_speed: bool,
}

impl ProbeArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(rounds) = self.rounds {
            settings.schedule.rounds = rounds;
        }
        if let Some(concurrency) = self.concurrency {
            settings.schedule.concurrency = concurrency;
        }
        if let Some(base_port) = self.base_port {
            settings.schedule.base_port = base_port;
        }
        if let Some(mode) = self.mode {
            settings.schedule.mode = mode;
        }
        if self.no_speed {
            settings.probe.throughput = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init(cli.verbose);

    let mut settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Merge => handle_merge(&settings).await?,
        Commands::Test { probe } => {
            probe.apply(&mut settings);
            handle_test(&settings).await?
        }
        Commands::Run { probe, output } => {
            probe.apply(&mut settings);
            if let Some(path) = output {
                settings.output.path = path;
            }
            handle_run(&settings).await?
        }
        Commands::Restore => handle_restore(&settings).await?,
        Commands::Config => print!("{}", settings.to_toml()?),
    }

    Ok(())
}

// --- Handlers ---

async fn handle_merge(settings: &Settings) -> Result<()> {
    let nodes = collect_nodes(settings).await?;

    println!("{:<5} {:<8} {:<24} NAME", "#", "TYPE", "SERVER");
    println!("{}", "-".repeat(70));
    for (i, node) in nodes.iter().enumerate() {
        println!(
            "{:<5} {:<8} {:<24} {}",
            i + 1,
            node.kind(),
            truncate(&node.server(), 24),
            node.name
        );
    }
    println!("{}", "-".repeat(70));
    println!("{} nodes after merging.", nodes.len());

    Ok(())
}

async fn handle_test(settings: &Settings) -> Result<()> {
    settings.validate()?;
    let nodes = collect_nodes(settings).await?;
    let total = nodes.len();
    let ranked = validate_nodes(settings, nodes).await?;

    println!();
    print_ranking(&ranked);
    println!("{}", "-".repeat(70));
    println!(
        "{} / {} nodes passed all {} rounds.",
        ranked.len(),
        total,
        settings.schedule.rounds
    );

    Ok(())
}

async fn handle_run(settings: &Settings) -> Result<()> {
    settings.validate()?;
    let nodes = collect_nodes(settings).await?;
    let total = nodes.len();
    let ranked = validate_nodes(settings, nodes).await?;

    output::write_output(&ranked, &settings.output).await?;

    println!();
    println!("{}", "-".repeat(40));
    println!("Validation finished!");
    println!("Usable nodes: {} / {}", ranked.len(), total);
    println!("Saved to: {}", settings.output.path.display());
    println!("{}", "-".repeat(40));

    Ok(())
}

async fn handle_restore(settings: &Settings) -> Result<()> {
    println!("Restoring {}...", settings.output.path.display());
    output::restore_output(&settings.output).await?;
    println!("Success! Output restored from the latest backup.");
    Ok(())
}

// --- Pipeline ---

/// 拉取 -> 合并 -> 过滤
async fn collect_nodes(settings: &Settings) -> Result<Vec<ProxyNode>> {
    println!("Fetching {} subscriptions...", settings.subscriptions.len());

    let client = sources::source_client(settings.fetch_timeout());
    let fetched = sources::fetch_sources(&client, &settings.subscriptions).await;
    let merged = merge::merge_sources(fetched);
    let merged_count = merged.len();

    let nodes = sources::filter_excluded(merged, settings.exclude_pattern()?.as_ref());
    info!(
        "Merged {} nodes, {} excluded by name",
        merged_count,
        merged_count - nodes.len()
    );

    if nodes.is_empty() {
        return Err(error::CheckError::NoNodes.into());
    }
    Ok(nodes)
}

/// 多轮探测并排序
async fn validate_nodes(settings: &Settings, nodes: Vec<ProxyNode>) -> Result<Vec<RankedNode>> {
    let schedule = &settings.schedule;
    let mode = if settings.probe.throughput {
        schedule.mode
    } else {
        RankMode::Latency
    };

    println!(
        "Testing {} nodes: {} rounds, concurrency {}, ports {}-{}, ranking by {}",
        nodes.len(),
        schedule.rounds,
        schedule.concurrency,
        schedule.base_port,
        usize::from(schedule.base_port) + schedule.concurrency - 1,
        mode
    );

    let progress = utils::round_progress();
    let prober = Arc::new(ProbeRunner::new(settings.probe.clone()));
    let pool = WorkerPool::new(prober, schedule.concurrency, schedule.base_port)
        .with_progress(progress.clone());

    let aggregation = RoundAggregator::new(pool, schedule.rounds).run(nodes).await;
    progress.finish_with_message("Testing completed.");

    Ok(aggregation.rank(mode)?)
}

fn print_ranking(ranked: &[RankedNode]) {
    println!(
        "{:<5} {:<10} {:<12} {:<8} NAME",
        "RANK", "LATENCY", "SPEED", "TYPE"
    );
    println!("{}", "-".repeat(70));

    for (i, r) in ranked.iter().enumerate() {
        println!(
            "{:<5} {:<10} {:<12} {:<8} {}",
            i + 1,
            utils::format_latency(r.avg_latency_ms),
            utils::format_speed(r.avg_throughput_bps),
            r.node.kind(),
            r.node.name
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}
