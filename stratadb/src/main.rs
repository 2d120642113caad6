use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use strata_id::{IdGenerator, IdGeneratorConfig};
use strata_log::LogTarget;
use strata_types::{GeneratedId, Predicate, Value};
use stratadb::{demo, Cluster};
use tokio::runtime::Runtime;
use tracing::{info, Level};

/// StrataDB sharding router.
#[derive(Parser)]
#[command(name = "stratadb", author, version, about = "StrataDB sharding router", long_about = None)]
struct Cli {
    #[command(flatten)]
    opts: Options,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Options {
    /// Cluster configuration file.
    #[arg(long, global = true, default_value = "samples/sharding.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    /// Write JSON logs to an hourly rolling file in this directory instead
    /// of stderr.
    #[arg(long, global = true)]
    log_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ping every configured database and exit.
    HealthCheck,

    /// Load sample orders into t_order and print where each one went.
    Demo {
        /// Number of users (one order each).
        #[arg(long, default_value_t = 10)]
        users: i64,
    },

    /// Show the physical targets for a set of key values.
    Route {
        /// Logical table.
        #[arg(long)]
        table: String,
        /// `column=value` condition, repeatable.
        #[arg(long = "key", value_parser = parse_condition)]
        keys: Vec<(String, Value)>,
    },

    /// Generate ids without touching any database.
    NextId {
        /// Node id of the generator.
        #[arg(long, default_value_t = 0)]
        node_id: u16,
        /// How many ids to print.
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Decode an existing id instead.
        #[arg(long)]
        decode: Option<u64>,
    },

    /// Run the router with the metrics exporter and readiness probe until
    /// interrupted.
    Serve {
        /// Prometheus exporter address.
        #[arg(long, default_value = "0.0.0.0:9187")]
        metrics: String,
        /// Readiness probe address.
        #[arg(long, default_value = "0.0.0.0:9188")]
        readyz: SocketAddr,
        /// `user:password` required by the metrics exporter.
        #[arg(long)]
        metrics_auth: Option<String>,
    },
}

fn parse_condition(raw: &str) -> Result<(String, Value), String> {
    let (column, value) = raw.split_once('=').ok_or_else(|| format!("expected column=value, got {raw:?}"))?;
    Ok((column.trim().to_string(), Value::parse_literal(value.trim())))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let target = match cli.opts.log_dir.clone() {
        Some(dir) => LogTarget::File { dir },
        None => LogTarget::Stderr,
    };
    if let Err(e) = strata_log::init(target, cli.opts.log_level) {
        eprintln!("logging disabled: {e:#}");
    }
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::NextId { node_id, count, decode } => {
            next_id(node_id, count, decode)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Route { table, keys } => {
            route(&cli.opts.config, &table, keys)?;
            Ok(ExitCode::SUCCESS)
        }
        command => {
            // Start async runtime manually since main is sync.
            let rt = Runtime::new().context("starting runtime")?;
            rt.block_on(run_async(&cli.opts, command))
        }
    }
}

async fn run_async(opts: &Options, command: Commands) -> Result<ExitCode> {
    let cluster = Cluster::load(&opts.config)?;
    match command {
        Commands::HealthCheck => {
            let healthy = cluster.health_check().await;
            println!("{}", if healthy { "OK" } else { "FAILED" });
            Ok(if healthy { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Commands::Demo { users } => {
            let report = demo::run(cluster.coordinator(), users).await?;
            for insert in &report.inserts {
                let i = &insert.inserted;
                println!("user_id={:<3} order_id={:<20} -> {} ({})", insert.user_id, i.key, i.physical, i.target);
            }
            for (user_id, rows) in &report.per_user {
                println!("user_id={user_id}: {}", serde_json::to_string(rows)?);
            }
            println!("sum(amount) = {}", report.total);
            println!("paid: {} updated, {} found by status", report.paid, report.paid_rows.len());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve { metrics, readyz, metrics_auth } => {
            let auth = metrics_auth
                .map(|raw| {
                    raw.split_once(':')
                        .map(|(u, p)| (u.to_string(), p.to_string()))
                        .ok_or_else(|| anyhow!("--metrics-auth expects user:password"))
                })
                .transpose()?;
            let metrics_addr = strata_metrics::serve(&metrics, auth).await?;
            let readyz_addr = cluster.start_readyz(readyz)?;
            info!(%metrics_addr, %readyz_addr, "stratadb serving, press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            cluster.shutdown();
            info!("stratadb stopped");
            Ok(ExitCode::SUCCESS)
        }
        Commands::NextId { .. } | Commands::Route { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn route(config: &str, table: &str, keys: Vec<(String, Value)>) -> Result<()> {
    let cluster = Cluster::load(config)?;
    let filter = keys.into_iter().fold(Predicate::all(), |p, (c, v)| p.and_eq(c, v));
    let route = cluster.coordinator().router().route(table, &filter)?;
    println!("{table} where {filter}: {:?}, {} target(s)", route.kind, route.targets.len());
    for (target, name) in route.targets.iter().zip(route.describe()) {
        println!("  {target} {name}");
    }
    Ok(())
}

fn next_id(node_id: u16, count: usize, decode: Option<u64>) -> Result<()> {
    if let Some(raw) = decode {
        let parts = IdGenerator::decompose(GeneratedId(raw));
        println!("{raw}: {parts:?}");
        return Ok(());
    }
    let generator = IdGenerator::new(IdGeneratorConfig::for_node(node_id))?;
    for _ in 0..count {
        let id = generator.next_id()?;
        println!("{id} {:?}", IdGenerator::decompose(id));
    }
    Ok(())
}
