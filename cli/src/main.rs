//! montecarlo - run, validate and debug Monte Carlo pipelines
//!
//! `run` wires producer, workers and aggregator in one process around the
//! in-memory broker. `produce`, `work` and `aggregate` each run a single
//! role against the broker named in the configuration, so the roles can
//! live in separate processes once that broker is shared between them.
//! `validate` and `eval` check model files and formulas without running
//! anything.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use montecarlo_core::broker::{connect_with_retry, connector_for, BrokerKind, Connector};
use montecarlo_core::formula::functions::constant;
use montecarlo_core::{
    shutdown_channel, AggregatorService, ConsoleDashboard, DistributionMode, Formula,
    LocalPipeline, ModelFile, PipelineConfig, RetryPolicy, ScenarioProducer, ScenarioSampler,
    Shutdown, TracingSink, Worker, WorkerId,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "montecarlo")]
#[command(about = "Distributed Monte Carlo simulation over a message broker", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Options shared by every command that touches the broker
#[derive(Args, Debug)]
struct ConfigArgs {
    /// Pipeline configuration file (.json, .jsonc, .json5 or .toml)
    #[arg(long, env = "MONTECARLO_CONFIG")]
    config: Option<PathBuf>,

    /// Broker implementation to connect to
    #[arg(long)]
    broker: Option<BrokerKind>,

    /// How workers obtain the model: slot or republish
    #[arg(long)]
    model_distribution: Option<DistributionMode>,
}

impl ConfigArgs {
    fn load(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_path(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        if let Some(broker) = self.broker {
            config.broker = broker;
        }
        if let Some(mode) = self.model_distribution {
            config.model_distribution = mode;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate, evaluate and aggregate a model in one process
    Run {
        /// Model file (.json, .jsonc, .json5 or .toml)
        #[arg(long)]
        model: PathBuf,

        #[command(flatten)]
        config: ConfigArgs,

        /// Number of evaluation workers
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// RNG seed for reproducible scenarios
        #[arg(long)]
        seed: Option<u64>,

        /// Redraw a console dashboard on every report tick
        #[arg(long)]
        dashboard: bool,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Publish the model and generate its scenarios, then exit
    Produce {
        #[arg(long)]
        model: PathBuf,

        #[command(flatten)]
        config: ConfigArgs,

        #[arg(long)]
        seed: Option<u64>,
    },

    /// Evaluate scenarios until interrupted
    Work {
        #[command(flatten)]
        config: ConfigArgs,

        /// Workers in this process
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },

    /// Aggregate results and report until interrupted
    Aggregate {
        #[command(flatten)]
        config: ConfigArgs,

        #[arg(long)]
        dashboard: bool,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a model file: structure, distributions and formula
    Validate {
        #[arg(long)]
        model: PathBuf,
    },

    /// Evaluate a formula once
    Eval {
        formula: String,

        /// Variable binding, repeatable
        #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_binding)]
        vars: Vec<(String, f64)>,
    },
}

fn parse_binding(text: &str) -> Result<(String, f64), String> {
    let (name, value) = text
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", text))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid value for {}: {}", name, e))?;
    Ok((name.trim().to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "montecarlo=info,montecarlo_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Command::Run {
            model,
            config,
            workers,
            seed,
            dashboard,
            json,
        } => {
            let mut config = config.load()?;
            if seed.is_some() {
                config.seed = seed;
            }
            let model = load_model(&model)?;
            run(config, model, workers, dashboard, json).await
        }
        Command::Produce {
            model,
            config,
            seed,
        } => {
            let mut config = config.load()?;
            if seed.is_some() {
                config.seed = seed;
            }
            let model = load_model(&model)?;
            produce(config, model).await
        }
        Command::Work { config, workers } => work(config.load()?, workers).await,
        Command::Aggregate {
            config,
            dashboard,
            json,
        } => aggregate(config.load()?, dashboard, json).await,
        Command::Validate { model } => validate(model),
        Command::Eval { formula, vars } => {
            let bindings: BTreeMap<String, f64> = vars.into_iter().collect();
            let value = montecarlo_core::formula::evaluate(&formula, &bindings)?;
            println!("{}", value);
            Ok(())
        }
    }
}

fn load_model(path: &Path) -> Result<ModelFile> {
    ModelFile::from_path(path).with_context(|| format!("loading model {}", path.display()))
}

/// Shutdown signal fired by Ctrl-C.
fn interrupt_signal() -> Shutdown {
    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, shutting down");
            trigger.trigger();
        }
    });
    shutdown
}

/// Connector for a single-role process.
fn role_connector(config: &PipelineConfig, role: &str) -> Arc<dyn Connector> {
    if config.broker == BrokerKind::Memory {
        warn!(
            role,
            "Using the in-process broker; roles in other processes will not see this one"
        );
    }
    connector_for(config)
}

async fn produce(config: PipelineConfig, model: ModelFile) -> Result<()> {
    let shutdown = interrupt_signal();
    let connector = role_connector(&config, "produce");
    let policy = RetryPolicy::fixed(config.reconnect_delay());
    let broker = connect_with_retry(connector.as_ref(), &policy, &shutdown)
        .await
        .context("connecting to broker")?;

    let mut producer = ScenarioProducer::new(broker, &config);
    let report = producer.run(&model, &shutdown).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn work(config: PipelineConfig, workers: usize) -> Result<()> {
    let shutdown = interrupt_signal();
    let connector = role_connector(&config, "work");

    let base_id = WorkerId::from_process();
    let tasks: Vec<_> = (1..=workers.max(1))
        .map(|n| {
            let id = if workers > 1 {
                base_id.with_suffix(n)
            } else {
                base_id.clone()
            };
            let mut worker = Worker::with_connector(id, Arc::clone(&connector), &config);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let stats = worker.run(&shutdown).await;
                (worker.id().clone(), stats)
            })
        })
        .collect();

    for task in tasks {
        let (id, stats) = task.await?;
        let stats = stats?;
        println!(
            "{}: processed {}, published {}, dropped {}",
            id, stats.processed, stats.published, stats.dropped
        );
    }
    Ok(())
}

async fn aggregate(config: PipelineConfig, dashboard: bool, json: bool) -> Result<()> {
    let shutdown = interrupt_signal();
    let connector = role_connector(&config, "aggregate");

    let mut service = AggregatorService::with_connector(connector, &config).with_sink(Arc::new(TracingSink));
    if dashboard {
        service = service.with_sink(Arc::new(ConsoleDashboard::new(config.top_workers)));
    }
    let report = service.run(&shutdown).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", ConsoleDashboard::new(config.top_workers).render(&report));
    }
    Ok(())
}

async fn run(
    config: PipelineConfig,
    model: ModelFile,
    workers: usize,
    dashboard: bool,
    json: bool,
) -> Result<()> {
    let shutdown = interrupt_signal();

    let mut pipeline = LocalPipeline::new(config.clone(), workers).with_sink(Arc::new(TracingSink));
    if dashboard {
        pipeline = pipeline.with_sink(Arc::new(ConsoleDashboard::new(config.top_workers)));
    }

    info!(
        workers,
        scenarios = model.simulation_count,
        mode = ?config.model_distribution,
        "Starting pipeline"
    );
    let outcome = pipeline.run(&model, &shutdown).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    } else {
        print!(
            "{}",
            ConsoleDashboard::new(config.top_workers).render(&outcome.report)
        );
        println!();
        println!(
            "Generated {} scenarios in {:.2}s, {} dropped",
            outcome.generation.published,
            outcome.generation.elapsed.as_secs_f64(),
            outcome.dropped()
        );
    }
    Ok(())
}

fn validate(path: PathBuf) -> Result<()> {
    let model = ModelFile::from_path(&path)
        .with_context(|| format!("loading model {}", path.display()))?;
    let sampler = ScenarioSampler::new(&model.variables)?;
    let formula = Formula::parse(&model.model_function)
        .with_context(|| format!("parsing formula '{}'", model.model_function))?;

    let unbound: Vec<String> = formula
        .names()
        .into_iter()
        .filter(|name| !model.variables.contains_key(name) && constant(name).is_none())
        .collect();
    if !unbound.is_empty() {
        bail!(
            "formula references undeclared variables: {}",
            unbound.join(", ")
        );
    }

    for (name, distribution) in sampler.variables() {
        println!("  {:<16} {:?}", name, distribution);
    }
    println!(
        "OK: {} variables, {} scenarios",
        model.variables.len(),
        model.simulation_count
    );
    Ok(())
}
