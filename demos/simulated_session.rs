//! Simulated federated session with in-process clients.
//!
//! Honest clients train toward the held-out optimum, label-flipping clients
//! toward its mirror image. Run with `RUST_LOG=fedval=debug` to watch every
//! phase transition and vote.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ndarray::Array1;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fedval::error::FedvalError;
use fedval::session::{JsonFileSink, MemorySink, MetricsSink, RoundOrchestrator, SessionConfig};
use fedval::transport::{
    ClientProperties, FitConfig, FitOutcome, InProcessTransport, LocalClient, ModelCapability,
    ModelEvaluator,
};
use fedval::{Metrics, PoisoningKind, VotePolicy, WeightVector};

const PARAMS: usize = 8;

#[derive(Parser, Debug)]
#[command(name = "simulated_session")]
#[command(about = "Run a federated session over in-process clients")]
struct Args {
    /// Session configuration (TOML); built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Honest clients
    #[arg(long, default_value_t = 7)]
    honest: usize,

    /// Label-flipping clients
    #[arg(long, default_value_t = 3)]
    poisoned: usize,
}

#[derive(Clone, Debug)]
struct Shard {
    target: f32,
    examples: usize,
}

struct LinearModel {
    weights: WeightVector,
}

impl LinearModel {
    fn new() -> Self {
        Self {
            weights: WeightVector::new(vec![Array1::<f32>::zeros(PARAMS).into_dyn()]),
        }
    }
}

impl ModelCapability for LinearModel {
    type Dataset = Shard;

    fn get_weights(&self) -> WeightVector {
        self.weights.clone()
    }

    fn set_weights(&mut self, weights: &WeightVector) -> Result<(), FedvalError> {
        self.weights = weights.clone();
        Ok(())
    }

    // one gradient step per epoch on 0.5 * (w - target)^2
    fn fit(&mut self, data: &Shard, config: &FitConfig) -> Result<FitOutcome, FedvalError> {
        let mut tensors = self.weights.clone().into_tensors();
        for _ in 0..config.epochs {
            for tensor in tensors.iter_mut() {
                tensor.mapv_inplace(|w| w - 0.5 * (w - data.target));
            }
        }
        self.weights = WeightVector::new(tensors);
        let mut metrics = self.evaluate(data)?;
        metrics.insert("round".into(), config.round as f64);
        Ok(FitOutcome {
            num_examples: data.examples,
            metrics,
        })
    }

    fn evaluate(&mut self, data: &Shard) -> Result<Metrics, FedvalError> {
        let tensor = &self.weights.tensors()[0];
        let loss = tensor
            .iter()
            .map(|&w| f64::from(w - data.target).powi(2))
            .sum::<f64>()
            / tensor.len() as f64;
        let mut metrics = Metrics::new();
        metrics.insert("loss".into(), loss);
        metrics.insert("accuracy".into(), 1.0 / (1.0 + loss.sqrt()));
        Ok(metrics)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fedval=info,simulated_session=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = SessionConfig::new(args.honest + args.poisoned, 5, 2);
            config.vote_policy = VotePolicy::FlagDegraders;
            config.startup_timeout_secs = 1;
            config
        }
    };

    let mut transport = InProcessTransport::new();
    for i in 0..args.honest {
        transport.add_client(
            format!("honest-{}", i),
            LocalClient::new(
                ClientProperties::new(PoisoningKind::None),
                LinearModel::new(),
                Shard {
                    target: 1.0,
                    examples: 100 + 10 * i,
                },
            ),
        );
    }
    for i in 0..args.poisoned {
        transport.add_client(
            format!("poisoned-{}", i),
            LocalClient::new(
                ClientProperties::new(PoisoningKind::Label).with_attribute("attack", "label_flip"),
                LinearModel::new(),
                Shard {
                    target: -1.0,
                    examples: 100,
                },
            ),
        );
    }

    let evaluator = ModelEvaluator::new(
        LinearModel::new,
        Shard {
            target: 1.0,
            examples: 1000,
        },
    );
    let initial = LinearModel::new().get_weights();

    let mut sink: Box<dyn MetricsSink> = match &config.metrics_path {
        Some(path) => Box::new(JsonFileSink::create(path)?),
        None => Box::new(MemorySink::new()),
    };

    info!(
        clients = args.honest + args.poisoned,
        rounds = config.rounds,
        "starting simulated session"
    );
    let mut orchestrator =
        RoundOrchestrator::new(config, transport, evaluator, initial, sink.as_mut())?;
    let summary = orchestrator.run()?;

    println!("Rounds completed: {}", summary.rounds_completed);
    println!("Final metrics:    {:?}", summary.final_server_metrics);
    println!("Blacklisted:");
    for client in summary.blacklist.iter() {
        println!(
            "   {} (round {})",
            client,
            summary.blacklist.flagged_in(client).unwrap_or_default()
        );
    }
    Ok(())
}
