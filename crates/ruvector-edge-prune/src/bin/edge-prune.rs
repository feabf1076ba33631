//! edge-prune - learn a sparse edge circuit for a frozen transformer
//!
//! ## Commands
//!
//! - `edge-prune train` - train an edge mask (random toy model unless weights are given)
//! - `edge-prune edges` - print the edge table of a geometry
//! - `edge-prune config` - write a default pruning config as JSON

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ruvector_edge_prune::edges::EdgeKind;
use ruvector_edge_prune::prelude::*;
use ruvector_edge_prune::{MultiComponentMaskSampler, SingleComponentMaskSampler};

/// Differentiable edge pruning for circuit discovery
#[derive(Parser)]
#[command(name = "edge-prune")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SamplerKind {
    /// Learned hard-concrete gates
    HardConcrete,
    /// One ablated head per sample
    SingleComponent,
    /// Random head subsets with noise
    MultiComponent,
}

#[derive(Subcommand)]
enum Commands {
    /// Train an edge mask
    Train {
        /// Model architecture as JSON (defaults to the toy model)
        #[arg(long)]
        model_config: Option<PathBuf>,

        /// Model weights (safetensors, TransformerLens names); random if omitted
        #[arg(long)]
        weights: Vec<PathBuf>,

        /// Pruning config as JSON (defaults derived from the model geometry)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Run directory
        #[arg(short, long, env = "EDGE_PRUNE_FOLDER")]
        folder: Option<PathBuf>,

        /// Sparsity penalty override
        #[arg(long)]
        lamb: Option<f64>,

        /// Step cap override
        #[arg(long)]
        max_steps: Option<usize>,

        /// Prompt length of the synthetic task
        #[arg(long, default_value_t = 8)]
        seq_len: usize,

        /// Random seed
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Initialise modal values with batch-mean activations
        #[arg(long)]
        mean_ablation: bool,

        /// Run the reference pass as an extra slice of the patched batch
        #[arg(long)]
        parallel_inference: bool,

        /// Mask sampler
        #[arg(long, value_enum, default_value = "hard-concrete")]
        sampler: SamplerKind,

        /// Gate-on probability threshold for the reported circuit
        #[arg(long, default_value_t = 0.5)]
        threshold: f32,
    },

    /// Print the edge table of a geometry
    Edges {
        /// Number of layers
        #[arg(long, default_value_t = 12)]
        layers: usize,

        /// Heads per layer
        #[arg(long, default_value_t = 12)]
        heads: usize,
    },

    /// Write a default pruning config
    Config {
        /// Number of layers
        #[arg(long, default_value_t = 12)]
        layers: usize,

        /// Heads per layer
        #[arg(long, default_value_t = 12)]
        heads: usize,

        /// Output path (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Train {
            model_config,
            weights,
            config,
            folder,
            lamb,
            max_steps,
            seq_len,
            seed,
            mean_ablation,
            parallel_inference,
            sampler,
            threshold,
        } => {
            let mut ctx = ExecContext::cpu(seed);
            let model_cfg = match model_config {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str(&text).context("parsing model config")?
                }
                None => TransformerConfig::toy(),
            };
            let model = if weights.is_empty() {
                tracing::warn!("no weights given, using a randomly initialised model");
                CircuitTransformer::random(model_cfg, 0.02, &mut ctx)?
            } else {
                CircuitTransformer::load_safetensors(model_cfg, &weights, &ctx)?
            };

            let geometry = model.config().geometry();
            let mut cfg = match config {
                Some(path) => PruningConfig::from_json_file(&path)?,
                None => PruningConfig::for_geometry(geometry),
            };
            if let Some(folder) = folder {
                cfg.folder = folder;
            }
            if let Some(lamb) = lamb {
                cfg.lamb = lamb;
            }
            if let Some(max_steps) = max_steps {
                cfg.max_steps = max_steps;
            }
            if parallel_inference {
                cfg.parallel_inference = true;
            }
            if let SamplerKind::SingleComponent = sampler {
                cfg.n_samples = geometry.total_heads();
            }
            cfg.validate()?;

            let mut task = SyntheticTask::new(
                cfg.batch_size,
                seq_len,
                model.config().d_vocab,
                seed.wrapping_add(1),
                ctx.device.clone(),
            )?;
            let layout = EdgeLayout::new(geometry);
            let patcher = if mean_ablation {
                let sample = task.next_batch()?;
                let (attn, mlp) =
                    EdgePatcher::estimate_modes(&model, &sample.tokens, cfg.cache_compressed_attn)?;
                EdgePatcher::with_modes(&model, layout.clone(), &cfg, &attn, &mlp)?
            } else {
                EdgePatcher::new(&model, layout.clone(), &cfg)?
            };

            match sampler {
                SamplerKind::HardConcrete => {
                    let sampler = HardConcreteSampler::new(layout, &cfg, &ctx)?;
                    let mut trainer = CircuitTrainer::new(&model, sampler, patcher, cfg, ctx)?;
                    let summary = trainer.train(task)?;
                    let circuit = trainer.sampler().circuit(threshold)?;
                    println!(
                        "steps: {}  halted early: {}  final kl: {:.5}",
                        summary.steps,
                        summary.halted_early,
                        summary.final_kl.unwrap_or(f64::NAN)
                    );
                    println!("circuit: {} of {} edges", circuit.len(), trainer.patcher().layout().n_edges());
                    for edge in circuit {
                        println!("  {:?}: {:?} -> {:?}", edge.edge_type, edge.source, edge.destination);
                    }
                }
                SamplerKind::SingleComponent => {
                    let sampler = SingleComponentMaskSampler::new(&layout, &cfg, &ctx)?;
                    let mut trainer = CircuitTrainer::new(&model, sampler, patcher, cfg, ctx)?;
                    report(trainer.train(task)?);
                }
                SamplerKind::MultiComponent => {
                    let sampler = MultiComponentMaskSampler::new(
                        layout,
                        &cfg,
                        MultiComponentMaskSampler::DEFAULT_PROP,
                        &ctx,
                    )?;
                    let mut trainer = CircuitTrainer::new(&model, sampler, patcher, cfg, ctx)?;
                    report(trainer.train(task)?);
                }
            }
        }

        Commands::Edges { layers, heads } => {
            let layout = EdgeLayout::new(ModelGeometry::new(layers, heads));
            println!("{} edges ({layers} layers x {heads} heads)", layout.n_edges());
            for kind in EdgeKind::ALL {
                let count: usize = layout
                    .groups()
                    .iter()
                    .filter(|g| g.kind == kind)
                    .map(|g| g.len())
                    .sum();
                println!("  {kind:?}: {count}");
            }
        }

        Commands::Config {
            layers,
            heads,
            output,
        } => {
            let cfg = PruningConfig::for_geometry(ModelGeometry::new(layers, heads));
            let json = serde_json::to_string_pretty(&cfg)?;
            match output {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{json}"),
            }
        }
    }

    Ok(())
}

fn report(summary: ruvector_edge_prune::TrainSummary) {
    println!(
        "steps: {}  final kl: {:.5}",
        summary.steps,
        summary.final_kl.unwrap_or(f64::NAN)
    );
}
