use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faceverify_core::{load_image, Config, Device, Metric, Verifier, VerifyError, DEFAULT_MODEL};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Parser)]
#[command(name = "faceverify", about = "Decide whether two face images show the same person")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Compute backend: "cpu" or "accelerator"
    #[arg(long, global = true)]
    device: Option<Device>,

    /// Fractional crop margin around detected faces
    #[arg(long, global = true)]
    padding: Option<f32>,

    /// Directory containing the ONNX model files
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare the faces in two images
    Verify {
        first: PathBuf,
        second: PathBuf,
        /// Embedding model ("default" resolves through the config)
        #[arg(short, long, default_value = DEFAULT_MODEL)]
        model: String,
        /// Distance metric (cosine, L1, euclidean, euclidean_l2); defaults to the configured metric
        #[arg(long)]
        metric: Option<String>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// List detected face regions as JSON
    Detect { image: PathBuf },
    /// Show loaded models and their thresholds
    Models,
    /// Verify many pairs from a JSON manifest concurrently
    Batch {
        manifest: PathBuf,
        /// Maximum verifications in flight
        #[arg(short, long, default_value_t = 4)]
        jobs: usize,
    },
}

/// One entry of a batch manifest.
#[derive(Debug, Clone, Deserialize)]
struct PairSpec {
    first: PathBuf,
    second: PathBuf,
    model: Option<String>,
    metric: Option<String>,
}

#[derive(Serialize)]
struct PairOutcome {
    first: PathBuf,
    second: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<faceverify_core::VerificationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli, |key| std::env::var(key).ok())?;
    tracing::debug!(?config, "configuration resolved");

    let verifier = Verifier::from_config(&config).context("failed to initialize verification context")?;

    match cli.command {
        Commands::Verify { first, second, model, metric, json } => {
            let a = load_image(&first)?;
            let b = load_image(&second)?;
            let metric = metric.unwrap_or_else(|| config.metric.clone());

            let result = verifier.verify(&a, &b, &model, &metric).map_err(describe)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "match: {}  distance: {:.4}  threshold: {:.4}  model: {}  metric: {}",
                    if result.matched { "yes" } else { "no" },
                    result.distance,
                    result.threshold,
                    result.model_id,
                    result.metric,
                );
                if result.metric_fallback {
                    println!("note: metric '{}' is not supported, used euclidean", result.requested_metric);
                }
            }
        }
        Commands::Detect { image } => {
            let img = load_image(&image)?;
            let faces = verifier.detect(&img)?;
            println!("{}", serde_json::to_string_pretty(&faces)?);
        }
        Commands::Models => {
            let models = verifier.models();
            for id in models.ids() {
                let descriptor = models.get(id)?.descriptor();
                let marker = if id == models.default_id() { " (default)" } else { "" };
                println!(
                    "{id}{marker}: {}x{} input, {}-d, {:?} alignment, device {}",
                    descriptor.input.width,
                    descriptor.input.height,
                    descriptor.embedding_dim,
                    descriptor.input.alignment,
                    descriptor.device,
                );
                for (metric, threshold) in verifier.thresholds().for_model(id) {
                    println!("    {metric:<13} < {threshold}");
                }
            }
        }
        Commands::Batch { manifest, jobs } => {
            let pairs = read_manifest(&manifest)?;
            run_batch(Arc::new(verifier), pairs, jobs.max(1), config.metric.clone()).await?;
        }
    }

    Ok(())
}

/// Config file / environment, then command-line flags on top.
fn build_config(cli: &Cli, env: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let mut config = Config::load_with(cli.config.as_deref(), env)?;
    if let Some(device) = cli.device {
        config.device = device;
    }
    if let Some(padding) = cli.padding {
        config.padding = padding;
    }
    if let Some(dir) = &cli.model_dir {
        config.model_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Attach the failing stage to a verification error.
fn describe(err: VerifyError) -> anyhow::Error {
    let stage = err.stage();
    anyhow::Error::new(err).context(format!("verification failed at {stage} stage"))
}

fn read_manifest(path: &Path) -> Result<Vec<PairSpec>> {
    let src = std::fs::read_to_string(path).with_context(|| format!("failed to read manifest {}", path.display()))?;
    serde_json::from_str(&src).with_context(|| format!("malformed manifest {}", path.display()))
}

/// Verify every pair on blocking workers, at most `jobs` at a time, printing
/// one JSON line per pair in manifest order.
async fn run_batch(verifier: Arc<Verifier>, pairs: Vec<PairSpec>, jobs: usize, default_metric: String) -> Result<()> {
    let permits = Arc::new(Semaphore::new(jobs));
    tracing::info!(pairs = pairs.len(), jobs, "batch verification started");

    let mut handles = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let verifier = Arc::clone(&verifier);
        let permits = Arc::clone(&permits);
        let default_metric = default_metric.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permits.acquire_owned().await?;
            let outcome = tokio::task::spawn_blocking(move || verify_pair(&verifier, pair, &default_metric)).await?;
            anyhow::Ok(outcome)
        }));
    }

    let mut matched = 0usize;
    let mut failed = 0usize;
    for handle in handles {
        let outcome = handle.await??;
        match &outcome.result {
            Some(r) if r.matched => matched += 1,
            Some(_) => {}
            None => failed += 1,
        }
        println!("{}", serde_json::to_string(&outcome)?);
    }

    tracing::info!(matched, failed, "batch verification finished");
    Ok(())
}

fn verify_pair(verifier: &Verifier, pair: PairSpec, default_metric: &str) -> PairOutcome {
    let model = pair.model.as_deref().unwrap_or(DEFAULT_MODEL);
    let metric = pair.metric.as_deref().unwrap_or(default_metric);

    let images = load_image(&pair.first).and_then(|a| Ok((a, load_image(&pair.second)?)));
    let (result, error, stage) = match images {
        Err(e) => (None, Some(e.to_string()), Some("decode".to_string())),
        Ok((a, b)) => match verifier.verify(&a, &b, model, metric) {
            Ok(result) => (Some(result), None, None),
            Err(e) => {
                tracing::warn!(first = %pair.first.display(), error = %e, "pair failed");
                (None, Some(e.to_string()), Some(e.stage().to_string()))
            }
        },
    };

    PairOutcome { first: pair.first, second: pair.second, result, error, stage }
}
