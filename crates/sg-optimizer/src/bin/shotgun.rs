use anyhow::Context;
use sg_optimizer::{benchmark_registry, Optimizer, SearchSpace};
use sg_types::OptimizerConfig;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn env_f64(name: &str, default: f64) -> anyhow::Result<f64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = match std::env::var("SHOTGUN_CONFIG") {
        Ok(path) => OptimizerConfig::from_json_file(&path)
            .with_context(|| format!("failed to load config from {path}"))?
            .apply_env()?,
        Err(_) => OptimizerConfig::from_env()?,
    };

    let name = std::env::var("SHOTGUN_EVALUATOR").unwrap_or_else(|_| "two_peak".to_string());
    let registry = benchmark_registry()?;
    let evaluator = registry
        .create(&name, None)
        .with_context(|| format!("available evaluators: {}", registry.names().join(", ")))?;

    let low = env_f64("SHOTGUN_LOWER_BOUND", -3.0)?;
    let high = env_f64("SHOTGUN_UPPER_BOUND", 3.0)?;
    let space = SearchSpace::uniform(evaluator.input_keys(), low, high);

    info!(evaluator = %name, climbers = config.num_shotgun_climbers, "starting shotgun run");

    let optimizer = Arc::new(Optimizer::new(config, space));
    let cancel = optimizer.cancel_signal().clone();
    let mut run = {
        let optimizer = Arc::clone(&optimizer);
        tokio::task::spawn_blocking(move || optimizer.run(evaluator))
    };

    let report = tokio::select! {
        finished = &mut run => finished??,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, cancelling run");
            cancel.cancel();
            run.await??
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
