//! Incident signal service: binary entrypoint.
//!
//! `incident-signals`                 run the scheduler + ops HTTP server
//! `incident-signals run-once`        one pipeline run over the spool, then exit
//! `incident-signals subscribe <id>`  add or reactivate a destination
//! `incident-signals unsubscribe <id>`

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use incident_signals::broadcast::TelegramMessenger;
use incident_signals::classifier::{shared_breaker, ClassifierBackend, HttpBackend};
use incident_signals::metrics::Metrics;
use incident_signals::ops::{self, OpsState};
use incident_signals::source::{ItemSource, SpoolSource};
use incident_signals::{
    init_tracing, Deployment, Pipeline, PipelineConfig, RunOutcome, SignalStore, SqliteStore,
};

fn open_store(dep: &Deployment) -> Result<Arc<dyn SignalStore>> {
    if let Some(parent) = Path::new(&dep.database_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let store = SqliteStore::open(&dep.database_path)
        .with_context(|| format!("opening database {}", dep.database_path))?;
    Ok(Arc::new(store))
}

async fn run_once(pipeline: &Pipeline, sources: &[Arc<dyn ItemSource>]) {
    match pipeline.run_sources(sources).await {
        Ok(RunOutcome::Skipped) => {}
        Ok(RunOutcome::Completed(r)) => tracing::info!(
            signals = r.signals.len(),
            processed = r.processed,
            "pipeline run completed"
        ),
        // Store failures abort the run; the next tick retries.
        Err(e) => tracing::error!(error = %e, "pipeline run failed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when the file is absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cfg = PipelineConfig::load()?;
    let dep = Deployment::from_env();
    let store = open_store(&dep)?;

    match args.first().map(String::as_str) {
        Some("subscribe") => {
            let id = args.get(1).context("usage: subscribe <destination-id>")?;
            store.activate_subscriber(id)?;
            tracing::info!(dest = %id, "subscriber active");
            return Ok(());
        }
        Some("unsubscribe") => {
            let id = args.get(1).context("usage: unsubscribe <destination-id>")?;
            store.deactivate_subscriber(id)?;
            tracing::info!(dest = %id, "subscriber deactivated");
            return Ok(());
        }
        Some("run-once") | None => {}
        Some(other) => bail!("unknown command `{other}`"),
    }

    let api_key = dep
        .classifier_api_key
        .clone()
        .context("CLASSIFIER_API_KEY is not set")?;
    let http_backend = |model: &str| -> Result<Arc<dyn ClassifierBackend>> {
        let backend: Arc<dyn ClassifierBackend> = Arc::new(HttpBackend::new(
            &dep.classifier_base_url,
            &api_key,
            model,
            Duration::from_secs(cfg.classifier.timeout_secs),
        )?);
        Ok(backend)
    };
    let backend = http_backend(&dep.classifier_model)?;
    let fallbacks = cfg
        .classifier
        .fallback_models
        .iter()
        .map(|m| http_backend(m))
        .collect::<Result<Vec<_>>>()?;
    let token = dep
        .telegram_bot_token
        .clone()
        .context("TELEGRAM_BOT_TOKEN is not set")?;
    let messenger = Arc::new(TelegramMessenger::new(&token)?);
    let breaker = shared_breaker(cfg.breaker.failure_threshold, cfg.breaker.cooldown_secs);

    let run_once_only = args.first().map(String::as_str) == Some("run-once");

    // The recorder goes in before anything describes or records a series.
    let metrics = if run_once_only {
        None
    } else {
        match Metrics::init() {
            Ok(m) => Some(m.handle),
            Err(e) => {
                tracing::warn!(error = ?e, "metrics disabled");
                None
            }
        }
    };

    let pipeline = Pipeline::with_fallbacks(
        cfg.clone(),
        store.clone(),
        backend,
        fallbacks,
        breaker.clone(),
        messenger,
    )?;
    let sources: Vec<Arc<dyn ItemSource>> = vec![Arc::new(SpoolSource::new(&dep.spool_path))];

    if run_once_only {
        run_once(&pipeline, &sources).await;
        return Ok(());
    }
    let ops_state = OpsState {
        store: store.clone(),
        breaker,
        quota: pipeline.quota().clone(),
        metrics,
    };
    let listener = tokio::net::TcpListener::bind(&dep.ops_addr)
        .await
        .with_context(|| format!("binding ops server on {}", dep.ops_addr))?;
    tracing::info!(addr = %dep.ops_addr, "ops server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, ops::router(ops_state)).await {
            tracing::error!(error = %e, "ops server stopped");
        }
    });

    let period = Duration::from_secs(cfg.schedule.interval_minutes.max(1) * 60);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        // Dropping the run future on shutdown aborts workers and releases the lock.
        tokio::select! {
            _ = run_once(&pipeline, &sources) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown requested during run, cancelling");
                break;
            }
        }
    }

    tracing::info!("shutting down");
    Ok(())
}
