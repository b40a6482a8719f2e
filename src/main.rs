mod admission;
mod ami;
mod call;
mod config;
mod dialog;
mod directory;
mod error;
mod frame;
mod intent;
mod llm;
mod metrics;
mod phrase_cache;
mod prompts;
mod recorder;
mod resampler;
mod sanitize;
mod stt;
mod ticket;
mod timeout_monitor;
mod tts;

use admission::Admission;
use call::CallDeps;
use config::Config;
use directory::PgDirectory;
use llm::GroqLlmClient;
use metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{ error, info, warn };

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber
        ::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter
                ::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    let config = Config::parse();

    let missing = config.missing_required();
    if !missing.is_empty() {
        error!(missing = ?missing, "required configuration missing, refusing to start");
        anyhow::bail!("missing required configuration: {}", missing.join(", "));
    }

    info!(
        listen = config.audiosocket_addr(),
        metrics = config.metrics_addr(),
        max_calls = config.max_concurrent_calls,
        resampler_workers = config.resolved_pool_workers(),
        "voicebot-core starting"
    );

    let phrase_cache = phrase_cache::PhraseCache::load(&config.phrase_cache_dir, config.dynamic_cache_max_size).await;
    let resampler = resampler::ResamplerPool::spawn(config.resolved_pool_workers());
    let metrics = Metrics::new();
    let admission = Admission::new(config.max_concurrent_calls as i64);
    let prompts = Arc::new(prompts::load(&config.prompts_file).await);

    let directory: Arc<dyn directory::Directory> = Arc::new(
        PgDirectory::connect(
            &config.db_clients_dsn,
            &config.db_tickets_dsn,
            config.db_pool_min,
            config.db_pool_max
        ).await?
    );

    let llm: Arc<dyn llm::LlmClient> = Arc::new(
        GroqLlmClient::new(config.groq_url.clone(), config.groq_api_key.clone(), config.groq_model.clone())
            .with_deadline(Duration::from_secs(config.llm_deadline_secs))
    );

    let config = Arc::new(config);
    let deps = CallDeps {
        config: config.clone(),
        phrase_cache,
        resampler,
        directory,
        llm,
        metrics: metrics.clone(),
        prompts,
    };

    let metrics_handle = metrics::start_metrics_server(&config.metrics_addr(), metrics.clone()).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let accept_addr = config.audiosocket_addr();
    let accept_metrics = metrics.clone();
    let spawn_deps = deps.clone();
    let accept_handle = tokio::spawn(async move {
        admission::run_accept_loop(&accept_addr, admission, accept_metrics, shutdown_rx, move |stream, call_id| {
            let deps = spawn_deps.clone();
            async move {
                call::run_call(stream, call_id, deps).await;
            }
        }).await
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining in-flight calls");
    let _ = shutdown_tx.send(true);

    if let Err(e) = accept_handle.await? {
        warn!(error = %e, "admission accept loop exited with error");
    }

    metrics_handle.abort();
    info!("voicebot-core stopped");

    Ok(())
}
