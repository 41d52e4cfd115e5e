use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use spindle_core::{
    EventFilter, EventKind, InProcess, JobContext, JobOptions, LifecycleEvent, Listener,
    ListenerError, ProcessError, Processor, QueueBuilder, QueueConfig, Sandboxed,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    InProcess,
    Sandboxed,
    Both,
}

/// Runs the unrecoverable-failure scenario: one job, several attempts, a
/// processor that always gives up for good.
#[derive(Parser, Debug)]
#[command(name = "spindle", version, about = "Retry core demo for the spindle job queue")]
struct Cli {
    /// Queue config (JSON). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Mode::Both)]
    mode: Mode,

    /// Attempts budget for the demo job.
    #[arg(long, default_value_t = 4)]
    attempts: u32,

    /// How long to wait for the job to settle.
    #[arg(long, default_value_t = 2000)]
    settle_ms: u64,
}

#[derive(Debug, Deserialize)]
struct DemoPayload {
    foo: String,
}

/// Prints every event it receives.
struct PrintListener {
    label: &'static str,
}

#[async_trait]
impl Listener for PrintListener {
    async fn on_event(&self, event: &LifecycleEvent) -> Result<(), ListenerError> {
        let line = serde_json::to_string(event).map_err(|e| ListenerError::new(e.to_string()))?;
        println!("[{}] {line}", self.label);
        Ok(())
    }
}

fn unrecoverable_processor(message: &'static str) -> impl Processor + 'static {
    InProcess::new(move |job: JobContext| async move {
        let payload: DemoPayload = serde_json::from_value(job.payload)
            .map_err(|e| ProcessError::failed(format!("json decode: {e}")))?;
        tracing::debug!(foo = %payload.foo, attempt = job.attempts_made + 1, "processing");
        Err::<serde_json::Value, _>(ProcessError::unrecoverable(message))
    })
}

async fn run_scenario(
    config: &QueueConfig,
    label: &'static str,
    processor: Arc<dyn Processor>,
    attempts: u32,
    settle: Duration,
) -> anyhow::Result<()> {
    // (A) Queue と listener を用意
    let queue = QueueBuilder::new(label).config(config.clone()).build()?;
    queue
        .events()
        .subscribe(PrintListener { label }, EventFilter::all().queue(label));
    let (_, mut done) = queue.events().subscribe_channel(EventFilter::kinds([
        EventKind::Completed,
        EventKind::RetriesExhausted,
    ]));

    // (B) worker と scheduler を起動
    let worker = queue.worker_with(processor);
    let scheduler = queue.scheduler().spawn(config.stalled_interval());

    // (C) ジョブ投入
    let job = queue
        .add(
            "test",
            serde_json::json!({"foo": "bar"}),
            JobOptions::default()
                .attempts(attempts)
                .remove_on_complete(10)
                .remove_on_fail(10),
        )
        .await?;

    // (D) 終了を待つ
    match tokio::time::timeout(settle, done.recv()).await {
        Ok(Some(event)) => tracing::info!(queue = label, event = ?event.kind(), "job settled"),
        Ok(None) => anyhow::bail!("notifier closed before the job settled"),
        Err(_) => tracing::warn!(queue = label, "job did not settle in time"),
    }

    worker.shutdown().await;
    scheduler.close().await;

    let record = queue
        .get_job(job.id)
        .await?
        .context("job vanished from the store")?;
    println!(
        "[{label}] final: state={} attempts_made={}/{} unrecoverable={} reason={:?}",
        record.state,
        record.attempts_made,
        record.max_attempts,
        record.unrecoverable,
        record.failed_reason.as_deref().unwrap_or(""),
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing (respects RUST_LOG, default info)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => QueueConfig::from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => QueueConfig::default(),
    };
    let settle = Duration::from_millis(cli.settle_ms);

    if matches!(cli.mode, Mode::InProcess | Mode::Both) {
        let processor = Arc::new(unrecoverable_processor("standard processor"));
        run_scenario(&config, "standard", processor, cli.attempts, settle).await?;
    }

    if matches!(cli.mode, Mode::Sandboxed | Mode::Both) {
        let sandbox = Sandboxed::spawn(unrecoverable_processor("sandboxed processor"))
            .context("starting sandbox executor")?;
        run_scenario(&config, "sandboxed", Arc::new(sandbox), cli.attempts, settle).await?;
    }

    Ok(())
}
