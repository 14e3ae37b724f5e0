//! scheduler-worker: run one prompt card's test cases through the
//! test queue manager and stream scheduler events as JSON lines.
//!
//! Test cases are read from a JSON file (an array of test cases). Results
//! are kept in memory and summarised on exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use promptbench_core::config::{load_dotenv, Config};
use promptbench_core::{ConfigOverrides, TestCase};
use promptbench_llm::create_provider;
use promptbench_scheduler::{MemoryStore, SchedulerEvent, TestQueueManager};

// ── CLI ─────────────────────────────────────────────────────────────

/// Resource-aware test runner for LLM prompt cards.
#[derive(Parser, Debug)]
#[command(name = "scheduler-worker", version, about)]
struct Cli {
    /// TOML config file. Falls back to environment variables when omitted.
    #[arg(long, env = "PROMPTBENCH_CONFIG")]
    config: Option<PathBuf>,

    /// JSON file holding an array of test cases.
    #[arg(long)]
    cases: PathBuf,

    /// Prompt card the test cases belong to.
    #[arg(long)]
    card: String,

    /// Model identifier passed to the provider.
    #[arg(long)]
    model: String,

    /// Comma-separated test case ids. Defaults to every case in the file.
    #[arg(long, value_delimiter = ',')]
    ids: Vec<String>,

    /// Job priority (> 5 high, < -5 low).
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    priority: i32,

    #[arg(long)]
    max_concurrent_tests: Option<usize>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long)]
    stop_on_first_failure: bool,

    /// Disable whole-job retries.
    #[arg(long)]
    no_retry: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            max_concurrent_tests: self.max_concurrent_tests,
            timeout_per_test_ms: self.timeout_ms,
            stop_on_first_failure: self.stop_on_first_failure.then_some(true),
            retry_failed_tests: self.no_retry.then_some(false),
            ..Default::default()
        }
    }
}

fn load_cases(path: &PathBuf) -> anyhow::Result<Vec<TestCase>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading test cases from {}", path.display()))?;
    let cases: Vec<TestCase> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    if cases.is_empty() {
        bail!("{} contains no test cases", path.display());
    }
    Ok(cases)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::from_env(),
    };
    config.log_summary();

    let cases = load_cases(&cli.cases)?;
    let ids: Vec<String> = if cli.ids.is_empty() {
        cases.iter().map(|c| c.id.clone()).collect()
    } else {
        cli.ids.clone()
    };
    let store = Arc::new(MemoryStore::new());
    store.insert_test_cases(cases);

    let llm = create_provider(&config.llm, &config.ollama)?;
    info!(provider = llm.name(), model = %cli.model, "Provider ready");

    let manager = TestQueueManager::from_config(&config, llm, store.clone()).build();
    let mut events = manager.subscribe();
    manager.start()?;

    let execution_id = manager
        .queue_test_execution(&cli.card, &ids, &cli.model, cli.overrides(), cli.priority)
        .await?;

    let mut failure = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!(execution_id = %execution_id, "Interrupted, cancelling execution");
                manager.cancel_execution(&execution_id).await?;
                failure = Some("cancelled".to_string());
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if event.execution_id().is_some_and(|id| id != execution_id) {
                        continue;
                    }
                    println!("{}", serde_json::to_string(&event)?);
                    match event {
                        SchedulerEvent::JobCompleted { .. } => break,
                        SchedulerEvent::JobCancelled { .. } => {
                            failure = Some("cancelled".to_string());
                            break;
                        }
                        SchedulerEvent::JobFailed { error, retrying: false, .. } => {
                            failure = Some(error);
                            break;
                        }
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.shutdown().await?;

    let results = store.results_for(&execution_id).unwrap_or_default();
    let passed = results.iter().filter(|r| r.passed).count();
    info!(
        execution_id = %execution_id,
        passed,
        failed = results.len() - passed,
        "Run finished"
    );

    if let Some(reason) = failure {
        bail!("execution {} did not complete: {}", execution_id, reason);
    }
    Ok(())
}
