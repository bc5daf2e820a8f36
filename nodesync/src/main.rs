mod app;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use nodesync_cluster::HandlerResponse;
use nodesync_core::{bootstrap::load_config, logging, models::InstanceId};

use app::App;

/// Exit status of `drift` when any instance disagrees with the cluster
const EXIT_DRIFT: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "nodesync")]
#[command(about = "Keeps cluster nodes and scrape targets in step with fleet lifecycle events", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short, env = "NODESYNC_CONFIG_PATH", global = true)]
    config: Option<String>,

    /// Look up instances but only record cluster and target changes
    #[arg(long, env = "NODESYNC_DRY_RUN", global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Handle lifecycle notifications, one JSON document per line
    Handle {
        /// Read notifications from a file instead of stdin
        #[arg(long, short)]
        input: Option<PathBuf>,
    },
    /// Compare instance lifecycle state with cluster node status
    Drift {
        #[arg(required = true)]
        instance_ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref())?;
    logging::init_logging(&config.logging)?;
    info!(dry_run = args.dry_run, "nodesync starting");

    let app = App::build(&config, args.dry_run);

    let code = match args.command {
        Command::Handle { input } => handle_events(&app, input).await?,
        Command::Drift { instance_ids } => report_drift(&app, instance_ids).await?,
    };

    app.report_dry_run();
    Ok(code)
}

async fn open_input(input: Option<PathBuf>) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    Ok(match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    })
}

/// Totals across one `handle` run
#[derive(Default)]
struct Summary {
    handled: usize,
    redelivery: usize,
}

impl Summary {
    fn emit(&mut self, response: &HandlerResponse) -> Result<()> {
        self.handled += 1;
        if response.requests_redelivery() {
            self.redelivery += 1;
        }
        println!("{}", serde_json::to_string(response)?);
        Ok(())
    }
}

/// Handle every input line on its own task, printing responses as they finish
async fn handle_events(app: &App, input: Option<PathBuf>) -> Result<ExitCode> {
    let mut lines = open_input(input).await?.lines();
    let mut tasks = JoinSet::new();
    let mut summary = Summary::default();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("failed to read notification input")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    let handler = app.handler.clone();
                    tasks.spawn(async move { handler.handle_str(&line).await });
                }
                None => break,
            },
            Some(joined) = tasks.join_next() => {
                summary.emit(&joined.context("event task panicked")?)?;
            }
            _ = &mut shutdown => {
                warn!(in_flight = tasks.len(), "Interrupted, finishing in-flight events");
                break;
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        summary.emit(&joined.context("event task panicked")?)?;
    }

    info!(
        handled = summary.handled,
        redelivery = summary.redelivery,
        "Finished handling notifications"
    );
    Ok(if summary.redelivery > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn report_drift(app: &App, instance_ids: Vec<String>) -> Result<ExitCode> {
    let mut failed = false;
    let mut drifted = false;

    for id in instance_ids {
        let instance_id = InstanceId::from(id);
        match app.reconciler.detect_drift(&instance_id).await {
            Ok(report) => {
                drifted |= report.has_drift();
                println!("{}", serde_json::to_string(&report)?);
            }
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Drift check failed");
                failed = true;
            }
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else if drifted {
        ExitCode::from(EXIT_DRIFT)
    } else {
        ExitCode::SUCCESS
    })
}
