use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, select, tick};
use serde::Serialize;

use carnet::config::{load_config, CarnetConfig};
use carnet::error::{CarnetError, StorageError};
use carnet::generation::{DriverSelection, GenerationRequest};
use carnet::telemetry::init_logging;
use carnet::Carnet;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file (defaults apply when omitted)
    #[arg(long, short, env = "CARNET_CONFIG")]
    config: Option<PathBuf>,

    /// Default log filter, overridden by RUST_LOG
    #[arg(long, env = "CARNET_LOG", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "CARNET_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a generation batch and print its session id
    Generate {
        /// Every active driver
        #[arg(
            long,
            conflicts_with = "driver",
            required_unless_present_any = ["driver", "template_change"]
        )]
        all: bool,

        /// Specific driver ids
        #[arg(long, num_args = 1..)]
        driver: Vec<i64>,

        /// Template to render with (must be active); the active one otherwise
        #[arg(long)]
        template: Option<i64>,

        /// Activate --template, then re-render every active driver with it
        #[arg(long, requires = "template", conflicts_with = "driver")]
        template_change: bool,

        /// Owner recorded on the batch
        #[arg(long)]
        owner: Option<String>,
    },

    /// Make a card template the one new batches use
    Activate { template_id: i64 },

    /// Process queued work
    Work {
        /// Drain the queue on this thread and exit
        #[arg(long)]
        once: bool,
    },

    /// Show the progress of a batch
    Status { session_id: String },

    /// List recent batches
    History {
        #[arg(long)]
        owner: Option<String>,

        #[arg(long, default_value = "20")]
        limit: u64,
    },

    /// Write the archive of a completed batch to a file
    Download {
        session_id: String,

        #[arg(long)]
        out: PathBuf,
    },

    /// Apply the archive retention policy
    Prune,

    /// Re-queue expired tasks and fail stalled batches
    Sweep,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level, cli.log_json) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CarnetError> {
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => CarnetConfig::default(),
    };
    let carnet = Carnet::from_config(&config)?;

    match cli.command {
        Command::Generate {
            all,
            driver,
            template,
            template_change,
            owner,
        } => {
            let mut request = match (template_change, template) {
                (true, Some(template_id)) => {
                    carnet.activate_template(template_id)?;
                    GenerationRequest::template_change(template_id)
                }
                _ if !all && driver.len() == 1 => GenerationRequest::single(driver[0]),
                _ if all => GenerationRequest::bulk(DriverSelection::All),
                _ => GenerationRequest::bulk(DriverSelection::Ids(driver)),
            };
            if let Some(template_id) = template {
                request = request.with_template(template_id);
            }
            if let Some(owner) = owner {
                request = request.owned_by(owner);
            }
            let session_id = carnet.start(&request)?;
            print_json(&serde_json::json!({ "session_id": session_id }))
        }
        Command::Activate { template_id } => {
            carnet.activate_template(template_id)?;
            print_json(&serde_json::json!({ "active_template": template_id }))
        }
        Command::Work { once: true } => {
            let reports = carnet.run_until_idle()?;
            print_json(&reports)
        }
        Command::Work { once: false } => work_until_interrupted(&carnet),
        Command::Status { session_id } => print_json(&carnet.status(&session_id)?),
        Command::History { owner, limit } => {
            print_json(&carnet.history(owner.as_deref(), limit)?)
        }
        Command::Download { session_id, out } => {
            let bytes = carnet.download(&session_id)?;
            std::fs::write(&out, &bytes).map_err(|e| StorageError::WriteArchive {
                path: out.clone(),
                source: e,
            })?;
            print_json(&serde_json::json!({
                "session_id": session_id,
                "path": out,
                "bytes": bytes.len(),
            }))
        }
        Command::Prune => print_json(&carnet.prune()),
        Command::Sweep => print_json(&carnet.sweep()?),
    }
}

fn work_until_interrupted(carnet: &Carnet) -> Result<(), CarnetError> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })?;

    let pool = carnet.start_pool();
    let reports = tick(Duration::from_millis(200));

    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(reports) -> _ => {
                while let Some(report) = pool.try_recv_report() {
                    if report.success {
                        log::info!(
                            "Task {} ({}) for batch {} done",
                            report.task_id,
                            report.kind.as_str(),
                            report.session_id
                        );
                    } else {
                        log::warn!(
                            "Task {} ({}) for batch {} failed on attempt {}: {}",
                            report.task_id,
                            report.kind.as_str(),
                            report.session_id,
                            report.attempt,
                            report.error.as_deref().unwrap_or("unknown error")
                        );
                    }
                }
            }
        }
    }

    pool.shutdown();
    pool.wait();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CarnetError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
