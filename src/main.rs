use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;

use rusty_ota::app::OtaApp;
use rusty_ota::config::Settings;
use rusty_ota::delay::{DelayCondition, DelayConditionKind};
use rusty_ota::integrity::{digest_directory, digest_file};
use rusty_ota::lifecycle::EndpointKind;
use rusty_ota::observability::{emit_event, ObservabilityGuard};
use rusty_ota::update_check::{UpdateCheckResponse, UpdateDecision};
use rusty_ota::watchdog::WatchdogState;

const PENDING_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "rusty-ota")]
#[command(about = "Over-the-air web bundle lifecycle engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate runtime config and key material.
    Doctor,
    /// Print event queue and telemetry counters.
    Stats,
    /// List known bundles, builtin first.
    List {
        /// Include bundles whose files are missing on disk.
        #[arg(long, default_value_t = false)]
        raw: bool,
    },
    /// Show the current bundle.
    Current,
    /// Queue a bundle for the next launch.
    Next { id: String },
    /// Activate a bundle immediately.
    Set { id: String },
    /// Delete a bundle that is neither current nor queued.
    Delete { id: String },
    /// Mark a bundle as failed (requires RUSTY_OTA_ALLOW_MANUAL_BUNDLE_ERROR).
    MarkError { id: String },
    /// Return to the builtin bundle, or to the last successful one.
    Reset {
        #[arg(long, default_value_t = false)]
        last_successful: bool,
    },
    /// Print and clear the last failed update.
    FailedUpdate,
    /// Remove failed bundles and orphaned bundle directories.
    Cleanup,
    /// Register an already extracted bundle directory.
    Import {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        version: String,
        #[arg(long)]
        checksum: Option<String>,
        /// `iv:encryptedKey` pair the bundle files and checksum are encrypted under.
        #[arg(long)]
        session_key: Option<String>,
    },
    /// Print the SHA-256 digest of a file or bundle directory.
    Digest { path: PathBuf },
    /// Classify an update-check response body.
    Evaluate {
        #[arg(long)]
        file: PathBuf,
    },
    /// Print the device identifier.
    DeviceId,
    /// Show or change the stored custom id.
    CustomId {
        #[arg(long)]
        set: Option<String>,
        #[arg(long, default_value_t = false)]
        clear: bool,
    },
    /// Show or change the update channel.
    Channel {
        #[arg(long)]
        set: Option<String>,
        #[arg(long, default_value_t = false)]
        clear: bool,
    },
    /// Show resolved endpoints, or override one (requires RUSTY_OTA_ALLOW_MODIFY_URL).
    Endpoints {
        #[arg(long, value_enum)]
        kind: Option<EndpointArg>,
        #[arg(long)]
        value: Option<String>,
    },
    /// Manage delay conditions for the queued bundle.
    Delay {
        #[command(subcommand)]
        command: DelayCommands,
    },
    /// Apply any pending update, arm the readiness watchdog and read
    /// `ready`/`background`/`foreground`/`exit` lines from stdin.
    Launch,
}

#[derive(Subcommand, Debug)]
enum DelayCommands {
    /// Replace the stored delay conditions.
    Set {
        #[arg(long, default_value_t = false)]
        background: bool,
        /// Minimum continuous background time in milliseconds.
        #[arg(long)]
        background_ms: Option<u64>,
        #[arg(long, default_value_t = false)]
        kill: bool,
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        native_version: Option<String>,
    },
    /// Remove all delay conditions.
    Cancel,
    /// Print the stored delay conditions.
    Show,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EndpointArg {
    Update,
    Stats,
    Channel,
    AppId,
}

impl From<EndpointArg> for EndpointKind {
    fn from(value: EndpointArg) -> Self {
        match value {
            EndpointArg::Update => EndpointKind::Update,
            EndpointArg::Stats => EndpointKind::Stats,
            EndpointArg::Channel => EndpointKind::Channel,
            EndpointArg::AppId => EndpointKind::AppId,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load()?;
    let _observability = ObservabilityGuard::init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed building tokio runtime")?;
    runtime.block_on(run(cli.command.unwrap_or(Commands::Doctor), settings))
}

async fn run(command: Commands, settings: Settings) -> Result<()> {
    let mut app = OtaApp::new(settings)?;
    let manager = Arc::clone(app.manager());

    match command {
        Commands::Doctor => {
            let report = app.doctor();
            println!("Rusty OTA Doctor");
            println!("data_dir: {}", report.data_dir.display());
            println!("builtin_dir: {}", report.builtin_dir.display());
            println!("manifest_file: {}", report.manifest_file.display());
            println!("telemetry_file: {}", report.telemetry_file.display());
            println!("app_ready_timeout_ms: {}", report.app_ready_timeout_ms);
            println!("host_version: {}", report.host_version);
            println!("auto_delete_previous: {}", report.auto_delete_previous);
            println!("auto_delete_failed: {}", report.auto_delete_failed);
            println!(
                "allow_manual_bundle_error: {}",
                report.allow_manual_bundle_error
            );
            println!("require_checksum: {}", report.require_checksum);
            println!("public_key_loaded: {}", report.public_key_loaded);
            println!("device_key_loaded: {}", report.device_key_loaded);
            println!("allow_modify_url: {}", report.allow_modify_url);
            println!(
                "default_channel: {}",
                report
                    .default_channel
                    .unwrap_or_else(|| "<unset>".to_string())
            );
            if report.warnings.is_empty() {
                println!("status: ok");
            } else {
                println!("status: warning");
                for warning in report.warnings {
                    println!("- {}", warning);
                }
            }
        }
        Commands::Stats => println!("{}", app.stats_json()?),
        Commands::List { raw } => print_json(&manager.list(raw).await)?,
        Commands::Current => print_json(&manager.current().await)?,
        Commands::Next { id } => print_json(&app.next_bundle(&id).await?)?,
        Commands::Set { id } => {
            let activation = app.set_bundle(&id).await?;
            print_json(&json!({
                "current": activation.bundle,
                "previous_id": activation.previous_id,
            }))?;
        }
        Commands::Delete { id } => {
            app.delete_bundle(&id).await?;
            print_json(&json!({ "deleted": id }))?;
        }
        Commands::MarkError { id } => print_json(&manager.set_bundle_error(&id).await?)?,
        Commands::Reset { last_successful } => print_json(&app.reset(last_successful).await?)?,
        Commands::FailedUpdate => print_json(&manager.get_failed_update().await?)?,
        Commands::Cleanup => {
            let report = app.cleanup().await;
            print_json(&json!({
                "deleted_failed": report.deleted_failed,
                "removed_orphans": report.removed_orphans,
            }))?;
        }
        Commands::Import {
            dir,
            version,
            checksum,
            session_key,
        } => {
            let bundle = match session_key {
                Some(session_key) => {
                    app.import_encrypted_directory(&dir, &version, checksum, &session_key).await?
                }
                None => app.import_directory(&dir, &version, checksum).await?,
            };
            print_json(&bundle)?;
        }
        Commands::Digest { path } => {
            let digest = if path.is_dir() {
                digest_directory(&path)
            } else {
                digest_file(&path)
            }
            .with_context(|| format!("failed hashing {}", path.display()))?;
            println!("{}", digest);
        }
        Commands::Evaluate { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed reading {}", file.display()))?;
            let response = UpdateCheckResponse::from_json(&raw)
                .with_context(|| format!("failed decoding {}", file.display()))?;
            let decision = app.evaluate_update_response(&response).await;
            print_json(&decision_json(&decision))?;
            print_json(&app.drain_events())?;
        }
        Commands::DeviceId => println!("{}", manager.device_id().await),
        Commands::CustomId { set, clear } => {
            if clear || set.is_some() {
                manager.set_custom_id(set).await?;
            }
            print_json(&json!({ "custom_id": manager.custom_id().await }))?;
        }
        Commands::Channel { set, clear } => {
            if clear || set.is_some() {
                manager.set_channel(set).await?;
            }
            print_json(&json!({ "channel": manager.channel().await }))?;
        }
        Commands::Endpoints { kind, value } => {
            if let Some(kind) = kind {
                manager.set_endpoint(kind.into(), value).await?;
            }
            print_json(&app.endpoints().await)?;
        }
        Commands::Delay { command } => match command {
            DelayCommands::Set {
                background,
                background_ms,
                kill,
                date,
                native_version,
            } => {
                let mut conditions = Vec::new();
                if background || background_ms.is_some() {
                    let value = background_ms.map(|ms| ms.to_string());
                    conditions.push(DelayCondition::new(
                        DelayConditionKind::Background,
                        value.as_deref(),
                    ));
                }
                if kill {
                    conditions.push(DelayCondition::new(DelayConditionKind::Kill, None));
                }
                if let Some(date) = date.as_deref() {
                    conditions.push(DelayCondition::new(DelayConditionKind::Date, Some(date)));
                }
                if let Some(version) = native_version.as_deref() {
                    conditions.push(DelayCondition::new(
                        DelayConditionKind::NativeVersion,
                        Some(version),
                    ));
                }
                manager.set_delay_conditions(conditions).await?;
                print_json(&manager.delay_conditions().await)?;
            }
            DelayCommands::Cancel => {
                manager.cancel_delay().await?;
                print_json(&manager.delay_conditions().await)?;
            }
            DelayCommands::Show => print_json(&manager.delay_conditions().await)?,
        },
        Commands::Launch => launch_loop(&mut app).await?,
    }

    Ok(())
}

async fn launch_loop(app: &mut OtaApp) -> Result<()> {
    let report = app.launch().await?;
    print_json(&json!({
        "current": report.outcome.current,
        "swapped": report.outcome.swapped,
        "deferred": report.outcome.deferred,
        "watchdog_armed": report.watchdog_armed,
    }))?;

    let interrupted = Arc::new(Notify::new());
    let signal = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        emit_event(
            "launch_signal",
            json!({ "signal": "interrupt", "action": "graceful_stop" }),
        );
        signal.notify_one();
    })?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut poll = tokio::time::interval(PENDING_POLL_INTERVAL);
    let mut last_state = app.watchdog_state();

    loop {
        tokio::select! {
            _ = interrupted.notified() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("failed reading stdin")? else {
                    break;
                };
                match line.trim().to_ascii_lowercase().as_str() {
                    "" => {}
                    "ready" => {
                        let confirmed = app.notify_app_ready().await?;
                        print_json(&json!({ "ready": confirmed }))?;
                    }
                    "background" => {
                        if let Some(outcome) = app.app_backgrounded().await? {
                            print_json(&json!({
                                "current": outcome.current,
                                "swapped": outcome.swapped,
                                "deferred": outcome.deferred,
                            }))?;
                        }
                    }
                    "foreground" => app.app_foregrounded(),
                    "exit" | "quit" => break,
                    other => emit_event("launch_input_ignored", json!({ "input": other })),
                }
            }
            _ = poll.tick() => {
                if let Some(outcome) = app.poll_pending_update().await? {
                    if outcome.swapped {
                        print_json(&json!({ "current": outcome.current, "swapped": true }))?;
                    }
                }
            }
        }

        let state = app.watchdog_state();
        if state != last_state {
            if let WatchdogState::Expired { bundle_id } = &state {
                emit_event("rollback", json!({ "failed_bundle_id": bundle_id }));
            }
            last_state = state;
        }
        for event in app.drain_events() {
            emit_event("updater_event", serde_json::to_value(&event)?);
        }
    }

    app.shutdown();
    Ok(())
}

fn decision_json(decision: &UpdateDecision) -> serde_json::Value {
    match decision {
        UpdateDecision::Rejected { error, message } => {
            json!({ "decision": "rejected", "error": error, "message": message })
        }
        UpdateDecision::UpToDate { version } => {
            json!({ "decision": "up_to_date", "version": version })
        }
        UpdateDecision::Breaking { version, message } => {
            json!({ "decision": "breaking", "version": version, "message": message })
        }
        UpdateDecision::Available(request) => json!({
            "decision": "available",
            "version": request.version,
            "url": request.url,
            "encrypted": request.session_key.is_some(),
            "checksum": request.checksum,
            "manifest_entries": request.manifest.as_ref().map(Vec::len),
        }),
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed encoding output")?
    );
    Ok(())
}
