use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use spine_core::constants::CURRENT_SCHEMA_VERSION;
use spine_core::{
    AgentEvent, EventEnvelope, EventSource, ReplayMode, ReplayOptions, Report, Scoreboard,
    SpineConfig, check_report_schema, replay,
};
use spine_store::{EmissionConfig, Emitter, ProfileStore, StoreError};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "spine", about = "Agentic event spine: replay, scoreboard and event emission")]
struct Cli {
    /// TOML config file (falls back to SPINE_CONFIG, then defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output; replay also records a per-event audit trail
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay event logs and print a JSON report
    Replay {
        /// Log files or glob patterns (JSONL or a JSON array)
        #[arg(required = true)]
        paths: Vec<String>,

        /// Starting mode for every capability: M0 (Shadow), M1 (Advisory), M2 (Actuated)
        #[arg(long, default_value = "M0")]
        mode: ReplayMode,

        /// Counts only, without per-moment and per-decision detail
        #[arg(long)]
        summary_only: bool,

        /// Save each session's final UWSM profile to this database
        #[arg(long)]
        profile_db: Option<PathBuf>,
    },

    /// Aggregate one or more replay reports
    Scoreboard {
        /// Report files written by `spine replay`
        #[arg(required = true)]
        reports: Vec<PathBuf>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Build one event and write it through the configured emission sink
    Emit {
        #[arg(long)]
        session: String,

        #[arg(long)]
        event_type: String,

        /// Payload as a JSON object
        #[arg(long)]
        payload: Option<String>,

        #[arg(long)]
        correlation_id: Option<String>,

        #[arg(long, default_value_t = 0)]
        privacy_layer: u8,
    },

    /// Manage persisted UWSM profiles
    Profile {
        /// Profile database (defaults to $SPINE_DATA_DIR/profiles.db)
        #[arg(long, global = true)]
        db: Option<PathBuf>,

        #[command(subcommand)]
        command: ProfileCommand,
    },
}

#[derive(Subcommand)]
enum ProfileCommand {
    /// List stored profiles, oldest first
    List,

    /// Print one stored profile as JSON
    Show { session: String },

    /// Delete profiles older than the retention window
    Prune {
        /// Overrides `retention.uwsm_days` from config
        #[arg(long)]
        retention_days: Option<u32>,
    },
}

fn load_config(cli: &Cli) -> Result<SpineConfig> {
    spine_store::resolve_config(cli.config.as_deref()).context("failed to load config")
}

fn open_profiles(db: Option<&Path>) -> Result<ProfileStore> {
    let path = db.map(PathBuf::from).unwrap_or_else(spine_store::default_db_path);
    ProfileStore::open(&path)
        .with_context(|| format!("failed to open profile store {}", path.display()))
}

/// `--verbose` turns on debug output for the spine crates only, leaving
/// sqlite and file walking at warn. Otherwise `RUST_LOG`, else warn.
fn log_filter(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("warn,spine=debug,spine_core=debug,spine_store=debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}

fn init_tracing(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(verbose)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Replay {
            paths,
            mode,
            summary_only,
            profile_db,
        } => cmd_replay(&cli, paths, *mode, *summary_only, profile_db.as_deref()),
        Commands::Scoreboard { reports, json } => cmd_scoreboard(reports, *json),
        Commands::Emit {
            session,
            event_type,
            payload,
            correlation_id,
            privacy_layer,
        } => cmd_emit(
            session,
            event_type,
            payload.as_deref(),
            correlation_id.clone(),
            *privacy_layer,
        ),
        Commands::Profile { db, command } => match command {
            ProfileCommand::List => cmd_profile_list(db.as_deref()),
            ProfileCommand::Show { session } => cmd_profile_show(db.as_deref(), session),
            ProfileCommand::Prune { retention_days } => {
                cmd_profile_prune(&cli, db.as_deref(), *retention_days)
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

fn cmd_replay(
    cli: &Cli,
    paths: &[String],
    mode: ReplayMode,
    summary_only: bool,
    profile_db: Option<&Path>,
) -> Result<()> {
    let config = load_config(cli)?;

    let mut events = Vec::new();
    let mut failures = Vec::new();
    for file in spine_store::load_all(paths) {
        match file.events {
            Ok(mut loaded) => events.append(&mut loaded),
            Err(e @ (StoreError::NotFound(_) | StoreError::Malformed { .. })) => {
                failures.push(e.to_string())
            }
            Err(e) => failures.push(format!("{}: {e}", file.path.display())),
        }
    }

    let options = ReplayOptions {
        mode,
        verbose: cli.verbose && !summary_only,
    };
    let report = replay(events, options, &config);
    let report = if summary_only { report.summary() } else { report };

    let json = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
    println!("{json}");

    if let Some(db) = profile_db {
        save_profiles(db, &report)?;
    }

    if !failures.is_empty() {
        for failure in &failures {
            eprintln!("error: {failure}");
        }
        bail!("{} input(s) could not be replayed", failures.len());
    }
    Ok(())
}

fn save_profiles(db: &Path, report: &Report) -> Result<()> {
    let store = open_profiles(Some(db))?;
    let now = Utc::now();
    for (session_id, session) in &report.sessions {
        store
            .save(session_id, &session.uwsm_final, now)
            .with_context(|| format!("failed to save profile for {session_id}"))?;
    }
    tracing::info!(profiles = report.sessions.len(), db = %db.display(), "saved uwsm profiles");
    Ok(())
}

// ---------------------------------------------------------------------------
// Scoreboard
// ---------------------------------------------------------------------------

fn cmd_scoreboard(paths: &[PathBuf], json: bool) -> Result<()> {
    let mut reports = Vec::with_capacity(paths.len());
    for path in paths {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("{} is not a replay report", path.display()))?;
        let Some(version) = value.get("schema_version").and_then(Value::as_str) else {
            bail!("{} is not a replay report: no schema_version", path.display());
        };
        check_report_schema(version)
            .with_context(|| format!("cannot aggregate {}", path.display()))?;
        let report: Report = serde_json::from_value(value)
            .with_context(|| format!("{} is not a replay report", path.display()))?;
        reports.push(report);
    }

    let board = Scoreboard::from_reports(&reports);
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&board).context("failed to serialize scoreboard")?
        );
    } else {
        print!("{}", board.render());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Emit
// ---------------------------------------------------------------------------

fn cmd_emit(
    session: &str,
    event_type: &str,
    payload: Option<&str>,
    correlation_id: Option<String>,
    privacy_layer: u8,
) -> Result<()> {
    let payload = match payload {
        None => Map::new(),
        Some(raw) => match serde_json::from_str::<Value>(raw).context("--payload is not valid JSON")? {
            Value::Object(map) => map,
            _ => bail!("--payload must be a JSON object"),
        },
    };

    let envelope = EventEnvelope {
        event_id: Uuid::new_v4().to_string(),
        event_type: event_type.to_string(),
        source: EventSource {
            repo: String::new(),
            component: "spine-cli".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        payload,
        privacy_layer,
        occurred_at: Utc::now(),
        session_id: session.to_string(),
        correlation_id,
        schema_version: CURRENT_SCHEMA_VERSION.to_string(),
    };
    AgentEvent::from_envelope(envelope.clone()).context("event failed validation")?;

    let config = EmissionConfig::from_env().context("invalid emission config")?;
    let emitter = Emitter::new(config);
    if !emitter.emit(&envelope).context("failed to emit event")? {
        tracing::info!(event_id = %envelope.event_id, "emission disabled, nothing written");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

fn cmd_profile_list(db: Option<&Path>) -> Result<()> {
    let store = open_profiles(db)?;
    let profiles = store.list().context("failed to list profiles")?;

    println!("profiles:   {}", profiles.len());
    for profile in &profiles {
        println!(
            "{}  updated={}  mean_confidence={:.3}",
            profile.session_id,
            profile.updated_at.to_rfc3339(),
            profile.mean_confidence
        );
    }
    Ok(())
}

fn cmd_profile_show(db: Option<&Path>, session: &str) -> Result<()> {
    let store = open_profiles(db)?;
    let Some(profile) = store.load(session).context("failed to load profile")? else {
        bail!("no stored profile for session {session}");
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&profile).context("failed to serialize profile")?
    );
    Ok(())
}

fn cmd_profile_prune(cli: &Cli, db: Option<&Path>, retention_days: Option<u32>) -> Result<()> {
    let days = match retention_days {
        Some(days) => days,
        None => load_config(cli)?.retention.uwsm_days,
    };
    let store = open_profiles(db)?;
    let removed = store
        .prune_expired(days, Utc::now())
        .context("failed to prune profiles")?;

    println!("pruned:     {removed}");
    println!("remaining:  {}", store.count()?);
    Ok(())
}
