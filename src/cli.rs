// CLI module - command-line argument parsing and handlers
//
// Subcommands for the testable core:
// - search:  run a query, JSON result page on stdout
// - stats:   maintained counters as JSON
// - cleanup: enforce retention caps + orphan sweep
// - add:     ingest text from an argument or stdin
// - config:  settings file management
//
// Exit codes: 0 success, 1 bad args, 2 DB error, 3 timeout.

use crate::config::{DataPaths, Settings, TomlSettingsStore, VERSION};
use crate::error::Error;
use crate::ingest::{IngestOutcome, RawCapture};
use crate::pasteboard::SystemPasteboard;
use crate::search::{SearchMode, SearchRequest};
use crate::service::{ClipboardService, ServiceOptions};
use crate::store::ItemType;
use clap::{Parser, Subcommand};
use std::sync::Arc;

/// clipkeep - local clipboard-history core
#[derive(Parser)]
#[command(name = "clipkeep")]
#[command(version = VERSION)]
#[command(about = "Local clipboard history: ingest, search, cleanup", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Query the history
    Search {
        /// Search mode: exact, fuzzy, fuzzy_plus, regex (default from settings)
        #[arg(long)]
        mode: Option<String>,

        /// Query string
        #[arg(long)]
        query: String,

        /// Only items captured from this app bundle id
        #[arg(long)]
        app: Option<String>,

        /// Comma-separated type filter (text,rtf,html,image,file,other)
        #[arg(long = "type")]
        type_filter: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Recompute over the full corpus instead of accepting a prefilter
        #[arg(long)]
        force_full: bool,
    },

    /// Print maintained counters
    Stats,

    /// Enforce retention caps and sweep orphaned blobs
    Cleanup,

    /// Ingest text from the argument or stdin
    Add {
        /// Source application bundle id
        #[arg(long)]
        app: Option<String>,

        /// Text to ingest; reads stdin when omitted
        text: Option<String>,
    },

    /// Manage the settings file
    Config {
        /// Show effective settings
        #[arg(long)]
        show: bool,

        /// Reset settings file to defaults
        #[arg(long)]
        reset: bool,

        /// Show settings file path
        #[arg(long)]
        path: bool,
    },
}

/// Run a parsed command. Returns the process exit code.
pub async fn run(cli: Cli) -> i32 {
    match dispatch(cli).await {
        Ok(()) => 0,
        Err(CliError::BadArgs(msg)) => {
            eprintln!("Error: {msg}");
            1
        }
        Err(CliError::Core(e)) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}

#[derive(Debug)]
enum CliError {
    BadArgs(String),
    Core(Error),
}

impl From<Error> for CliError {
    fn from(e: Error) -> Self {
        CliError::Core(e)
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Config { show, reset, path } => handle_config(show, reset, path),
        command => {
            let service = open_service().await?;
            let result = handle_with_service(&service, command).await;
            service.stop().await;
            result
        }
    }
}

async fn open_service() -> Result<ClipboardService, CliError> {
    let paths = DataPaths::from_env()?;
    let settings_store = Arc::new(
        TomlSettingsStore::at_default_location().map_err(CliError::Core)?,
    );
    Ok(ClipboardService::start(ServiceOptions {
        paths,
        settings_store,
        pasteboard: Arc::new(SystemPasteboard),
    })
    .await?)
}

async fn handle_with_service(
    service: &ClipboardService,
    command: Commands,
) -> Result<(), CliError> {
    match command {
        Commands::Search {
            mode,
            query,
            app,
            type_filter,
            limit,
            offset,
            force_full,
        } => {
            let mode = match mode {
                Some(name) => SearchMode::parse(&name).ok_or_else(|| {
                    CliError::BadArgs(format!(
                        "unknown mode '{name}' (expected exact, fuzzy, fuzzy_plus or regex)"
                    ))
                })?,
                None => service.get_settings().default_search_mode,
            };
            let types = parse_types(type_filter.as_deref())?;
            if limit == 0 {
                return Err(CliError::BadArgs("--limit must be positive".into()));
            }

            let page = service
                .search(SearchRequest {
                    query,
                    mode,
                    app_filter: app,
                    type_filter: types,
                    limit,
                    offset,
                    force_full,
                })
                .await?;
            print_json(&page);
            Ok(())
        }

        Commands::Stats => {
            let stats = service.get_stats().await?;
            print_json(&serde_json::json!({
                "generated_at": chrono::Utc::now().to_rfc3339(),
                "stats": stats,
            }));
            Ok(())
        }

        Commands::Cleanup => {
            let mut report = service.run_cleanup().await?;
            report.swept_orphans = service.sweep_orphans().await?;
            print_json(&report);
            Ok(())
        }

        Commands::Add { app, text } => {
            let text = match text {
                Some(t) => t,
                None => std::io::read_to_string(std::io::stdin())
                    .map_err(|e| CliError::Core(e.into()))?,
            };
            let outcome = service
                .ingest(RawCapture::Text {
                    text,
                    app_bundle_id: app,
                })
                .await?;
            print_json(&outcome_json(&outcome));
            Ok(())
        }

        Commands::Config { .. } => unreachable!("handled before service start"),
    }
}

fn parse_types(list: Option<&str>) -> Result<Option<Vec<ItemType>>, CliError> {
    let Some(list) = list else { return Ok(None) };
    let mut types = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let t = ItemType::parse(name)
            .ok_or_else(|| CliError::BadArgs(format!("unknown type '{name}'")))?;
        types.push(t);
    }
    Ok(if types.is_empty() { None } else { Some(types) })
}

fn outcome_json(outcome: &IngestOutcome) -> serde_json::Value {
    match outcome {
        IngestOutcome::Stored(s) => serde_json::json!({ "outcome": "stored", "item": s }),
        IngestOutcome::Deduplicated(s) => {
            serde_json::json!({ "outcome": "deduplicated", "item": s })
        }
        IngestOutcome::Ignored => serde_json::json!({ "outcome": "ignored" }),
        IngestOutcome::Dropped => serde_json::json!({ "outcome": "dropped" }),
    }
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Error: serialization failed: {e}"),
    }
}

fn handle_config(show: bool, reset: bool, path: bool) -> Result<(), CliError> {
    if path {
        match Settings::config_path() {
            Some(p) => println!("{}", p.display()),
            None => return Err(CliError::BadArgs("could not determine config path".into())),
        }
        return Ok(());
    }

    if reset {
        let Some(p) = Settings::config_path() else {
            return Err(CliError::BadArgs("could not determine config path".into()));
        };
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CliError::Core(e.into()))?;
        }
        std::fs::write(&p, Settings::default().to_toml())
            .map_err(|e| CliError::Core(e.into()))?;
        println!("Settings reset to defaults: {}", p.display());
        return Ok(());
    }

    if show {
        let settings = Settings::from_env();
        print!("{}", settings.to_toml());
        if let Some(p) = Settings::config_path() {
            if p.exists() {
                println!("\n# Source: {}", p.display());
            } else {
                println!("\n# Source: defaults (no settings file)");
            }
        }
        return Ok(());
    }

    println!("Usage: clipkeep config [--show|--reset|--path]");
    Ok(())
}
