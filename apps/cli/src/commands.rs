//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use codelore_core::{DiscoveryService, PipelineEvent, Subscription};
use codelore_shared::{
    AppConfig, ConceptFilter, PipelineRun, RelationKind, RelationshipFilter, RunId, RunStatus,
    init_config, load_config, load_config_from,
};
use codelore_storage::Storage;
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// codelore: discover patterns in a codebase and grow a knowledge graph.
#[derive(Parser)]
#[command(
    name = "codelore",
    version,
    about = "Scan a codebase, classify its files and grow a local knowledge graph.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.codelore/codelore.toml).
    #[arg(long, env = "CODELORE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Scan root, overriding the config file.
    #[arg(long, env = "CODELORE_ROOT", global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Output format for query commands.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    Table,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline once and wait for it to finish.
    Run {
        /// File or directory to rescan, relative to the root.
        #[arg(long)]
        scope: Option<PathBuf>,
    },

    /// Watch the root and re-run on changes until Ctrl-C.
    Watch {
        /// Skip the full run before watching starts.
        #[arg(long)]
        no_initial_run: bool,
    },

    /// Show recent pipeline runs.
    Status {
        #[arg(long, default_value = "10")]
        limit: u32,

        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Query concepts, most important first.
    Concepts {
        #[arg(long)]
        category: Option<String>,

        /// Substring of the concept name.
        #[arg(long)]
        contains: Option<String>,

        #[arg(long)]
        min_importance: Option<f64>,

        #[arg(long, default_value = "50")]
        limit: u32,

        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Query relationships, strongest first.
    Relationships {
        /// Concept at either end of the edge.
        #[arg(long)]
        concept: Option<String>,

        /// depends_on or related_to.
        #[arg(long, value_parser = parse_kind)]
        kind: Option<RelationKind>,

        #[arg(long)]
        min_strength: Option<f64>,

        #[arg(long, default_value = "50")]
        limit: u32,

        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

fn parse_kind(s: &str) -> std::result::Result<RelationKind, String> {
    RelationKind::parse(s).ok_or_else(|| format!("unknown kind '{s}': expected depends_on or related_to"))
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "codelore=info",
        1 => "codelore=debug",
        _ => "codelore=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(cli.config.as_deref(), cli.root.as_deref())?;

    match cli.command {
        Command::Run { scope } => cmd_run(&config, scope.as_deref()).await,
        Command::Watch { no_initial_run } => cmd_watch(&config, !no_initial_run).await,
        Command::Status { limit, format } => cmd_status(&config, limit, format).await,
        Command::Concepts {
            category,
            contains,
            min_importance,
            limit,
            format,
        } => {
            let filter = ConceptFilter {
                category,
                name_contains: contains,
                min_importance,
                limit: Some(limit),
            };
            cmd_concepts(&config, &filter, format).await
        }
        Command::Relationships {
            concept,
            kind,
            min_strength,
            limit,
            format,
        } => {
            let filter = RelationshipFilter {
                concept,
                kind,
                min_strength,
                limit: Some(limit),
            };
            cmd_relationships(&config, &filter, format).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&config).await,
        },
    }
}

/// File (or defaults), then `--root`.
fn resolve_config(path: Option<&Path>, root: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(root) = root {
        config.scan.root = root.to_string_lossy().into_owned();
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Pipeline commands
// ---------------------------------------------------------------------------

async fn cmd_run(config: &AppConfig, scope: Option<&Path>) -> Result<()> {
    let service = DiscoveryService::open(config).await?;
    let mut events = service.subscribe();
    let run_id = service.start_run(scope).await?;
    info!(%run_id, root = %config.scan.root, "pipeline run started");

    let progress = CliProgress::new();
    let run = follow_run(&service, &mut events, &run_id, &progress).await?;
    progress.finish();

    print_run_summary(&run);
    match run.status {
        RunStatus::Failed => Err(eyre!(
            "run failed: {}",
            run.error.as_deref().unwrap_or("unknown error")
        )),
        _ => Ok(()),
    }
}

/// Drive the progress display from the event stream until `run_id`
/// completes. Ctrl-C cancels the run and keeps waiting for it to wind down.
async fn follow_run(
    service: &DiscoveryService,
    events: &mut Subscription,
    run_id: &RunId,
    progress: &CliProgress,
) -> Result<PipelineRun> {
    let mut cancel_sent = false;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !cancel_sent => {
                signal?;
                cancel_sent = true;
                progress.message("cancelling at the next batch boundary...");
                service.cancel_run(run_id).await;
            }
            event = events.recv() => match event {
                Some(event) if event.run_id() == run_id => {
                    let done = matches!(event, PipelineEvent::RunCompleted { .. });
                    progress.on_event(&event);
                    if done {
                        break;
                    }
                }
                Some(_) => {}
                None => {
                    warn!("progress stream dropped, waiting for the run to finish");
                    break;
                }
            },
        }
    }
    Ok(service.wait_for(run_id).await?)
}

async fn cmd_watch(config: &AppConfig, initial_run: bool) -> Result<()> {
    let service = DiscoveryService::open(config).await?;
    let mut events = service.subscribe();

    if initial_run {
        let run_id = service.start_run(None).await?;
        let progress = CliProgress::new();
        let run = follow_run(&service, &mut events, &run_id, &progress).await?;
        progress.finish();
        print_run_summary(&run);
    }

    service.enable_auto_evolve().await?;
    println!(
        "Watching {} for changes (Ctrl-C to stop)",
        service.orchestrator().scanner().root().display()
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            event = events.recv() => match event {
                Some(PipelineEvent::RunCompleted { run_id, status, summary, error }) => {
                    let scope = match service.store().get_run(&run_id).await {
                        Ok(Some(run)) => run.scope.unwrap_or_else(|| ".".into()),
                        _ => ".".into(),
                    };
                    match error {
                        Some(error) => println!("  {scope}: {} ({error})", status.as_str()),
                        None => println!(
                            "  {scope}: {} files, {} concepts, {} relationships",
                            summary.files_scanned, summary.concepts, summary.relationships
                        ),
                    }
                }
                Some(_) => {}
                None => events = service.subscribe(),
            },
        }
    }

    println!("Stopping...");
    service.shutdown().await;
    Ok(())
}

async fn cmd_status(config: &AppConfig, limit: u32, format: OutputFormat) -> Result<()> {
    let Some(store) = open_snapshot(config).await? else {
        println!("No runs yet. Start one with `codelore run`.");
        return Ok(());
    };
    let runs = store.list_runs(limit).await?;

    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No runs yet. Start one with `codelore run`.");
        return Ok(());
    }

    println!(
        "{:<38} {:<7} {:<10} {:>7} {:>9} {:>8}  SCOPE",
        "RUN", "TRIGGER", "STATUS", "FILES", "CONCEPTS", "TIME"
    );
    for run in &runs {
        let elapsed = run
            .finished_at
            .map(|end| format!("{:.1}s", (end - run.started_at).num_milliseconds() as f64 / 1000.0))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<38} {:<7} {:<10} {:>7} {:>9} {:>8}  {}",
            run.run_id,
            run.trigger.as_str(),
            run.status.as_str(),
            run.counts.files_scanned,
            run.counts.concepts,
            elapsed,
            run.scope.as_deref().unwrap_or(".")
        );
        if let Some(error) = &run.error {
            println!("    error: {error}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Knowledge queries
// ---------------------------------------------------------------------------

async fn cmd_concepts(config: &AppConfig, filter: &ConceptFilter, format: OutputFormat) -> Result<()> {
    let Some(store) = open_snapshot(config).await? else {
        println!("No knowledge store yet. Start with `codelore run`.");
        return Ok(());
    };
    let concepts = store.get_concepts(filter).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&concepts)?),
        OutputFormat::Table => {
            println!("{:>6} {:>6}  {:<12} NAME", "IMP", "SEEN", "CATEGORY");
            for c in &concepts {
                println!(
                    "{:>6.2} {:>6}  {:<12} {}",
                    c.importance, c.occurrence_count, c.category, c.name
                );
            }
        }
    }
    Ok(())
}

async fn cmd_relationships(
    config: &AppConfig,
    filter: &RelationshipFilter,
    format: OutputFormat,
) -> Result<()> {
    let Some(store) = open_snapshot(config).await? else {
        println!("No knowledge store yet. Start with `codelore run`.");
        return Ok(());
    };
    let relationships = store.get_relationships(filter).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&relationships)?),
        OutputFormat::Table => {
            println!("{:>6} {:>5}  {:<11} EDGE", "STR", "EVID", "KIND");
            for r in &relationships {
                println!(
                    "{:>6.3} {:>5}  {:<11} {} -> {}",
                    r.strength,
                    r.evidence.len(),
                    r.kind.as_str(),
                    r.source,
                    r.target
                );
            }
        }
    }
    Ok(())
}

/// Read-only handle on the store, or `None` if no run has created it yet.
async fn open_snapshot(config: &AppConfig) -> Result<Option<Storage>> {
    let path = config.db_path();
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(Storage::open_readonly(&path).await?))
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress display
// ---------------------------------------------------------------------------

/// Progress display using an indicatif bar fed by pipeline events.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg} [{pos}/{len}]") {
            bar.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
        }
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    fn message(&self, msg: &str) {
        self.bar.set_message(msg.to_string());
    }

    fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StageStarted { stage, .. } => {
                self.bar.set_position(0);
                self.bar.set_length(0);
                self.bar.set_message(stage.to_string());
            }
            PipelineEvent::StageProgress {
                processed, total, ..
            } => {
                self.bar.set_length(*total as u64);
                self.bar.set_position(*processed as u64);
            }
            PipelineEvent::PatternDiscovered {
                file, pattern_type, ..
            } => {
                self.bar.set_message(format!("scanning: {pattern_type} in {file}"));
            }
            PipelineEvent::StageCompleted { .. } | PipelineEvent::RunCompleted { .. } => {}
        }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

fn print_run_summary(run: &PipelineRun) {
    let c = &run.counts;
    let total_ms: u64 = run.stage_durations.values().sum();
    println!();
    println!("  Run {} {}", run.run_id, run.status.as_str());
    println!("  Scope:         {}", run.scope.as_deref().unwrap_or("."));
    println!(
        "  Files:         {} scanned, {} skipped, {} oversized, {} removed",
        c.files_scanned, c.files_skipped, c.files_oversized, c.files_removed
    );
    println!("  Elements:      {}", c.elements);
    println!("  Patterns:      {}", c.patterns);
    println!(
        "  Extracted:     {} files, {} records",
        c.extracted_files, c.extraction_records
    );
    println!("  Concepts:      {}", c.concepts);
    println!("  Relationships: {}", c.relationships);
    println!("  Time:          {:.1}s", total_ms as f64 / 1000.0);
    if let Some(error) = &run.error {
        println!("  Error:         {error}");
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_query_flags() {
        let cli = Cli::try_parse_from([
            "codelore",
            "--root",
            "/tmp/project",
            "relationships",
            "--kind",
            "depends_on",
            "--min-strength",
            "0.2",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.root.as_deref(), Some(Path::new("/tmp/project")));
        match cli.command {
            Command::Relationships {
                kind,
                min_strength,
                limit,
                format,
                ..
            } => {
                assert_eq!(kind, Some(RelationKind::DependsOn));
                assert_eq!(min_strength, Some(0.2));
                assert_eq!(limit, 50);
                assert!(matches!(format, OutputFormat::Json));
            }
            _ => panic!("expected relationships command"),
        }
    }

    #[test]
    fn unknown_relation_kind_is_rejected() {
        let result = Cli::try_parse_from(["codelore", "relationships", "--kind", "owns"]);
        assert!(result.is_err());
    }

    #[test]
    fn root_flag_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codelore.toml");
        std::fs::write(&path, "[scan]\nroot = \"/from/file\"\nworkers = 2\n").unwrap();

        let config = resolve_config(Some(&path), Some(Path::new("/from/flag"))).unwrap();
        assert_eq!(config.scan.root, "/from/flag");
        assert_eq!(config.scan.workers, 2);

        let config = resolve_config(Some(&path), None).unwrap();
        assert_eq!(config.scan.root, "/from/file");
    }
}
