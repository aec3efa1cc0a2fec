// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Wildsort: camera-trap image triage
//!
//! Command-line front end: scanning, sorting, tool runs and an interactive
//! line-oriented browser.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};

use wildsort::config::{AppConfig, BINDING_KEYS};
use wildsort::copier::FileCopier;
use wildsort::history::{JournalEntry, SortJournal};
use wildsort::predictions::PredictionSet;
use wildsort::runner::LogStream;
use wildsort::scanner::FolderScanner;
use wildsort::session::{Reaction, Session};
use wildsort::tasks::{TaskEvent, TaskManager, TaskState};
use wildsort::thumbnail::ThumbnailCache;
use wildsort::tools::{self, Tool};
use wildsort::{Result, WildsortError};

/// Wildsort CLI - camera-trap image triage
#[derive(Parser, Debug)]
#[command(name = "wildsort")]
#[command(author = "Jonathan D. A. Jewell <hyperpolymath>")]
#[command(version)]
#[command(about = "Sort camera-trap images and run species detection tools", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (JSON format)
    #[arg(short, long, default_value = "wildsort.json", global = true)]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Output format for results
    #[arg(long, global = true, default_value = "text", value_parser = ["text", "json", "jsonl"])]
    format: String,

    /// Suppress non-essential output (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the images of a folder in navigation order
    Scan {
        folder: PathBuf,

        /// Include images in subfolders
        #[arg(short, long)]
        recursive: bool,
    },

    /// Copy one file into a folder without overwriting anything
    Copy {
        source: PathBuf,
        destination: PathBuf,
    },

    /// Copy the image at a position into the folder bound to a key
    Sort {
        folder: PathBuf,

        /// Binding key (1, 2 or 3)
        #[arg(short, long)]
        key: u8,

        /// Position of the image in navigation order
        #[arg(short, long, default_value = "0")]
        index: usize,
    },

    /// Bind a destination folder to a key, or list bindings
    Bind {
        /// Binding key (1, 2 or 3)
        key: Option<u8>,

        destination: Option<PathBuf>,
    },

    /// Run an inference tool over a folder and stream its output
    Analyze {
        folder: PathBuf,

        /// speciesnet or megadetector
        #[arg(short, long, default_value = "speciesnet")]
        tool: Tool,

        /// Print the command line instead of running it
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the predictions recorded for a folder
    Predictions {
        folder: PathBuf,

        /// Results file (default: the folder's configured results file)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Generate thumbnails for every image in a folder
    Thumbs {
        folder: PathBuf,
    },

    /// Interactive browsing and sorting
    Browse {
        folder: PathBuf,
    },

    /// Sort journal and undo operations
    History {
        #[command(subcommand)]
        action: HistoryCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Initialize a working directory with a config and sort folders
    Init {
        /// Directory to initialize (default: current)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Force overwrite existing configuration
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCommands {
    /// List recent sort copies
    List {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
    },

    /// Remove the most recent copies from their destination folders
    Undo {
        /// Number of copies to undo
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// Dry run (show what would be undone)
        #[arg(long)]
        dry_run: bool,
    },

    /// Clear the journal
    Clear {
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Generate default configuration file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "wildsort.json")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Edit configuration in $EDITOR
    Edit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    debug!("Wildsort v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load(&cli.config)?;
    let format = cli.format.as_str();

    match cli.command {
        Commands::Scan { folder, recursive } => run_scan(config, &folder, recursive, format),
        Commands::Copy { source, destination } => run_copy(config, &source, &destination, format),
        Commands::Sort { folder, key, index } => run_sort(config, &folder, key, index, format).await,
        Commands::Bind { key, destination } => run_bind(config, key, destination, &cli.config),
        Commands::Analyze { folder, tool, dry_run } => run_analyze(config, &folder, tool, dry_run, format).await,
        Commands::Predictions { folder, file } => run_predictions(config, &folder, file, format),
        Commands::Thumbs { folder } => run_thumbs(config, &folder, format).await,
        Commands::Browse { folder } => run_browse(config, &folder, &cli.config).await,
        Commands::History { action } => run_history_command(config, action, format),
        Commands::Config { action } => run_config_command(config, action, &cli.config),
        Commands::Init { dir, force } => run_init(dir, force),
    }
}

/// Print `items` as text lines, a JSON array, or JSON lines
fn emit<T: Serialize>(format: &str, items: &[T], text: impl Fn(&T) -> String) -> Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(items)?),
        "jsonl" => {
            for item in items {
                println!("{}", serde_json::to_string(item)?);
            }
        }
        _ => {
            for item in items {
                println!("{}", text(item));
            }
        }
    }
    Ok(())
}

fn run_scan(mut config: AppConfig, folder: &Path, recursive: bool, format: &str) -> Result<()> {
    config.scan.recursive |= recursive;
    let report = FolderScanner::new(&config.scan).scan(folder)?;

    emit(format, &report.entries, |e| {
        format!("{:5}  {:>10}  {}", e.sequence_index, e.size_bytes, e.path.display())
    })?;

    for skipped in &report.skipped {
        warn!("Skipped {:?}: {}", skipped.path, skipped.reason);
    }
    if format == "text" {
        println!("\n{} images, {} skipped", report.entries.len(), report.skipped.len());
    }
    Ok(())
}

fn run_copy(config: AppConfig, source: &Path, destination: &Path, format: &str) -> Result<()> {
    let result = FileCopier::new().copy_path(source, destination)?;
    let journal = SortJournal::new(config.history.path.clone());
    journal.append(&JournalEntry::from_copy(None, &result))?;

    emit(format, std::slice::from_ref(&result), |r| {
        format!("{} -> {}", r.source.display(), r.destination.display())
    })
}

async fn run_sort(config: AppConfig, folder: &Path, key: u8, index: usize, format: &str) -> Result<()> {
    let mut session = Session::new(config);
    session.open_folder(folder)?;
    session.select(index)?;
    let result = session.sort_current(key).await?;

    emit(format, std::slice::from_ref(&result), |r| {
        let note = if r.renamed { " (renamed)" } else { "" };
        format!("{} -> {}{}", r.source.display(), r.destination.display(), note)
    })
}

fn run_bind(mut config: AppConfig, key: Option<u8>, destination: Option<PathBuf>, config_path: &Path) -> Result<()> {
    match (key, destination) {
        (Some(key), Some(destination)) => {
            config.set_binding(key, destination)?;
            config.save(config_path)?;
            info!("Saved bindings to {:?}", config_path);
        }
        (Some(key), None) => {
            return Err(WildsortError::Config(format!("Missing destination for key {}", key)));
        }
        _ => {}
    }

    for key in BINDING_KEYS {
        match config.binding(key) {
            Some(path) => println!("  {}: {}", key, path.display()),
            None => println!("  {}: (unbound)", key),
        }
    }
    Ok(())
}

fn print_event(event: &TaskEvent, format: &str) -> Result<()> {
    if format == "jsonl" || format == "json" {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        TaskEvent::Log(log) => match log.stream {
            LogStream::Stdout => println!("{}", log.text),
            LogStream::Stderr => eprintln!("{}", log.text),
            LogStream::System => println!("[wildsort] {}", log.text),
        },
        TaskEvent::State { state, exit_code, .. } => {
            debug!("Task state {:?} (exit code {:?})", state, exit_code);
        }
    }
    Ok(())
}

fn print_reaction(reaction: &Reaction) {
    match reaction {
        Reaction::Nothing => {}
        Reaction::PredictionsReloaded { records } => println!("Loaded {} predictions", records),
        Reaction::OutputsRenamed { renamed, images } => {
            println!("Renamed {} annotated images, folder now has {} images", renamed, images)
        }
    }
}

async fn run_analyze(config: AppConfig, folder: &Path, tool: Tool, dry_run: bool, format: &str) -> Result<()> {
    let mut session = Session::new(config.clone());
    session.open_folder(folder)?;
    let spec = session.command_for(tool)?;

    if dry_run {
        println!("{} {}", spec.program, spec.args.join(" "));
        return Ok(());
    }

    let manager = TaskManager::new(&config.tasks);
    let mut events = manager.subscribe();
    let task_id = manager.submit(spec)?;
    session.track(task_id, tool);
    info!("{} running, press Ctrl+C to cancel", tool.label());

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event, format)?;
                print_reaction(&session.handle_event(&event)?);
                if matches!(event, TaskEvent::State { state, .. } if state.is_terminal()) {
                    break;
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, cancelling {}", tool.label());
                if let Err(e) = manager.cancel() {
                    debug!("Nothing to cancel: {}", e);
                }
            }
        }
    }

    match manager.wait_idle().await {
        Some(task) if task.state == TaskState::Failed => Err(WildsortError::ProcessFailure {
            code: task.exit_code,
            stderr_tail: task.stderr_tail,
        }),
        Some(task) if task.state == TaskState::Cancelled => {
            warn!("{} was cancelled", tool.label());
            Ok(())
        }
        _ => Ok(()),
    }
}

fn run_predictions(config: AppConfig, folder: &Path, file: Option<PathBuf>, format: &str) -> Result<()> {
    let path = file.unwrap_or_else(|| tools::results_path(&config.tools, folder));
    let set = PredictionSet::load(&path)?;

    let mut records: Vec<_> = set.records().cloned().collect();
    records.sort_by(|a, b| a.image_path.cmp(&b.image_path));

    emit(format, &records, |r| {
        let label = r.common_name().unwrap_or("-");
        let score = r.top_score.map(|s| format!("{:.0}%", s * 100.0)).unwrap_or_else(|| "-".to_string());
        format!("{}  {} ({}), {} boxes", r.image_path.display(), label, score, r.boxes.len())
    })?;

    for warning in set.warnings() {
        warn!("{}", warning);
    }
    if let Some(source) = set.source() {
        info!("{} predictions from {:?}", set.len(), source);
    }
    Ok(())
}

#[derive(Serialize)]
struct ThumbOutcome {
    path: PathBuf,
    bytes: usize,
    placeholder: bool,
}

async fn run_thumbs(config: AppConfig, folder: &Path, format: &str) -> Result<()> {
    let report = FolderScanner::new(&config.scan).scan(folder)?;
    let cache = ThumbnailCache::new(&config.thumbnails);

    let handles: Vec<_> = report.entries.into_iter()
        .map(|entry| {
            let cache = cache.clone();
            tokio::spawn(async move {
                let result = cache.get_or_create(&entry.path).await;
                (entry.path, result)
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        match handle.await {
            Ok((path, Ok(thumb))) => outcomes.push(ThumbOutcome {
                path,
                bytes: thumb.bytes.len(),
                placeholder: thumb.placeholder,
            }),
            Ok((path, Err(e))) => warn!("No thumbnail for {:?}: {}", path, e),
            Err(e) => warn!("Thumbnail worker failed: {}", e),
        }
    }

    emit(format, &outcomes, |o| {
        let note = if o.placeholder { "  (placeholder)" } else { "" };
        format!("{}  {} bytes{}", o.path.display(), o.bytes, note)
    })?;
    if format == "text" {
        let failed = outcomes.iter().filter(|o| o.placeholder).count();
        println!("\n{} thumbnails, {} unreadable images", outcomes.len(), failed);
    }
    Ok(())
}

const BROWSE_HELP: &str = "\
  n / p          next / previous image
  g <index>      go to image
  1 / 2 / 3      copy image to the bound folder
  b <key> <dir>  bind a folder to a key
  s / m          run SpeciesNet / MegaDetector
  c              cancel the running tool
  i              show predictions for the image
  l              show the log
  u              undo the last copy
  r              rescan the folder
  q              quit";

fn show_current(session: &Session) {
    let Some(entry) = session.current() else {
        println!("(no images)");
        return;
    };
    let label = session.current_prediction()
        .map(|r| {
            let name = r.common_name().unwrap_or("-").to_string();
            match r.top_score {
                Some(score) => format!("  {} {:.0}%", name, score * 100.0),
                None => format!("  {}", name),
            }
        })
        .unwrap_or_default();
    println!("[{}/{}] {}{}", session.cursor() + 1, session.images().len(), entry.file_name(), label);
}

async fn run_browse(config: AppConfig, folder: &Path, config_path: &Path) -> Result<()> {
    let manager = TaskManager::new(&config.tasks);
    let mut events = manager.subscribe();
    let mut session = Session::new(config);
    session.open_folder(folder)?;

    println!("{}", BROWSE_HELP);
    show_current(&session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match browse_command(&mut session, &manager, line.trim(), config_path).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => println!("error: {}", e),
                }
            }
            Some(event) = events.recv() => {
                if let TaskEvent::Log(log) = &event {
                    println!("  | {}", log.text);
                }
                match session.handle_event(&event) {
                    Ok(Reaction::Nothing) => {}
                    Ok(reaction) => {
                        print_reaction(&reaction);
                        show_current(&session);
                    }
                    Err(e) => println!("error: {}", e),
                }
            }
            _ = signal::ctrl_c() => {
                if manager.cancel().is_err() {
                    break;
                }
            }
        }
    }

    if manager.cancel().is_ok() {
        info!("Waiting for the running tool to stop");
        manager.wait_idle().await;
    }
    Ok(())
}

/// Execute one browse command; returns true to quit
async fn browse_command(session: &mut Session, manager: &TaskManager, line: &str, config_path: &Path) -> Result<bool> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(false);
    };

    match command {
        "q" | "quit" => return Ok(true),
        "n" => {
            session.next();
            show_current(session);
        }
        "p" => {
            session.previous();
            show_current(session);
        }
        "g" => {
            let index: usize = parts.next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| WildsortError::Config("usage: g <index>".to_string()))?;
            session.select(index.saturating_sub(1))?;
            show_current(session);
        }
        "1" | "2" | "3" => {
            let key = command.parse::<u8>().unwrap_or_default();
            let result = session.sort_current(key).await?;
            println!("copied to {}", result.destination.display());
        }
        "b" => {
            let key = parts.next().and_then(|s| s.parse::<u8>().ok());
            let dir = parts.next().map(PathBuf::from);
            match (key, dir) {
                (Some(key), Some(dir)) => {
                    session.bind(key, dir)?;
                    session.config().save(config_path)?;
                    println!("key {} -> {}", key, session.binding(key).map(|p| p.display().to_string()).unwrap_or_default());
                }
                _ => println!("usage: b <key> <dir>"),
            }
        }
        "s" | "m" => {
            let tool = if command == "s" { Tool::SpeciesNet } else { Tool::MegaDetector };
            let spec = session.command_for(tool)?;
            let task_id = manager.submit(spec)?;
            session.track(task_id, tool);
            println!("{} started", tool.label());
        }
        "c" => {
            manager.cancel()?;
            println!("cancelling");
        }
        "i" => match session.current_prediction() {
            Some(record) => {
                println!("  prediction: {}", record.top_prediction.as_deref().unwrap_or("-"));
                for b in &record.boxes {
                    println!("  box {} {:.2} at ({:.3}, {:.3}) {:.3}x{:.3}", b.category, b.confidence, b.x, b.y, b.width, b.height);
                }
            }
            None => println!("  no prediction"),
        },
        "l" => {
            for line in session.log().lines() {
                println!("  {}", line);
            }
        }
        "u" => match session.journal().undo_last()? {
            Some(entry) => println!("removed {}", entry.destination.display()),
            None => println!("nothing to undo"),
        },
        "r" => {
            session.rescan()?;
            show_current(session);
        }
        _ => println!("{}", BROWSE_HELP),
    }
    Ok(false)
}

fn run_history_command(config: AppConfig, action: HistoryCommands, format: &str) -> Result<()> {
    let journal = SortJournal::new(config.history.path.clone());

    match action {
        HistoryCommands::List { count } => {
            let entries = journal.get_recent(count)?;
            emit(format, &entries, |entry| {
                let status = if entry.undone { "[UNDONE]" } else { "" };
                format!("  {} {} -> {} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M"),
                    entry.source.display(),
                    entry.destination.display(),
                    status
                )
            })?;
        }
        HistoryCommands::Undo { count, dry_run } => {
            if dry_run {
                let entries = journal.get_undoable()?;
                for entry in entries.iter().rev().take(count) {
                    println!("Would remove: {}", entry.destination.display());
                }
                return Ok(());
            }

            let mut undone = 0;
            for _ in 0..count {
                match journal.undo_last()? {
                    Some(entry) => {
                        println!("Removed: {}", entry.destination.display());
                        undone += 1;
                    }
                    None => break,
                }
            }
            if undone == 0 {
                println!("No copies to undo");
            }
        }
        HistoryCommands::Clear { force } => {
            if !force {
                eprintln!("Use --force to confirm clearing history");
                return Ok(());
            }
            journal.clear()?;
            println!("History cleared: {}", journal.path().display());
        }
    }

    Ok(())
}

fn run_config_command(config: AppConfig, action: ConfigCommands, config_path: &Path) -> Result<()> {
    match action {
        ConfigCommands::Show => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommands::Generate { output } => {
            AppConfig::default().save(&output)?;
            println!("Generated config at {:?}", output);
        }
        ConfigCommands::Validate => {
            config.validate()?;
            println!("Configuration at {:?} is valid", config_path);
            println!("  Python: {}", config.tools.python);
            println!("  Country: {}", config.tools.country);
            println!("  Bindings: {}", config.bindings.len());
        }
        ConfigCommands::Edit => {
            let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
            std::process::Command::new(editor)
                .arg(config_path)
                .status()?;
        }
    }

    Ok(())
}

fn run_init(dir: Option<PathBuf>, force: bool) -> Result<()> {
    let target = dir.unwrap_or_else(|| PathBuf::from("."));
    let config_path = target.join("wildsort.json");

    if config_path.exists() && !force {
        return Err(WildsortError::Config(
            "wildsort.json already exists. Use --force to overwrite".to_string()
        ));
    }

    let mut config = AppConfig::default();
    for key in BINDING_KEYS {
        let folder = target.join("sorted").join(format!("key{}", key));
        std::fs::create_dir_all(&folder)?;
        config.set_binding(key, folder)?;
    }
    config.history.path = target.join("wildsort_history.jsonl");
    config.save(&config_path)?;

    println!("Wildsort initialized in {:?}", target);
    println!("\nCreated:");
    println!("  - wildsort.json");
    println!("  - sorted/key1, sorted/key2, sorted/key3");
    println!("\nNext steps:");
    println!("  1. Browse a folder: wildsort browse <folder>");
    println!("  2. Run detection:   wildsort analyze <folder> --tool speciesnet");

    Ok(())
}
