//! Command-line front end for cinch-context.
//!
//! Runs the engines over files on disk, mostly to inspect what they decide.
//! Logs go to stderr; set `RUST_LOG=cinch_context=debug` to see decisions.
//!
//! # Examples
//!
//! ```sh
//! # Replay a transcript, compacting as the manager would, and save the session
//! cinch-context compact transcript.json --out session.json
//!
//! # Rank files against a query
//! cinch-context score --query "token budget compression" src/budget.rs src/main.rs
//!
//! # Load a byte range of a large file
//! cinch-context load logs/big.log --start 4096 --end 8192
//!
//! # Print the config file schema
//! cinch-context schema
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use cinch_context::prelude::*;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Context window management for coding agents.
#[derive(Parser)]
#[command(name = "cinch-context")]
struct Cli {
    /// JSON config file. Missing fields take their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a transcript through the manager and report what was compacted.
    Compact {
        /// JSON array of `{"user": ..., "assistant": ..., "tool_calls": [...]}`.
        transcript: PathBuf,

        /// Write the resulting session snapshot here.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Run a final compaction pass even if no threshold was reached.
        #[arg(long)]
        force: bool,
    },
    /// Rank files by relevance to a query.
    Score {
        #[arg(long)]
        query: String,

        /// Root directory the files are relative to.
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Show only the top N.
        #[arg(long)]
        top: Option<usize>,

        files: Vec<String>,
    },
    /// Load a file (or a range of it) through the incremental loader.
    Load {
        uri: String,

        #[arg(long, default_value = ".")]
        root: PathBuf,

        #[arg(long, requires = "end")]
        start: Option<u64>,

        #[arg(long, requires = "start")]
        end: Option<u64>,

        /// background, low, normal, high or critical.
        #[arg(long, default_value = "normal", value_parser = parse_priority)]
        priority: LoadPriority,

        /// Print the loaded content.
        #[arg(long)]
        print: bool,
    },
    /// Print the JSON Schema of the config file.
    Schema,
}

#[derive(Deserialize)]
struct TranscriptTurn {
    user: String,
    assistant: String,
    #[serde(default)]
    tool_calls: Vec<ToolCallRecord>,
}

fn parse_priority(s: &str) -> Result<LoadPriority, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("unknown priority '{s}'"))
}

fn load_config(path: Option<&PathBuf>) -> Result<ContextConfig, String> {
    match path {
        Some(path) => ContextConfig::from_file(path).map_err(|e| e.to_string()),
        None => Ok(ContextConfig::default()),
    }
}

fn compact(
    config: ContextConfig,
    transcript: PathBuf,
    out: Option<PathBuf>,
    force: bool,
) -> Result<(), String> {
    let json = std::fs::read_to_string(&transcript)
        .map_err(|e| format!("failed to read {}: {e}", transcript.display()))?;
    let turns: Vec<TranscriptTurn> =
        serde_json::from_str(&json).map_err(|e| format!("invalid transcript: {e}"))?;

    let root = transcript
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let manager = ContextManager::new(config, Arc::new(FsContentSource::new(root)))
        .with_event_sink(Arc::new(LoggingSink));

    let mut passes = 0;
    for turn in turns {
        let report = manager.process_turn(
            Turn::new(turn.user, turn.assistant).with_tool_calls(turn.tool_calls),
        );
        if report.compaction.is_some() {
            passes += 1;
        }
        if let Some(warning) = &report.warning {
            eprintln!("round {}: {}", report.round_index, warning.message);
        }
    }
    if force && manager.compact().is_some() {
        passes += 1;
    }

    let rounds = manager.compaction().rounds();
    let compacted = rounds.iter().filter(|r| r.is_compacted()).count();
    println!("Rounds:      {} ({} compacted)", rounds.len(), compacted);
    println!("Passes:      {passes}");
    println!("Est. tokens: {}", manager.compaction().estimate_total_tokens());
    println!("{}", manager.budget().snapshot().to_log_string());
    let critical = manager.critical_context();
    if !critical.is_empty() {
        println!("\n{critical}");
    }

    if let Some(out) = out {
        let snapshot = manager.snapshot().to_json().map_err(|e| e.to_string())?;
        std::fs::write(&out, snapshot)
            .map_err(|e| format!("failed to write {}: {e}", out.display()))?;
        eprintln!("Session written to {}", out.display());
    }
    Ok(())
}

async fn score(
    config: ContextConfig,
    query: String,
    root: PathBuf,
    top: Option<usize>,
    files: Vec<String>,
) -> Result<(), String> {
    if files.is_empty() {
        return Err("no files given".into());
    }
    let loader = IncrementalLoader::new(config.loader, Arc::new(FsContentSource::new(root)));
    let scorer = RelevanceScorer::new(config.scorer);

    let requests = files.iter().map(LoadRequest::new).collect();
    for (uri, result) in files.iter().zip(loader.load_files(requests).await) {
        match result {
            Ok(loaded) => {
                scorer.track_item(uri, ItemType::File, &loaded.file.text(), HashMap::new());
            }
            Err(e) => eprintln!("skipping {uri}: {e}"),
        }
    }
    scorer.update_query_context(&query, &[]);

    let ranked = match top {
        Some(n) => scorer.most_relevant(n),
        None => scorer.all_scores(),
    };
    println!("{:>6}  {:>6}  {:>6}  {:>6}  item", "final", "time", "sim", "use");
    for item in ranked {
        let s = &item.score;
        println!(
            "{:>6.3}  {:>6.3}  {:>6.3}  {:>6.3}  {}",
            s.final_score, s.temporal, s.semantic, s.interaction, item.id
        );
    }
    Ok(())
}

async fn load(
    config: ContextConfig,
    uri: String,
    root: PathBuf,
    range: Option<(u64, u64)>,
    priority: LoadPriority,
    print: bool,
) -> Result<(), String> {
    let loader = IncrementalLoader::new(config.loader, Arc::new(FsContentSource::new(root)));
    let mut request = LoadRequest::new(uri).with_priority(priority);
    if let Some((start, end)) = range {
        request = request.with_range(start, end);
    }
    let result = loader.load_file(request).await.map_err(|e| e.to_string())?;
    let file = &result.file;

    println!("URI:       {}", file.uri);
    println!("Size:      {} bytes", file.total_size);
    println!("Strategy:  {}", file.strategy);
    match file.loaded_range {
        Some(r) => println!("Loaded:    {}..{} ({} bytes)", r.start, r.end, r.len()),
        None => println!("Loaded:    whole file"),
    }
    if let Some(chunks) = &file.chunks {
        println!("Chunks:    {:?} of {}", chunks.loaded, chunks.total_chunks);
    }
    println!("Est. tokens: {}", file.estimated_tokens());
    if print {
        println!("\n{}", file.text());
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Command::Compact {
            transcript,
            out,
            force,
        } => compact(config, transcript, out, force),
        Command::Score {
            query,
            root,
            top,
            files,
        } => score(config, query, root, top, files).await,
        Command::Load {
            uri,
            root,
            start,
            end,
            priority,
            print,
        } => load(config, uri, root, start.zip(end), priority, print).await,
        Command::Schema => {
            let schema = serde_json::to_string_pretty(&ContextConfig::schema_json())
                .map_err(|e| e.to_string())?;
            println!("{schema}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
