//! CLI binary for mobibot-pipeline.
//!
//! Inspects the checkpoint directory that pipeline runs write to: list
//! runs, find the latest run of a job, and show what a run produced.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use mobibot_pipeline::checkpoint::kind_of;
use mobibot_pipeline::config::DEFAULT_CHECKPOINT_DIR;
use mobibot_pipeline::{CheckpointStore, ExecutionTimes, Query};
use serde_json::{Map, Value};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Every checkpoint, newest first
  mobibot list

  # Only video jobs, from another directory
  mobibot --dir /srv/mobibot/data list --kind video

  # Latest run of one job (values are JSON, falling back to plain strings)
  mobibot latest --kind video --where url=https://youtu.be/abc123

  # Which fields a run produced
  mobibot show pipeline_state_video_0b1c….json --summary

  # Where the time went
  mobibot times pipeline_state_video_0b1c….json

ENVIRONMENT VARIABLES:
  MOBIBOT_CHECKPOINT_DIR  Checkpoint directory (default: data)
  RUST_LOG                Log filter, overrides --verbose / --quiet
"#;

/// Inspect mobibot pipeline checkpoints.
#[derive(Parser, Debug)]
#[command(
    name = "mobibot",
    version,
    about = "Inspect mobibot pipeline checkpoints",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Directory holding pipeline_state_*.json files.
    #[arg(long, env = "MOBIBOT_CHECKPOINT_DIR", default_value = DEFAULT_CHECKPOINT_DIR, global = true)]
    dir: PathBuf,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "MOBIBOT_VERBOSE", global = true)]
    verbose: bool,

    /// Suppress all logs except errors.
    #[arg(short, long, env = "MOBIBOT_QUIET", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List checkpoints, newest first.
    List {
        /// Only this document kind (case-insensitive).
        #[arg(long)]
        kind: Option<String>,
    },

    /// Print the newest checkpoint whose fields match every --where.
    Latest {
        /// Document kind (case-insensitive).
        #[arg(long)]
        kind: String,

        /// field=value; repeatable.
        #[arg(long = "where", value_name = "FIELD=VALUE", value_parser = parse_condition)]
        conditions: Vec<(String, Value)>,
    },

    /// Print a checkpoint's snapshot.
    Show {
        file: PathBuf,

        /// One line per field: set or unset, with a short preview.
        #[arg(long)]
        summary: bool,
    },

    /// Print recorded stage timings, slowest first.
    Times { file: PathBuf },
}

/// Parse `field=value`; the value is JSON when it parses as JSON.
fn parse_condition(s: &str) -> Result<(String, Value), String> {
    let (field, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected FIELD=VALUE, got '{s}'"))?;
    if field.is_empty() {
        return Err(format!("empty field name in '{s}'"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((field.to_string(), value))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let store = CheckpointStore::new(&cli.dir);

    match cli.command {
        Command::List { kind } => {
            let entries = store
                .list(kind.as_deref())
                .with_context(|| format!("Failed to list checkpoints in {}", cli.dir.display()))?;
            if entries.is_empty() {
                eprintln!("no checkpoints in {}", cli.dir.display());
            }
            for entry in entries {
                println!(
                    "{}  {:<14}  {}",
                    dim(&timestamp(entry.created)),
                    entry.kind,
                    file_name(&entry.path)
                );
            }
        }

        Command::Latest { kind, conditions } => {
            let query: Query = conditions.into_iter().collect();
            match store
                .latest_of_kind(&kind, &query)
                .context("Checkpoint query failed")?
            {
                Some(entry) => println!("{}", entry.path.display()),
                None => println!("no checkpoint"),
            }
        }

        Command::Show { file, summary } => {
            let (path, snapshot) = load(&store, &file)?;
            if summary {
                println!("{}", bold(&path.display().to_string()));
                print_summary(&snapshot);
            } else {
                let json = serde_json::to_string_pretty(&snapshot)
                    .context("Failed to serialise snapshot")?;
                println!("{json}");
            }
        }

        Command::Times { file } => {
            let (_, snapshot) = load(&store, &file)?;
            let times: ExecutionTimes = match snapshot.get("execution_times") {
                Some(v) => serde_json::from_value(v.clone())
                    .context("execution_times is not a stage → seconds map")?,
                None => ExecutionTimes::default(),
            };
            if times.is_empty() {
                println!("no stage timings recorded");
            }
            let total: f64 = times.iter().map(|(_, s)| s).sum();
            for (stage, secs) in times.slowest_first() {
                println!("{:>9.2}s  {}", secs, stage);
            }
            if !times.is_empty() {
                println!("{}", green(&format!("{total:>9.2}s  total")));
            }
        }
    }

    Ok(())
}

fn load(store: &CheckpointStore, file: &Path) -> Result<(PathBuf, Map<String, Value>)> {
    let path = store.resolve(file)?;
    let Some(kind) = kind_of(&path) else {
        bail!("{} is not named like a checkpoint (pipeline_state_<kind>_<id>.json)", path.display());
    };
    let snapshot = store
        .load_snapshot(kind, &path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok((path, snapshot))
}

fn print_summary(snapshot: &Map<String, Value>) {
    let width = snapshot.keys().map(String::len).max().unwrap_or(0);
    for (field, value) in snapshot {
        if value.is_null() {
            println!("  {:<width$}  {}", field, dim("unset"));
        } else {
            println!("  {:<width$}  {}  {}", field, green("set"), dim(&preview(value, 60)));
        }
    }
}

fn preview(value: &Value, max_chars: usize) -> String {
    let text = match value {
        Value::Array(items) => format!("[{} items]", items.len()),
        Value::Object(map) => format!("{{{} keys}}", map.len()),
        other => other.to_string(),
    };
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}\u{2026}", &text[..cut]),
        None => text,
    }
}

fn timestamp(t: SystemTime) -> String {
    DateTime::<Local>::from(t)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conditions_parse_json_then_string() {
        assert_eq!(parse_condition("pages=12").unwrap(), ("pages".into(), json!(12)));
        assert_eq!(
            parse_condition("url=https://x/y?a=b").unwrap(),
            ("url".into(), json!("https://x/y?a=b"))
        );
        assert_eq!(parse_condition("title=null").unwrap().1, Value::Null);
        assert!(parse_condition("novalue").is_err());
        assert!(parse_condition("=1").is_err());
    }

    #[test]
    fn preview_shortens_collections() {
        assert_eq!(preview(&json!([1, 2, 3]), 60), "[3 items]");
        assert_eq!(preview(&json!("abcdef"), 3), "\"ab\u{2026}");
    }

    #[test]
    fn cli_parses_repeated_where() {
        let cli = Cli::try_parse_from([
            "mobibot", "latest", "--kind", "video", "--where", "url=u", "--where", "lang=\"en\"",
        ])
        .unwrap();
        match cli.command {
            Command::Latest { kind, conditions } => {
                assert_eq!(kind, "video");
                assert_eq!(conditions.len(), 2);
                assert_eq!(conditions[1], ("lang".into(), json!("en")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
