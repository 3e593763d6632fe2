//! # linesync CLI
//!
//! Command-line utilities for inspecting persisted replicas.

use anyhow::{bail, Context, Result};
use linesync_agent::persistence::DEFAULT_SNAPSHOT_KEY;
use linesync_agent::{PersistenceStore, SqliteStore};
use linesync_core::{buffer_text, fingerprint, Document, LINES_CONTAINER};
use std::env;
use std::path::Path;
use uuid::Uuid;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "inspect" => {
            let Some(db_path) = args.get(2) else {
                eprintln!("Usage: linesync inspect <db-path> [key] [--json]");
                std::process::exit(1);
            };
            let json = args.iter().skip(3).any(|arg| arg == "--json");
            let key = args
                .iter()
                .skip(3)
                .find(|arg| !arg.starts_with("--"))
                .map_or(DEFAULT_SNAPSHOT_KEY, String::as_str);
            inspect(Path::new(db_path), key, json)?;
        }
        "fingerprint" => {
            if args.len() < 3 {
                eprintln!("Usage: linesync fingerprint <line>");
                std::process::exit(1);
            }
            let line = args[2..].join(" ");
            println!("{}", fingerprint(&line));
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn inspect(db_path: &Path, key: &str, json: bool) -> Result<()> {
    if !db_path.exists() {
        bail!("No database at {}", db_path.display());
    }
    let store = SqliteStore::open(db_path)
        .with_context(|| format!("Failed to open {}", db_path.display()))?;
    let updated_at = store.updated_at(key).context("Failed to query snapshot")?;
    let persistence = PersistenceStore::new(Box::new(store), key);

    let Some(snapshot) = persistence
        .load_snapshot()
        .context("Failed to read snapshot")?
    else {
        bail!("No snapshot stored under '{key}'");
    };

    let mut doc = Document::new(Uuid::new_v4());
    doc.import(&snapshot).context("Snapshot is not a valid document")?;

    if json {
        let value = doc.deep_value(LINES_CONTAINER);
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("Failed to render JSON")?
        );
        return Ok(());
    }

    println!("key:            {key}");
    if let Some(ts) = updated_at.and_then(|secs| chrono::DateTime::from_timestamp(secs, 0)) {
        println!("updated:        {}", ts.to_rfc3339());
    }
    println!("size:           {} bytes", snapshot.len());
    println!("lines:          {}", doc.len(LINES_CONTAINER));
    println!("version vector: {}", doc.version_vector_display());
    println!("---");
    println!("{}", buffer_text(&doc));

    Ok(())
}

fn print_help() {
    println!(
        r"linesync CLI

USAGE:
    linesync <COMMAND> [OPTIONS]

COMMANDS:
    inspect <db-path> [key] [--json]  Show a persisted replica snapshot
    fingerprint <line>                Print the fingerprint of a line
    help                              Show this help message
"
    );
}
