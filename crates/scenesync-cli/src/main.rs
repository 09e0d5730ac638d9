//! # scenesync CLI
//!
//! Command-line utilities for inspecting local state and debugging framing.

use anyhow::{bail, Context, Result};
use scenesync_client::SqliteRepository;
use scenesync_core::{DeltasRepository, MetadataRepository};
use scenesync_proto::{split_payload, MessageType, RawMessage, Reassembler, MAX_MESSAGE_SIZE};
use std::env;
use std::path::Path;
use std::time::Instant;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "inspect" => {
            if args.len() < 3 {
                eprintln!("Usage: scenesync inspect <db> [room]");
                std::process::exit(1);
            }
            inspect(Path::new(&args[2]), args.get(3).map(String::as_str))?;
        }
        "chunk" => {
            if args.len() < 3 {
                eprintln!("Usage: scenesync chunk <file> [--limit N]");
                std::process::exit(1);
            }
            let limit = parse_limit(&args[3..])?;
            chunk(Path::new(&args[2]), limit)?;
        }
        "reassemble" => {
            if args.len() < 3 {
                eprintln!("Usage: scenesync reassemble <file>");
                std::process::exit(1);
            }
            reassemble(Path::new(&args[2]))?;
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

fn parse_limit(args: &[String]) -> Result<usize> {
    match args {
        [] => Ok(MAX_MESSAGE_SIZE),
        [flag, value] if flag == "--limit" => {
            let limit: usize = value.parse().with_context(|| format!("Invalid limit '{value}'"))?;
            if limit == 0 {
                bail!("Limit must be positive");
            }
            Ok(limit)
        }
        other => bail!("Unexpected arguments: {}", other.join(" ")),
    }
}

fn inspect(db: &Path, room: Option<&str>) -> Result<()> {
    let store = SqliteRepository::open(db)
        .with_context(|| format!("Failed to open SQLite database at {}", db.display()))?;

    let Some(room) = room else {
        for room in store.rooms().context("Failed to list rooms")? {
            println!("{room}");
        }
        return Ok(());
    };

    let version = store
        .load_metadata(room)
        .context("Failed to read sync metadata")?
        .map_or(0, |metadata| metadata.last_acknowledged_version);
    let deltas = store.load_deltas(room).context("Failed to read queued deltas")?;

    println!("room: {room}");
    println!("last acknowledged version: {version}");
    println!("queued deltas: {}", deltas.len());
    for delta in &deltas {
        let size = serde_json::to_string(&delta.payload)
            .map(|json| json.len())
            .unwrap_or_default();
        println!("  {}  {}  {size} bytes", delta.id, delta.created_at.to_rfc3339());
    }

    Ok(())
}

fn chunk(file: &Path, limit: usize) -> Result<()> {
    let input = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let message: RawMessage =
        serde_json::from_str(&input).context("Expected a {\"type\", \"payload\"} message")?;

    let Some(message_type) = MessageType::parse(&message.message_type) else {
        bail!("Unknown message type '{}'", message.message_type);
    };

    let payload = serde_json::to_string(&message.payload).context("Failed to encode payload")?;
    for envelope in split_payload(message_type, &payload, limit) {
        println!("{}", envelope.to_json()?);
    }

    Ok(())
}

fn reassemble(file: &Path) -> Result<()> {
    let input = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let mut reassembler = Reassembler::default();
    let now = Instant::now();

    for (index, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match reassembler.accept_raw_at(line, now) {
            Ok(Some(message)) => println!("{}", serde_json::to_string(&message)?),
            Ok(None) => {}
            Err(err) => bail!("Line {}: {err}", index + 1),
        }
    }

    if reassembler.pending() > 0 {
        eprintln!("{} incomplete chunk group(s)", reassembler.pending());
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"scenesync CLI

USAGE:
    scenesync <COMMAND> [OPTIONS]

COMMANDS:
    inspect <db> [room]             List rooms, or show a room's resume point and queue
    chunk <file> [--limit N]        Frame a {{"type", "payload"}} message into envelopes
    reassemble <file>               Rebuild messages from envelopes, one per line
    help                            Show this help message

EXAMPLES:
    scenesync inspect ./scenesync.db my-room
    scenesync chunk message.json --limit 1024 > frames.jsonl
    scenesync reassemble frames.jsonl
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_parses() {
        assert_eq!(parse_limit(&[]).unwrap(), MAX_MESSAGE_SIZE);
        assert_eq!(
            parse_limit(&["--limit".to_string(), "64".to_string()]).unwrap(),
            64
        );
        assert!(parse_limit(&["--limit".to_string(), "0".to_string()]).is_err());
        assert!(parse_limit(&["--size".to_string(), "64".to_string()]).is_err());
    }
}
