//! # linesync Agent
//!
//! Runs one replica of the shared line document, synchronised over MQTT.
//! Edits are entered as commands on stdin.

use anyhow::{Context, Result};
use linesync_agent::{open_store, MqttTransport, PersistenceStore, Replica, ReplicaConfig};
use linesync_core::LINES_CONTAINER;
use linesync_proto::TopicScheme;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const CATCH_UP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting linesync agent"
    );

    let config = ReplicaConfig::from_env()?;
    let replica_id = config.replica_id.unwrap_or_else(Uuid::new_v4);

    let store = open_store(&config.persistence.store_type, &config.persistence.db_path)
        .context("Failed to open snapshot store")?;
    let persistence = PersistenceStore::new(store, config.persistence.snapshot_key.clone())
        .with_history(config.persistence.persist_history);

    let (transport, mut eventloop) = MqttTransport::connect(
        &config.sync.mqtt_broker,
        &format!("linesync-{replica_id}"),
        TopicScheme::new(&config.sync.channel),
    )
    .context("Failed to create MQTT transport")?;
    transport.subscribe().await?;
    let topics = transport.topics().clone();

    let mut replica = Replica::open(
        replica_id,
        persistence,
        Box::new(transport.clone()),
        config.sync.anti_entropy_on_start,
    );

    tracing::info!(%replica_id, channel = %config.sync.channel, "Replica running, press Ctrl+C to stop");
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut catch_up = tokio::time::interval(CATCH_UP_INTERVAL);
    catch_up.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = eventloop.poll() => {
                match event {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                        if !topics.is_sync(&publish.topic) {
                            continue;
                        }
                        tracing::debug!(
                            topic = %publish.topic,
                            payload_len = publish.payload.len(),
                            "Received sync message"
                        );
                        // Failures are logged by the replica.
                        let _ = replica.receive(&publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "MQTT error");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }

            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) => run_command(&mut replica, line.trim()),
                    None => break,
                }
            }

            _ = catch_up.tick() => {
                // Retry while ops are missing; a lost response would otherwise stall.
                if replica.document().pending_changes() > 0 {
                    if let Err(err) = replica.request_catch_up() {
                        tracing::warn!(error = %err, "Failed to request catch-up");
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    replica.close();
    if let Err(err) = transport.disconnect() {
        tracing::debug!(error = %err, "Disconnect failed");
    }
    tracing::info!("Agent stopped");
    Ok(())
}

fn run_command(replica: &mut Replica, line: &str) {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "show" => println!("{}", replica.buffer_text()),
        "set" => report(replica.apply_edited_buffer(&rest.replace("\\n", "\n"))),
        "append" => {
            let mut text = replica.buffer_text();
            if !replica.document().is_empty(LINES_CONTAINER) {
                text.push('\n');
            }
            text.push_str(rest);
            report(replica.apply_edited_buffer(&text));
        }
        "versions" => {
            let (min, max) = replica.version_range();
            println!(
                "range {min}..={max}, current {}",
                replica.current_version()
            );
        }
        "checkout" => match rest.trim().parse::<i64>() {
            Ok(index) => match replica.select_version(index) {
                Ok(position) => {
                    println!("{position:?}");
                    println!("{}", replica.buffer_text());
                }
                Err(err) => println!("error: {err}"),
            },
            Err(_) => println!("usage: checkout <index>"),
        },
        "vv" => match replica.document_size_bytes() {
            Ok(size) => println!("{} ({size} bytes)", replica.version_vector_display()),
            Err(err) => println!("error: {err}"),
        },
        "sync" => match replica.request_catch_up() {
            Ok(()) => println!("catch-up requested"),
            Err(err) => println!("error: {err}"),
        },
        "clear" => match replica.clear_and_reset() {
            Ok(()) => println!("cleared, new replica id {}", replica.replica_id()),
            Err(err) => println!("error: {err}"),
        },
        "help" => print_help(),
        other => println!("unknown command '{other}', try 'help'"),
    }
}

fn report(result: Result<bool, linesync_agent::ReplicaError>) {
    match result {
        Ok(true) => println!("committed"),
        Ok(false) => println!("no change"),
        Err(err) => println!("error: {err}"),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  show               Print the document");
    println!("  set <text>         Replace the document (\\n separates lines)");
    println!("  append <line>      Append a line");
    println!("  versions           Show the selectable version range");
    println!("  checkout <index>   Select a version (-1 = empty, last = live)");
    println!("  vv                 Show version vector and document size");
    println!("  sync               Ask peers for missed changes");
    println!("  clear              Erase everything and start over");
    println!("  help               Show this help");
}
