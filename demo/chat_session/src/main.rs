use std::sync::Arc;

use parley_core::storage::{InMemoryDurableStore, InMemoryFastStore};
use parley_core::telemetry::init_logging;
use parley_core::{EchoConnectorFactory, ModelConfig, Parley, SessionConfig, SessionStore};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

const HELP: &str = "commands: /history /tokens /stats /reset /model <name> /quit";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    // Defaults + env + optional TOML overlay
    let config = SessionConfig::load();
    let fast_ttl = config.session_ttl();

    let store = Arc::new(
        SessionStore::new(InMemoryDurableStore::new())
            .with_fast_store(InMemoryFastStore::new(), fast_ttl),
    );
    let parley = Parley::new(config, store, Arc::new(EchoConnectorFactory))?;
    parley.start().await?;

    // Mirror every session event into the log
    let mut events = parley.events.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            debug!(target: "chat_session", event = %event.name, payload = %event.payload, "event");
        }
    });

    let session = parley.sessions.create_or_get(None).await?;
    info!(target: "chat_session", session_id = %session.id(), "Session ready");
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/history", _) => {
                for message in session.history().await {
                    println!("{:>9}: {}", message.role, message.text().unwrap_or("<non-text>"));
                }
            }
            ("/tokens", _) => {
                let usage = session.usage().await;
                println!(
                    "tokens={:?} budget={:?} messages={}",
                    usage.tokens, usage.max_tokens, usage.messages
                );
            }
            ("/stats", _) => {
                let stats = parley.sessions.stats().await?;
                println!(
                    "total={} in_memory={} max={} ttl={:?}",
                    stats.total, stats.in_memory, stats.max_sessions, stats.ttl
                );
            }
            ("/reset", _) => session.reset().await?,
            ("/model", name) if !name.is_empty() => {
                let model = ModelConfig::new("echo", name);
                if let Err(e) = parley.sessions.switch_model(session.id(), model).await {
                    warn!(target: "chat_session", error = %e, "Model switch failed");
                }
            }
            (command, _) if command.starts_with('/') => println!("{HELP}"),
            _ => match session.run(line).await {
                Ok(reply) => println!("{reply}"),
                Err(e) => warn!(target: "chat_session", error = %e, "Run failed"),
            },
        }
    }

    parley.sessions.end(session.id()).await?;
    parley.shutdown().await?;
    event_log.abort();

    info!(target: "chat_session", "Bye");
    Ok(())
}
