//! Tessera command-line tool.
//!
//! Usage:
//!   # Run the server with the default five seed records
//!   tessera serve
//!   tessera serve --bind 0.0.0.0:9000 --no-seed --seed groceries --seed chores
//!
//!   # Follow the shared list, printing it on every change
//!   tessera watch --url ws://127.0.0.1:8080/channel
//!
//!   # One-shot edits
//!   tessera add "buy milk"
//!   tessera update 6f1c...e2 "buy oat milk"
//!   tessera delete 6f1c...e2
//!
//! Log verbosity follows `RUST_LOG` and defaults to `info`.

use std::error::Error;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use log::{info, warn};
use tessera_sync::{
    ClientConfig, ClientConnection, Intent, Notification, NotificationStream, Reconciler,
    Record, ServerConfig, SessionEnd, SyncServer,
};
use uuid::Uuid;

/// How long one-shot commands wait for the server to confirm an edit.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Real-time shared record list.
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(about = "Real-time shared record list over WebSocket")]
struct Cli {
    /// Channel URL used by client commands
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the authoritative server
    Serve {
        /// Address to listen on
        #[arg(long)]
        bind: Option<String>,

        /// Request path of the channel endpoint
        #[arg(long)]
        path: Option<String>,

        /// Outbound frames buffered per connection
        #[arg(long)]
        capacity: Option<usize>,

        /// Seed record text, repeatable, replaces the default seed
        #[arg(long)]
        seed: Vec<String>,

        /// Start with an empty store
        #[arg(long, conflicts_with = "seed")]
        no_seed: bool,
    },
    /// Print the list every time it changes
    Watch,
    /// Append a record
    Add { text: String },
    /// Replace a record's text
    Update { id: Uuid, text: String },
    /// Remove a record
    Delete { id: Uuid },
}

impl Command {
    fn server_config(
        bind: Option<String>,
        path: Option<String>,
        capacity: Option<usize>,
        seed: Vec<String>,
        no_seed: bool,
    ) -> ServerConfig {
        let mut config = ServerConfig::default();
        if let Some(bind) = bind {
            config.bind_addr = bind;
        }
        if let Some(path) = path {
            config.channel_path = path;
        }
        if let Some(capacity) = capacity {
            config.outbound_capacity = capacity.max(1);
        }
        if no_seed {
            config.seed.clear();
        } else if !seed.is_empty() {
            config.seed = seed;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let client = cli.url.map(ClientConfig::new).unwrap_or_default();

    match cli.command {
        Command::Serve {
            bind,
            path,
            capacity,
            seed,
            no_seed,
        } => serve(Command::server_config(bind, path, capacity, seed, no_seed)).await,
        Command::Watch => watch(client).await,
        Command::Add { text } => edit(&client, Intent::add(text)).await,
        Command::Update { id, text } => edit(&client, Intent::update(id, text)).await,
        Command::Delete { id } => edit(&client, Intent::delete(id)).await,
    }
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn Error>> {
    let server = SyncServer::new(config);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats();
            info!(
                "Shutting down: {} connection(s) served, {} intent(s) applied",
                stats.total_connections, stats.intents_applied
            );
        }
    }
    Ok(())
}

async fn watch(config: ClientConfig) -> Result<(), Box<dyn Error>> {
    let mut reconciler = Reconciler::new(config);
    let mut view = reconciler.subscribe();
    reconciler.connect().await?;

    let mut poll = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                print_records(view.borrow_and_update().records());
            }
            _ = poll.tick() => {
                if !reconciler.is_running() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                reconciler.disconnect();
                return Ok(());
            }
        }
    }

    match reconciler.finished().await {
        Some(SessionEnd::Failed(e)) => Err(e.into()),
        Some(SessionEnd::Graceful) => {
            info!("Server closed the channel");
            Ok(())
        }
        Some(SessionEnd::Cancelled) | None => Ok(()),
    }
}

/// Send one intent and wait until its notification comes back.
async fn edit(config: &ClientConfig, intent: Intent) -> Result<(), Box<dyn Error>> {
    let mut connection = ClientConnection::open(&config.url).await?;
    let mut stream = connection.receive()?;

    let records = match next(&mut stream).await? {
        Some(Notification::Snapshot { records }) => records,
        other => return Err(format!("expected a snapshot, got {other:?}").into()),
    };
    if let Intent::Update { id, .. } | Intent::Delete { id } = &intent {
        if !records.iter().any(|r| r.id == *id) {
            connection.close();
            return Err(format!("record {id} not found").into());
        }
    }

    connection.send(&intent).await?;
    let confirmed = tokio::time::timeout(CONFIRM_TIMEOUT, confirmation(&mut stream, &intent)).await;
    connection.close();

    match confirmed {
        Ok(Ok(notification)) => {
            if let Some(record) = notification.record() {
                println!("{} {}", notification.kind(), format_record(record));
            }
            if matches!(intent, Intent::Add { .. }) {
                println!("(matched by text: a concurrent add of the same text may be reported instead)");
            }
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            warn!("No confirmation within {CONFIRM_TIMEOUT:?}, the record may have been removed concurrently");
            Ok(())
        }
    }
}

async fn confirmation(
    stream: &mut NotificationStream,
    intent: &Intent,
) -> Result<Notification, Box<dyn Error>> {
    while let Some(notification) = next(stream).await? {
        if confirms(intent, &notification) {
            return Ok(notification);
        }
    }
    Err("channel closed before the edit was confirmed".into())
}

async fn next(stream: &mut NotificationStream) -> Result<Option<Notification>, Box<dyn Error>> {
    match stream.next().await {
        Some(Ok(notification)) => Ok(Some(notification)),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

/// Whether `notification` is the server's answer to `intent`.
///
/// Adds carry no client-chosen id, so the first `Added` with the same text
/// is taken as ours. Another client adding identical text at the same time
/// can be reported in place of this one; `edit` says so in its output.
fn confirms(intent: &Intent, notification: &Notification) -> bool {
    match (intent, notification) {
        (Intent::Add { text }, Notification::Added { record }) => record.text == *text,
        (Intent::Update { id, text }, Notification::Updated { record }) => {
            record.id == *id && record.text == *text
        }
        (Intent::Delete { id }, Notification::Deleted { record }) => record.id == *id,
        _ => false,
    }
}

fn format_record(record: &Record) -> String {
    format!("{}  {}", record.id, record.text)
}

fn print_records(records: &[Record]) {
    println!("--- {} record(s)", records.len());
    for record in records {
        println!("{}", format_record(record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["tessera", "serve"]).unwrap();
        let Command::Serve {
            bind,
            path,
            capacity,
            seed,
            no_seed,
        } = cli.command
        else {
            panic!("Expected serve");
        };
        let config = Command::server_config(bind, path, capacity, seed, no_seed);
        let defaults = ServerConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.channel_path, "/channel");
        assert_eq!(config.seed.len(), 5);
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::try_parse_from([
            "tessera", "serve", "--bind", "0.0.0.0:9000", "--capacity", "8", "--seed", "x",
            "--seed", "y",
        ])
        .unwrap();
        let Command::Serve {
            bind,
            path,
            capacity,
            seed,
            no_seed,
        } = cli.command
        else {
            panic!("Expected serve");
        };
        let config = Command::server_config(bind, path, capacity, seed, no_seed);
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.outbound_capacity, 8);
        assert_eq!(config.seed, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_no_seed_conflicts_with_seed() {
        assert!(Cli::try_parse_from(["tessera", "serve", "--no-seed", "--seed", "x"]).is_err());
        let cli = Cli::try_parse_from(["tessera", "serve", "--no-seed"]).unwrap();
        let Command::Serve { no_seed, .. } = cli.command else {
            panic!("Expected serve");
        };
        assert!(no_seed);
    }

    #[test]
    fn test_update_requires_uuid() {
        assert!(Cli::try_parse_from(["tessera", "update", "not-a-uuid", "x"]).is_err());
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from(["tessera", "update", &id.to_string(), "x"]).unwrap();
        assert!(matches!(cli.command, Command::Update { id: parsed, .. } if parsed == id));
    }

    #[test]
    fn test_global_url() {
        let cli = Cli::try_parse_from(["tessera", "add", "milk", "--url", "ws://h:1/c"]).unwrap();
        assert_eq!(cli.url.as_deref(), Some("ws://h:1/c"));
    }

    #[test]
    fn test_confirms_matches_only_own_edit() {
        let id = Uuid::new_v4();
        let updated = Notification::Updated {
            record: Record::new(id, "x"),
        };
        assert!(confirms(&Intent::update(id, "x"), &updated));
        assert!(!confirms(&Intent::update(id, "y"), &updated));
        assert!(!confirms(&Intent::delete(id), &updated));
        assert!(confirms(
            &Intent::delete(id),
            &Notification::Deleted {
                record: Record::new(id, "x")
            }
        ));
    }

    #[test]
    fn test_add_is_confirmed_by_text_alone() {
        let add = Intent::add("milk");
        let theirs = Notification::Added {
            record: Record::new(Uuid::new_v4(), "milk"),
        };
        let other = Notification::Added {
            record: Record::new(Uuid::new_v4(), "eggs"),
        };
        // Any record with the same text matches, whoever added it.
        assert!(confirms(&add, &theirs));
        assert!(!confirms(&add, &other));
    }
}
