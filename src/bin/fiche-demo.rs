//! fiche-demo: a local demonstration of the messaging core.
//!
//! Runs two sessions against one shared store, exchanges a scripted
//! conversation, and prints every session event as a JSON line so the
//! snapshot flow toward a presentation layer is visible.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;

use fiche::auth::SessionIdentity;
use fiche::flog;
use fiche::logging;
use fiche::presence::PresenceTable;
use fiche::session::{Session, SessionEvent};
use fiche::storage::Storage;

/// Two-session walkthrough of the fiche messaging core.
///
/// Configuration can be set via CLI arguments or environment variables;
/// CLI arguments take precedence.
#[derive(Parser, Debug)]
#[command(name = "fiche-demo", version, about)]
struct Cli {
    /// Database file [env: FICHE_DB] [default: in-memory]
    #[arg(long, short = 'd')]
    db: Option<PathBuf>,

    /// Milliseconds to let subscriptions settle between steps
    /// [env: FICHE_STEP_MS] [default: 50]
    #[arg(long)]
    step_ms: Option<u64>,
}

struct Config {
    db: Option<PathBuf>,
    step: Duration,
}

impl Config {
    fn from_cli_and_env(cli: Cli) -> Self {
        let db = cli
            .db
            .or_else(|| std::env::var("FICHE_DB").ok().map(PathBuf::from));
        let step_ms = cli
            .step_ms
            .or_else(|| {
                std::env::var("FICHE_STEP_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(50);
        Self {
            db,
            step: Duration::from_millis(step_ms),
        }
    }
}

#[tokio::main]
async fn main() {
    logging::init();
    let config = Config::from_cli_and_env(Cli::parse());
    if let Err(e) = run(config).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let storage = match &config.db {
        Some(path) => Storage::open(path)?,
        None => Storage::open_in_memory()?,
    };
    let presence = PresenceTable::new();
    match &config.db {
        Some(path) => flog!("fiche-demo starting (database: {})", path.display()),
        None => flog!("fiche-demo starting (database: in-memory)"),
    }

    let amelie = Session::sign_in(
        storage.clone(),
        &presence,
        identity("amelie", "Amélie", "amelie@example.org"),
    )?;
    let bruno = Session::sign_in(
        storage.clone(),
        &presence,
        identity("bruno", "Bruno", "bruno@example.org"),
    )?;

    print_events("amelie", amelie.events());
    print_events("bruno", bruno.events());

    amelie.open_conversation("bruno")?;
    amelie.send("Bonjour Bruno !");
    amelie.send("Tu es là ?");
    tokio::time::sleep(config.step).await;

    let conversation_id = amelie
        .active_conversation()
        .expect("conversation just opened");
    flog!(
        "unread for bruno before opening: {}",
        storage.unread_count(&conversation_id, "bruno")?
    );

    // Bruno opens the conversation; the read pass zeroes his counter.
    bruno.open_conversation("amelie")?;
    tokio::time::sleep(config.step).await;
    flog!(
        "unread for bruno after opening: {}",
        storage.unread_count(&conversation_id, "bruno")?
    );

    bruno.send("Oui, bien reçu !");
    tokio::time::sleep(config.step).await;

    // Bruno leaves; the store commits his offline record on disconnect.
    bruno.sign_out();
    tokio::time::sleep(config.step).await;

    amelie.sign_out();
    Ok(())
}

fn identity(user_id: &str, display_name: &str, email: &str) -> SessionIdentity {
    SessionIdentity {
        user_id: user_id.to_string(),
        display_name: display_name.to_string(),
        email: email.to_string(),
        photo_url: None,
        verified: true,
    }
}

fn print_events(label: &'static str, mut rx: broadcast::Receiver<SessionEvent>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        println!("[{label}] {json}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
