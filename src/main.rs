use clap::{Parser, Subcommand};
use couchbus::client::RemoteInvocationClient;
use couchbus::command::HandlerTable;
use couchbus::listener::{ListenOptions, listen};
use couchbus::logging;
use couchbus::shared::config::load_settings;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "couchbus")]
#[command(about = "Distributed command bus over a CouchDB change feed", long_about = None)]
struct Args {
    /// CouchDB database holding commands and registrations
    /// Overrides `store.database` from the configuration
    #[arg(short, long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the `echo`, `ping` and `sleep` demo commands until stopped
    Listen {
        /// Evict peers already registered for the same commands
        #[arg(long)]
        force: bool,
    },
    /// Run a command on whichever listener serves it
    Send {
        command: String,

        /// Positional arguments, parsed as JSON (plain strings otherwise)
        args: Vec<String>,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

fn demo_handlers() -> HandlerTable {
    HandlerTable::builder()
        .command("echo", "Returns its first argument", |args| async move {
            Ok::<_, anyhow::Error>(args.into_iter().next().unwrap_or(Value::Null))
        })
        .command("ping", "Answers 'pong'", |_args| async move { Ok::<_, anyhow::Error>(json!("pong")) })
        .command("sleep", "Sleeps for the given number of seconds", |args| async move {
            let secs = args.first().and_then(Value::as_f64).unwrap_or(1.0).max(0.0);
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            Ok::<_, anyhow::Error>(json!(secs))
        })
        .build()
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut settings = load_settings()?;
    if let Some(database) = args.database {
        settings.store.database = database;
    }
    logging::init(&settings.logging)?;

    match args.command {
        Command::Listen { force } => {
            let options = ListenOptions::from_settings(&settings).with_force(force || settings.listener.force);
            let mut handle = listen(demo_handlers(), &settings.store, options).await?;
            handle.stop_on_signal();
            info!(registration = handle.registration_id(), stop = ?handle.stop_command(), "couchbus is listening");
            handle.wait().await?;
        }
        Command::Send {
            command,
            args,
            timeout_ms,
        } => {
            let client = RemoteInvocationClient::connect(&settings.store, &settings.client).await?;
            let args = args.iter().map(|raw| parse_arg(raw)).collect();
            let result = client
                .send_command(&command, args, timeout_ms.map(Duration::from_millis))
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}
