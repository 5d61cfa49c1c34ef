//! Agentry host binary.
//!
//! Boots a runtime from a config file, loads every discovered module and
//! runs one administrative or invocation command against it.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use agentry_core::kernel::types::AdminOutcome;
use agentry_core::{builtin, observability, Config, Runtime};

#[derive(Debug, Parser)]
#[command(name = "agentry", version, about = "Extensible agent runtime host")]
struct Cli {
    /// Configuration file; created with defaults if missing.
    #[arg(long, env = "AGENTRY_CONFIG", default_value = "agentry.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List discovered modules and their state.
    Modules,
    /// Invoke a command.
    Invoke {
        command: String,
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Publish an event as the host.
    Emit {
        event: String,
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Print the audit log gathered while booting.
    Audit,
    /// Print the configuration JSON schema.
    Schema,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Command::Schema = cli.command {
        return print_json(&Config::json_schema());
    }

    // Load configuration
    let config = Config::load_or_init(&cli.config)?;
    observability::init_tracing(&config.observability);
    config.ensure_directories()?;

    let runtime = builtin::install(Runtime::builder(config)).build()?;

    let discovery = runtime.discover().await;
    tracing::info!(
        added = discovery.added.len(),
        rejected = discovery.rejected.len(),
        "modules_discovered"
    );
    let failed: Vec<AdminOutcome> = runtime
        .load_all()
        .await
        .into_iter()
        .filter(|outcome| !outcome.is_ok())
        .collect();
    for outcome in &failed {
        tracing::warn!(module = %outcome.module, status = ?outcome.status, message = ?outcome.message, "module_load_failed");
    }

    let result = match cli.command {
        Command::Modules => print_json(&runtime.list_modules().await),
        Command::Invoke { command, args } => {
            let args: Value = serde_json::from_str(&args)?;
            match runtime.invoke(&command, args).await {
                Ok(value) => print_json(&value),
                Err(e) => Err(format!("{}: {}", e.code(), e).into()),
            }
        }
        Command::Emit { event, payload } => {
            let payload: Value = serde_json::from_str(&payload)?;
            print_json(&runtime.publish(&event, payload).await)
        }
        Command::Audit => print_json(&runtime.audit().entries()),
        Command::Schema => Ok(()),
    };

    runtime.shutdown().await;
    result
}
