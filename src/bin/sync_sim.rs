//! Synced-state simulator
//!
//! Runs one context of each kind in a single process over a shared store
//! and an in-process hub, drives a few writes from the interactive surface
//! and prints what every context ends up seeing.
//!
//! # Usage
//!
//! ```bash
//! # Ten counter increments plus a typed note, in-memory store
//! sync_sim --increments 10 --note "read chapter four"
//!
//! # Persist to a file and show debug logs
//! RUST_LOG=synced_state=debug sync_sim --store-path /tmp/synced-state.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, ValueEnum};
use serde_json::json;
use synced_state::schema::{self, AssistantModel, PluginConfig};
use synced_state::{
    ContextKind, DebounceConfig, InProcessHub, StoreConfig, SyncConfig, SyncContext, SyncedCell,
};

#[derive(Parser)]
#[command(name = "sync_sim")]
#[command(version = "0.1.0")]
#[command(about = "Simulate cross-context synced state in one process")]
#[command(long_about = None)]
struct Cli {
    /// Number of counter increments issued back to back from the popup
    #[arg(long, default_value_t = 3)]
    increments: u32,

    /// Text typed into the note field, one character at a time
    #[arg(long, default_value = "hello from the popup")]
    note: String,

    /// Delay between keystrokes (ms)
    #[arg(long, default_value_t = 30)]
    keystroke_ms: u64,

    /// Value written to the anti-anti-tampering toggle from the popup
    #[arg(long)]
    anti_tampering: bool,

    /// Free-text debounce window (ms)
    #[arg(long, env = "SYNCED_STATE_DEBOUNCE_TEXT_MS", default_value_t = 500)]
    text_debounce_ms: u64,

    /// Persist to this JSON file instead of memory
    #[arg(long, env = "SYNCED_STATE_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "pretty", value_enum)]
    format: OutputFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("synced_state=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = SyncConfig::from_env()?;
    if let Some(path) = &cli.store_path {
        config.store = StoreConfig::File { path: path.clone() };
    }
    config.debounce = DebounceConfig {
        free_text_ms: cli.text_debounce_ms,
        ..config.debounce
    };
    // Every context here declares its own kind
    config.context_kind = None;
    let store = config.store.open();

    let hub = InProcessHub::new();
    let mut contexts = Vec::new();
    let mut listeners = Vec::new();
    for kind in ContextKind::ALL {
        let (endpoint, inbox) = hub.connect(kind.as_str().into());
        let ctx = SyncContext::builder(store.clone())
            .kind(kind)
            .transport(Arc::new(endpoint))
            .config(config.clone())
            .build()
            .with_context(|| format!("building {kind} context"))?;
        listeners.push(ctx.listen(inbox));
        contexts.push(ctx);
    }

    schema::stamp(&contexts[0]).await?;

    let mut counters = Vec::new();
    let mut notes = Vec::new();
    let mut configs = Vec::new();
    for ctx in &contexts {
        counters.push(SyncedCell::create(ctx, "sim.counter", 0u64)?);
        notes.push(SyncedCell::create(ctx, "sim.note", String::new())?);
        let plugin = PluginConfig::bind(ctx)?;
        plugin.hydrated().await;
        configs.push(plugin);
    }
    for (counter, note) in counters.iter().zip(&notes) {
        counter.hydrated().await;
        note.hydrated().await;
    }

    let popup = 0;
    for _ in 0..cli.increments {
        counters[popup].write_with(|c| c + 1);
    }
    configs[popup].assistant_model.write(AssistantModel::Gpt4o);
    configs[popup].anti_tampering.write(cli.anti_tampering);
    for end in cli.note.char_indices().map(|(i, c)| i + c.len_utf8()) {
        notes[popup].write(cli.note[..end].to_string());
        tokio::time::sleep(Duration::from_millis(cli.keystroke_ms)).await;
    }

    tokio::time::sleep(Duration::from_millis(cli.text_debounce_ms * 2 + 50)).await;
    for ctx in &contexts {
        ctx.flush().await?;
    }

    let report: Vec<_> = contexts
        .iter()
        .enumerate()
        .map(|(i, ctx)| {
            json!({
                "context": ctx.id().to_string(),
                "kind": ctx.kind(),
                "broadcasts": ctx.broadcasts(),
                "counter": counters[i].read(),
                "note": notes[i].read(),
                "config": configs[i].snapshot(),
                "notifier": ctx.notifier().map(|n| {
                    let stats = n.stats();
                    json!({
                        "scheduled": stats.scheduled,
                        "superseded": stats.superseded,
                        "broadcasts": stats.broadcasts,
                        "delivered": stats.delivered,
                        "failed": stats.failed,
                    })
                }),
                "persisted": ctx.persistence().stats().written,
            })
        })
        .collect();

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&report)?),
        OutputFormat::Pretty => {
            for entry in &report {
                println!("{}", serde_json::to_string_pretty(entry)?);
            }
        }
    }

    let converged = counters.iter().all(|c| c.read() == counters[popup].read())
        && notes.iter().all(|n| n.read() == notes[popup].read());
    if !converged {
        anyhow::bail!("contexts did not converge");
    }

    for listener in listeners {
        listener.abort();
    }
    Ok(())
}
