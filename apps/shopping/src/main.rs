use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{ListController, ListHandle, ListState};
use serde::Serialize;
use shared::{
    domain::{ItemId, ShoppingItem},
    error::ListException,
    protocol::ListEvent,
};
use storage::Storage;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, prepare_database_url};

#[derive(Parser, Debug)]
#[command(name = "shopping", about = "Local shopping list backed by SQLite")]
struct Cli {
    /// Overrides the database url from shopping.toml and the environment.
    #[arg(long)]
    database_url: Option<String>,
    /// Print the resulting list as JSON.
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    List,
    Add { name: String },
    Toggle { id: i64 },
    /// Toggle the item at a position of the listing (0 is the newest).
    ToggleAt { index: usize },
    Edit { id: i64, name: String },
    Delete { id: i64 },
}

#[derive(Serialize)]
struct ListOutput<'a> {
    items: &'a [ShoppingItem],
    bought_count: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_filter.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let raw_database_url = cli.database_url.as_deref().unwrap_or(&settings.database_url);
    let database_url = prepare_database_url(raw_database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    storage.health_check().await?;
    info!(%database_url, "shopping list store opened");

    let handle = ListController::spawn(Arc::new(storage.clone()));
    handle.settle().await?;

    let mut events = handle.subscribe_events();
    run_command(&handle, cli.command.unwrap_or(Command::List))?;
    handle.settle().await?;
    report_rejections(&mut events);

    let state = handle.snapshot();
    handle.shutdown().await?;
    storage.close().await;

    print_state(&state, cli.json)?;
    match state.last_error {
        Some(err) => Err(ListException::from(err).into()),
        None => Ok(()),
    }
}

fn run_command(handle: &ListHandle, command: Command) -> Result<()> {
    match command {
        Command::List => {}
        Command::Add { name } => handle.add_item(name)?,
        Command::Toggle { id } => handle.toggle_bought(ItemId(id))?,
        Command::ToggleAt { index } => handle.toggle_bought_at(index)?,
        Command::Edit { id, name } => handle.edit_item(ItemId(id), name)?,
        Command::Delete { id } => handle.delete_item(ItemId(id))?,
    }
    Ok(())
}

fn report_rejections(events: &mut broadcast::Receiver<ListEvent>) {
    loop {
        match events.try_recv() {
            Ok(ListEvent::Rejected { intent, error }) => {
                eprintln!("{} ignored: {}", intent.name(), error.message);
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}

fn print_state(state: &ListState, json: bool) -> Result<()> {
    if json {
        let output = ListOutput {
            items: &state.items,
            bought_count: state.bought_count(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if state.items.is_empty() {
        println!("(shopping list is empty)");
        return Ok(());
    }
    for (index, item) in state.items.iter().enumerate() {
        let mark = if item.is_bought { 'x' } else { ' ' };
        println!("{index:>3}. [{mark}] #{} {}", item.id.0, item.name);
    }
    println!("{} of {} bought", state.bought_count(), state.items.len());
    Ok(())
}
