use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use livechat_core::config::CoreConfig;
use livechat_core::models::is_valid_participant;
use livechat_core::{ChatSession, ClientContext, Identity, InMemoryStore};
use tokio::io::{AsyncBufReadExt, BufReader};

// ANSI color codes
pub(crate) const CYAN: &str = "\x1b[36m";
pub(crate) const GREEN: &str = "\x1b[32m";
pub(crate) const YELLOW: &str = "\x1b[33m";
pub(crate) const RED: &str = "\x1b[31m";
pub(crate) const WHITE_BOLD: &str = "\x1b[1;37m";
pub(crate) const DIM: &str = "\x1b[2m";
pub(crate) const RESET: &str = "\x1b[0m";

mod commands;
mod format;
mod state;

use commands::{handle_command, handle_core_event, parse_command, redraw_active, CommandResult};
use format::print_error_raw;
use state::ReplState;

#[derive(Parser, Debug)]
#[command(name = "livechat-repl")]
#[command(about = "Line-based chat client over an in-memory live store")]
struct Args {
    /// JSON config file (default: <config dir>/livechat/config.json when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// User id (default: a random anonymous id)
    #[arg(long)]
    user: Option<String>,

    /// Display name shown to others
    #[arg(long)]
    name: Option<String>,

    /// Overrides the configured app id
    #[arg(long)]
    app_id: Option<String>,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("livechat").join("config.json"))
        .filter(|path| path.exists())
}

fn resolve_config(args: &Args) -> Result<CoreConfig> {
    let config = match args.config.clone().or_else(default_config_path) {
        Some(path) => CoreConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => CoreConfig::default(),
    };
    let mut config = config.with_env()?;
    if let Some(app_id) = args.app_id.as_ref().filter(|a| !a.is_empty()) {
        config.app_id = app_id.clone();
    }
    Ok(config)
}

fn resolve_user(args: &Args) -> Result<String> {
    let user = args
        .user
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    if !is_valid_participant(&user) {
        anyhow::bail!("Invalid user id {user:?}: ids may not contain \"__\" or \"/\"");
    }
    Ok(user)
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{line}");
    }
}

async fn run_repl(session: &mut ChatSession, store: &InMemoryStore, state: &mut ReplState) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_lines(redraw_active(session, state));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let command = match parse_command(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        println!("{}", print_error_raw(&e));
                        continue;
                    }
                };
                match handle_command(command, session, store, state).await {
                    CommandResult::Lines(out) => print_lines(out),
                    CommandResult::Quit => break,
                }
            }
            event = session.next_event() => {
                let Some(event) = event else {
                    break;
                };
                tracing::debug!(?event, "sync event");
                print_lines(handle_core_event(event, session, state));
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    livechat_core::tracing_setup::init_tracing_with_service("livechat-repl");

    let config = resolve_config(&args)?;
    let user_id = resolve_user(&args)?;
    let identity = Identity::new(user_id.clone(), args.name.clone());

    let store = InMemoryStore::new();
    let ctx = ClientContext::new(config.clone(), Arc::new(store.clone()), identity.clone());

    println!();
    println!("{WHITE_BOLD}livechat-repl{RESET} {DIM}type /help for commands{RESET}");
    println!(
        "{DIM}Signed in as {GREEN}{}{RESET}{DIM} ({}) on app {}{RESET}",
        identity.display_name, identity.user_id, config.app_id
    );
    println!();

    let mut session = ChatSession::start(ctx).await;
    let mut state = ReplState::new(user_id);

    let result = run_repl(&mut session, &store, &mut state).await;

    session.shutdown().await;
    result
}
