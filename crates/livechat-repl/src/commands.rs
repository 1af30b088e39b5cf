use std::time::Duration;

use livechat_core::models::TopicKey;
use livechat_core::{ChatSession, InMemoryStore, SyncEvent};
use crate::format::{format_topics, format_transcript, print_error_raw, print_help_raw, print_system_raw};
use crate::state::{resolve_id, ReplState};
use crate::{DIM, GREEN, RED, RESET};

// ─── Parsing ────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Send(String),
    Global,
    Dm(String),
    Ttl { secs: u64, text: String },
    Topics,
    Remove(String),
    Retry(String),
    Reconnect,
    Fail(usize),
    Help,
    Quit,
}

/// Parse one input line. Blank lines give `Ok(None)`.
pub(crate) fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let command = match name {
        "global" => Command::Global,
        "dm" => {
            if arg.is_empty() {
                return Err("Usage: /dm <peer>".to_string());
            }
            Command::Dm(arg.to_string())
        }
        "ttl" => {
            let (secs, text) = arg
                .split_once(char::is_whitespace)
                .ok_or_else(|| "Usage: /ttl <secs> <text>".to_string())?;
            let secs = secs
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| format!("Invalid number of seconds: {secs}"))?;
            Command::Ttl {
                secs,
                text: text.trim().to_string(),
            }
        }
        "topics" => Command::Topics,
        "rm" => Command::Remove(arg.to_string()),
        "retry" => Command::Retry(arg.to_string()),
        "reconnect" => Command::Reconnect,
        "fail" => {
            let n = if arg.is_empty() { 1 } else {
                arg.parse::<usize>()
                    .map_err(|_| format!("Invalid count: {arg}"))?
            };
            Command::Fail(n)
        }
        "help" | "h" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("Unknown command: /{other}. Type /help")),
    };
    Ok(Some(command))
}

// ─── Command Result ─────────────────────────────────────────────────────────

pub(crate) enum CommandResult {
    Lines(Vec<String>),
    Quit,
}

// ─── Command Handlers ───────────────────────────────────────────────────────

pub(crate) async fn handle_command(
    command: Command,
    session: &mut ChatSession,
    store: &InMemoryStore,
    state: &mut ReplState,
) -> CommandResult {
    let lines = match command {
        Command::Send(text) => match session.send(&text) {
            Ok(_) => Vec::new(),
            Err(e) => vec![print_error_raw(&e.to_string())],
        },
        Command::Ttl { secs, text } => match session.send_ephemeral(&text, Duration::from_secs(secs)) {
            Ok(_) => Vec::new(),
            Err(e) => vec![print_error_raw(&e.to_string())],
        },
        Command::Global => switch_topic(session, state, TopicKey::Global).await,
        Command::Dm(peer) => {
            if peer == state.user_id {
                vec![print_error_raw("That is you")]
            } else {
                switch_topic(session, state, TopicKey::direct(peer)).await
            }
        }
        Command::Topics => format_topics(&session.topics()),
        Command::Remove(arg) => match resolve_id(session.active_records(), &arg) {
            Ok(id) => match session.remove(&id) {
                Ok(()) => vec![format!("{DIM}Removing {id}{RESET}")],
                Err(e) => vec![print_error_raw(&e.to_string())],
            },
            Err(e) => vec![print_error_raw(&e)],
        },
        Command::Retry(arg) => match resolve_id(session.active_records(), &arg) {
            Ok(id) => match session.resubmit(&id) {
                Ok(_) => Vec::new(),
                Err(e) => vec![print_error_raw(&e.to_string())],
            },
            Err(e) => vec![print_error_raw(&e)],
        },
        Command::Reconnect => {
            let Some(topic) = session.active().cloned() else {
                return CommandResult::Lines(vec![print_error_raw("No active topic")]);
            };
            match session.reconnect(&topic).await {
                Ok(()) => Vec::new(),
                Err(e) => vec![print_error_raw(&format!("Reconnect failed: {e}"))],
            }
        }
        Command::Fail(n) => {
            store.fail_next_writes(n);
            vec![print_system_raw(&format!("The next {n} write(s) will fail"))]
        }
        Command::Help => vec![print_help_raw()],
        Command::Quit => return CommandResult::Quit,
    };
    CommandResult::Lines(lines)
}

async fn switch_topic(session: &mut ChatSession, state: &mut ReplState, topic: TopicKey) -> Vec<String> {
    if let Err(e) = session.select(topic.clone()).await {
        return vec![print_error_raw(&e.to_string())];
    }
    state.invalidate();
    redraw_active(session, state)
}

/// The active transcript, if it changed since it was last printed.
pub(crate) fn redraw_active(session: &ChatSession, state: &mut ReplState) -> Vec<String> {
    let Some(topic) = session.active().cloned() else {
        return Vec::new();
    };
    let records = session.records(&topic);
    if !state.mark_shown(&topic, records) {
        return Vec::new();
    }
    format_transcript(&topic, records, &state.user_id, session.now())
}

// ─── Core Events ────────────────────────────────────────────────────────────

pub(crate) fn handle_core_event(event: SyncEvent, session: &ChatSession, state: &mut ReplState) -> Vec<String> {
    let is_active = session.active() == Some(event.topic());
    match event {
        SyncEvent::Published { .. } | SyncEvent::Decayed { .. } if is_active => redraw_active(session, state),
        SyncEvent::Published { .. } | SyncEvent::Decayed { .. } => Vec::new(),
        SyncEvent::WriteFailed { topic, error, .. } => {
            let mut lines = vec![print_error_raw(&format!("Message to {topic} not sent: {error}. /retry <id> to resend"))];
            if is_active {
                lines.extend(redraw_active(session, state));
            }
            lines
        }
        SyncEvent::DeleteFailed { record_id, error, .. } => {
            vec![print_error_raw(&format!("Could not remove {record_id}: {error}"))]
        }
        SyncEvent::Disconnected { topic, error } => {
            vec![format!("{RED}Disconnected from {topic}:{RESET} {error}. {DIM}/reconnect to retry{RESET}")]
        }
        SyncEvent::Reconnected { topic } => vec![format!("{GREEN}Reconnected to {topic}{RESET}")],
        SyncEvent::UnreadChanged { topic, count } => {
            if is_active || count == 0 {
                Vec::new()
            } else {
                vec![print_system_raw(&format!("{count} unread in {topic}"))]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_a_send() {
        assert_eq!(parse_command("  hi there "), Ok(Some(Command::Send("hi there".to_string()))));
        assert_eq!(parse_command("   "), Ok(None));
    }

    #[test]
    fn test_topic_commands() {
        assert_eq!(parse_command("/global"), Ok(Some(Command::Global)));
        assert_eq!(parse_command("/dm bob"), Ok(Some(Command::Dm("bob".to_string()))));
        assert!(parse_command("/dm").is_err());
    }

    #[test]
    fn test_ttl_command() {
        assert_eq!(
            parse_command("/ttl 30 see you soon"),
            Ok(Some(Command::Ttl {
                secs: 30,
                text: "see you soon".to_string()
            }))
        );
        assert!(parse_command("/ttl soon hi").is_err());
        assert!(parse_command("/ttl 0 hi").is_err());
        assert!(parse_command("/ttl 5").is_err());
    }

    #[test]
    fn test_fail_defaults_to_one() {
        assert_eq!(parse_command("/fail"), Ok(Some(Command::Fail(1))));
        assert_eq!(parse_command("/fail 3"), Ok(Some(Command::Fail(3))));
        assert!(parse_command("/fail x").is_err());
    }

    #[test]
    fn test_unknown_command() {
        assert!(parse_command("/nope").is_err());
        assert_eq!(parse_command("/q"), Ok(Some(Command::Quit)));
    }
}
