use chrono::{Local, TimeZone};
use livechat_core::models::{Delivery, DisplayRecord, TopicKey};
use livechat_core::sync::{format_ttl, remaining_ttl, TopicLifecycle, TopicSummary};
use livechat_core::constants::LOCAL_ID_PREFIX;
use crate::{CYAN, DIM, GREEN, RED, RESET, WHITE_BOLD, YELLOW};

/// Characters of the uuid kept when showing a local id
const SHORT_LOCAL_CHARS: usize = 8;

// ─── Messages ───────────────────────────────────────────────────────────────

/// `HH:MM` in local time for a millisecond timestamp.
pub(crate) fn format_time(ms: u64) -> String {
    Local
        .timestamp_millis_opt(ms as i64)
        .single()
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string())
}

/// Local ids are long; show enough of them to type back.
pub(crate) fn short_id(id: &str) -> String {
    match id.strip_prefix(LOCAL_ID_PREFIX) {
        Some(rest) => {
            let head: String = rest.chars().take(SHORT_LOCAL_CHARS).collect();
            format!("{LOCAL_ID_PREFIX}{head}")
        }
        None => id.to_string(),
    }
}

pub(crate) fn format_record(shown: &DisplayRecord, self_id: &str, now: u64) -> String {
    let record = &shown.record;
    let time = format_time(record.created_at);
    let id = short_id(&record.id);

    if record.is_system() {
        return format!("{DIM}[{time}] {YELLOW}{}{RESET}", record.body);
    }

    let author = if record.author_id == self_id {
        format!("{WHITE_BOLD}You{RESET}")
    } else {
        format!("{CYAN}{}{RESET}", record.author_name)
    };

    let ttl = remaining_ttl(record, now)
        .map(|left| format!(" {DIM}({}){RESET}", format_ttl(left)))
        .unwrap_or_default();

    match &shown.delivery {
        Delivery::Confirmed => {
            format!("[{time}] {author}: {}{ttl} {DIM}#{id}{RESET}", record.body)
        }
        Delivery::Pending => {
            format!("{DIM}[{time}] {author}{DIM}: {}{RESET}{ttl} {DIM}#{id}{RESET}", record.body)
        }
        Delivery::Failed(reason) => format!(
            "{RED}[{time}] {author}{RED}: {} (failed: {reason}){RESET}{ttl} {DIM}#{id}{RESET}",
            record.body
        ),
    }
}

/// The whole transcript of one topic.
pub(crate) fn format_transcript(topic: &TopicKey, records: &[DisplayRecord], self_id: &str, now: u64) -> Vec<String> {
    let mut lines = vec![print_separator_raw(&topic.to_string())];
    if records.is_empty() {
        lines.push(format!("{DIM}Start the conversation!{RESET}"));
        return lines;
    }
    lines.extend(records.iter().map(|r| format_record(r, self_id, now)));
    lines
}

// ─── Topics ─────────────────────────────────────────────────────────────────

pub(crate) fn format_topics(topics: &[TopicSummary]) -> Vec<String> {
    if topics.is_empty() {
        return vec![print_system_raw("No topics yet.")];
    }
    let mut lines = vec![format!("{WHITE_BOLD}Topics:{RESET}")];
    for topic in topics {
        let marker = if topic.active {
            format!("{GREEN}*{RESET} ")
        } else {
            "  ".to_string()
        };
        let state = match topic.lifecycle {
            TopicLifecycle::Subscribed => String::new(),
            TopicLifecycle::Uninitialized => format!(" {DIM}(not open){RESET}"),
            TopicLifecycle::Disconnected => format!(" {RED}(disconnected){RESET}"),
            TopicLifecycle::TornDown => format!(" {DIM}(closed){RESET}"),
        };
        let unread = if topic.unread > 0 {
            format!(" {YELLOW}{} unread{RESET}", topic.unread)
        } else {
            String::new()
        };
        lines.push(format!(
            "{marker}{} {DIM}{} messages{RESET}{unread}{state}",
            topic.key, topic.records
        ));
    }
    lines
}

// ─── Chrome ─────────────────────────────────────────────────────────────────

pub(crate) fn print_separator_raw(label: &str) -> String {
    let time = Local::now().format("%H:%M").to_string();
    let line = "─".repeat(40);
    format!("{DIM}── {label} {line} {time}{RESET}")
}

pub(crate) fn print_error_raw(msg: &str) -> String {
    format!("{RED}error:{RESET} {msg}")
}

pub(crate) fn print_system_raw(msg: &str) -> String {
    format!("{YELLOW}{msg}{RESET}")
}

pub(crate) fn print_help_raw() -> String {
    format!(
        "{WHITE_BOLD}Commands:{RESET}\n\
         \x20 <text>                Send to the active topic\n\
         \x20 /global               Switch to the global room\n\
         \x20 /dm <peer>            Switch to a private conversation\n\
         \x20 /ttl <secs> <text>    Send a message that disappears\n\
         \x20 /topics               List topics with unread counts\n\
         \x20 /rm <id>              Remove a message\n\
         \x20 /retry <id>           Resend a failed message\n\
         \x20 /reconnect            Re-subscribe a disconnected topic\n\
         \x20 /fail <n>             Make the next n writes fail\n\
         \x20 /help                 Show this help\n\
         \x20 /quit                 Exit"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use livechat_core::models::{Record, RecordKind};

    fn shown(id: &str, author: &str, delivery: Delivery, expires_at: Option<u64>) -> DisplayRecord {
        DisplayRecord {
            record: Record {
                id: id.to_string(),
                topic_key: TopicKey::Global,
                author_id: author.to_string(),
                author_name: format!("{author}-name"),
                body: "hello".to_string(),
                created_at: 0,
                expires_at,
                kind: RecordKind::User,
            },
            delivery,
        }
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("local-0123456789abcdef"), "local-01234567");
        assert_eq!(short_id("doc-7"), "doc-7");
    }

    #[test]
    fn test_own_and_foreign_authors() {
        let mine = format_record(&shown("doc-1", "me", Delivery::Confirmed, None), "me", 0);
        assert!(mine.contains("You"));
        assert!(mine.contains("hello"));

        let theirs = format_record(&shown("doc-2", "bob", Delivery::Confirmed, None), "me", 0);
        assert!(theirs.contains("bob-name"));
        assert!(!theirs.contains("You"));
    }

    #[test]
    fn test_failed_and_ephemeral_markers() {
        let failed = format_record(
            &shown("local-1", "me", Delivery::Failed("Write rejected".to_string()), None),
            "me",
            0,
        );
        assert!(failed.contains("(failed: Write rejected)"));

        let ephemeral = format_record(&shown("doc-3", "bob", Delivery::Confirmed, Some(65_000)), "me", 0);
        assert!(ephemeral.contains("(1m 5s)"));
    }

    #[test]
    fn test_empty_transcript() {
        let lines = format_transcript(&TopicKey::Global, &[], "me", 0);
        assert!(lines[1].contains("Start the conversation!"));
    }
}
