//! Plain-text transcript rendering.

use settle_core::log::{LogUpdate, LogUpdateRx};
use settle_types::{Message, MessageKind, Role};

pub const GREETING: &str = "Hello! I am your smart account assistant. I can help you with:\n\n\
• Checking ETH and token balances\n\
• Performing gasless token transfers\n\
• Executing token swaps without gas fees\n\
• Creating new smart accounts\n\
• Checking transaction status\n\
• Performing debridge swaps\n\n\
How can I assist you today?";

fn label(role: Role) -> &'static str {
    match role {
        Role::User => "you>",
        Role::Agent => "agent>",
        Role::Tool => "tool>",
        Role::System => "system>",
    }
}

fn tag(kind: MessageKind) -> Option<&'static str> {
    match kind {
        MessageKind::Loading => None,
        MessageKind::Transaction => Some("[pending]"),
        MessageKind::Success => Some("[success]"),
        MessageKind::Error => Some("[error]"),
        MessageKind::Warning => Some("[warning]"),
    }
}

/// Formats one message as transcript text.
///
/// The first line carries the role label and kind tag; continuation lines
/// are indented by two spaces.
pub fn format_message(message: &Message) -> String {
    let mut head = label(message.role).to_string();
    if let Some(tag) = message.kind.and_then(tag) {
        head.push(' ');
        head.push_str(tag);
    }

    let mut lines = message.content.lines();
    let mut out = match lines.next() {
        Some(first) => format!("{head} {first}"),
        None => head,
    };
    for line in lines {
        out.push('\n');
        if !line.is_empty() {
            out.push_str("  ");
            out.push_str(line);
        }
    }
    out
}

/// A local notice that never enters the conversation log.
pub fn notice(text: impl Into<String>) -> String {
    format_message(&Message::system(text))
}

pub fn error_notice(text: impl Into<String>) -> String {
    format_message(&Message::system(text).with_kind(MessageKind::Error))
}

/// Prints appended entries until every update sender is dropped.
///
/// Loading indicators go to stderr so stdout stays a clean transcript.
/// User entries are skipped unless `echo_user` is set, since an interactive
/// user already sees what they typed.
pub async fn print_updates(mut updates: LogUpdateRx, echo_user: bool) {
    while let Some(update) = updates.recv().await {
        let LogUpdate::Appended(entry) = update else {
            continue;
        };
        let message = &entry.message;
        if message.is(MessageKind::Loading) {
            eprintln!("{}", message.content);
        } else if message.role != Role::User || echo_user {
            println!("{}", format_message(message));
        }
    }
}
