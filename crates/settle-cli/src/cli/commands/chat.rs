//! Chat command handler: a line-oriented conversation over stdin.

use anyhow::{Context as _, Result};
use settle_core::client::Credential;
use settle_core::log::update_channel;
use settle_core::registry::SessionRegistry;
use settle_types::{Message, MessageKind};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::Context;
use crate::render;

const HELP: &str = "Commands:\n\
/wallet [VAR]  show the active wallet, or switch to the key stored in env VAR\n\
/pending       list settlements still being tracked\n\
/log           reprint this wallet's conversation\n\
/quit          exit";

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Prompt(&'a str),
    Wallet(Option<&'a str>),
    Pending,
    Log,
    Help,
    Quit,
    Unknown(&'a str),
}

fn parse_input(line: &str) -> Option<Input<'_>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Input::Prompt(line));
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, Some(arg.trim()).filter(|arg| !arg.is_empty())),
        None => (command, None),
    };
    Some(match name {
        "wallet" => Input::Wallet(arg),
        "pending" => Input::Pending,
        "log" => Input::Log,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        _ => Input::Unknown(line),
    })
}

/// Runs `work` unless `interrupt` resolves first, in which case `work` is
/// dropped.
async fn unless_interrupted<T>(work: impl Future<Output = T>, interrupt: impl Future) -> Option<T> {
    tokio::select! {
        biased;
        _ = interrupt => None,
        output = work => Some(output),
    }
}

/// Reads prompts from stdin until EOF, `/quit`, or Ctrl-C. Ctrl-C also
/// interrupts a turn that is still streaming.
///
/// Each wallet gets its own session in the registry. On exit every session
/// is shut down; with `wait`, in-flight settlements resolve first.
pub async fn run(context: &Context, wait: bool) -> Result<()> {
    let mut credential = context.credential()?;
    let mut registry = SessionRegistry::new(context.config.registry_policy());
    let (updates, transcript) = update_channel();
    let printer = tokio::spawn(render::print_updates(transcript, false));

    if context.config.display.greeting {
        println!("{}", render::format_message(&Message::agent(render::GREETING)));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Some(line) = unless_interrupted(lines.next_line(), tokio::signal::ctrl_c()).await else {
            tracing::debug!("interrupted while reading input");
            break;
        };
        let Some(line) = line.context("read stdin")? else {
            break;
        };
        let Some(input) = parse_input(&line) else {
            continue;
        };

        match input {
            Input::Quit => break,
            Input::Help => println!("{}", render::notice(HELP)),
            Input::Prompt(prompt) => {
                let session = registry.get_or_create(&credential, || {
                    context.open_session(credential.clone(), updates.clone())
                });
                match unless_interrupted(session.run_turn(prompt), tokio::signal::ctrl_c()).await {
                    Some(Ok(_)) => {}
                    Some(Err(err)) => tracing::debug!(kind = %err.kind, "turn failed"),
                    None => {
                        tracing::debug!("interrupted during turn");
                        break;
                    }
                }
            }
            Input::Wallet(None) => {
                println!(
                    "{}",
                    render::notice(format!("Active wallet {}", credential.fingerprint()))
                );
            }
            Input::Wallet(Some(var)) => match std::env::var(var) {
                Ok(key) if !key.trim().is_empty() => {
                    credential = Credential::new(key.trim());
                    println!(
                        "{}",
                        render::notice(format!("Switched to wallet {}", credential.fingerprint()))
                    );
                }
                _ => println!(
                    "{}",
                    render::error_notice(format!("Environment variable {var} is not set"))
                ),
            },
            Input::Pending => {
                let pending = registry
                    .get_mut(&credential)
                    .map(|session| session.pending())
                    .unwrap_or_default();
                if pending.is_empty() {
                    println!("{}", render::notice("No settlements in flight"));
                }
                for (entry, operation) in pending {
                    println!(
                        "{}",
                        render::notice(format!("{entry} awaiting settlement of {operation}"))
                    );
                }
            }
            Input::Log => match registry.get_mut(&credential) {
                Some(session) => {
                    for entry in session.log().snapshot().await? {
                        if !entry.message.is(MessageKind::Loading) {
                            println!("{}", render::format_message(&entry.message));
                        }
                    }
                }
                None => println!("{}", render::notice("No conversation yet")),
            },
            Input::Unknown(command) => println!(
                "{}",
                render::error_notice(format!("Unknown command {command}. Type /help for commands"))
            ),
        }
    }

    let logs = registry.shutdown_all(wait).await;
    tracing::debug!(sessions = logs.len(), "chat finished");
    drop(updates);
    printer.await.context("transcript printer failed")?;
    Ok(())
}
