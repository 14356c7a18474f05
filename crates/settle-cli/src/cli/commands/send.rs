//! Send command handler.

use anyhow::{Context as _, Result};
use settle_core::log::update_channel;

use super::Context;
use crate::render;

/// Runs one turn and prints the conversation as it changes.
///
/// Without `wait`, settlements still in flight when the stream ends are
/// abandoned. A failed turn exits non-zero after its error entry is printed.
pub async fn run(context: &Context, prompt: &str, wait: bool) -> Result<()> {
    let credential = context.credential()?;
    let (updates, transcript) = update_channel();
    let printer = tokio::spawn(render::print_updates(transcript, true));

    let mut session = context.open_session(credential, updates);
    let result = session.run_turn(prompt).await;

    if wait && session.is_settling() {
        let outcomes = session.wait_for_settlements().await;
        tracing::debug!(settled = outcomes.len(), "settlements resolved");
    }
    session.shutdown().await?;
    printer.await.context("transcript printer failed")?;

    let report = result.context("turn failed")?;
    tracing::debug!(
        frames = report.frames,
        settlements = report.settlements.len(),
        "send finished"
    );
    Ok(())
}
