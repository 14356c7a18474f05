//! Session controller: drives user turns against the agent endpoint.
//!
//! A session owns the conversation log writer and the settlement pollers for
//! one credential. Turns are driven one at a time; pollers outlive the turn
//! that started them and reconcile the log whenever they resolve.

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use futures_util::StreamExt;
use settle_types::{Message, MessageId, MessageKind, OperationId};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{AgentClient, Credential, error_field};
use crate::log::{ConversationLog, LogClosed, LogHandle, LogUpdateTx, spawn_writer};
use crate::settlement::{SettlementOutcome, SettlementPolicy, Settlements, StatusSource};
use crate::stream::{
    DecodeError, Extraction, StreamEvent, ToolContent, ToolResult, classify, extract,
};

/// Content of the transient entry shown while waiting for the agent.
pub const LOADING_TEXT: &str = "🤔 Agent is analyzing your request...";

/// Categories of turn failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnErrorKind {
    /// The agent endpoint answered with a non-success status.
    HttpStatus,
    /// The request could not be sent or the connection failed.
    Network,
    /// A frame of the response could not be decoded.
    Decode,
    /// The stream carried an explicit `error` record.
    Protocol,
    /// The conversation log stopped accepting mutations.
    Internal,
}

impl fmt::Display for TurnErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnErrorKind::HttpStatus => write!(f, "http_status"),
            TurnErrorKind::Network => write!(f, "network"),
            TurnErrorKind::Decode => write!(f, "decode"),
            TurnErrorKind::Protocol => write!(f, "protocol"),
            TurnErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// A fatal error that aborted a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnError {
    pub kind: TurnErrorKind,
    /// One-line summary, shown to the user as `Error: <message>`.
    pub message: String,
    pub details: Option<String>,
}

impl TurnError {
    pub fn new(kind: TurnErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Builds an error from a non-success response.
    ///
    /// Uses the body's JSON `error` field when there is one.
    pub fn http_status(status: u16, body: &str) -> Self {
        let message = error_field(body)
            .unwrap_or_else(|| format!("Failed to get response (HTTP {status})"));
        let body = body.trim();
        Self {
            kind: TurnErrorKind::HttpStatus,
            message,
            details: (!body.is_empty()).then(|| body.to_string()),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TurnErrorKind::Network, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TurnErrorKind::Protocol, message)
    }
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TurnError {}

impl From<DecodeError> for TurnError {
    fn from(err: DecodeError) -> Self {
        Self {
            kind: TurnErrorKind::Decode,
            message: err.message,
            details: err.details,
        }
    }
}

impl From<LogClosed> for TurnError {
    fn from(err: LogClosed) -> Self {
        Self::new(TurnErrorKind::Internal, err.to_string())
    }
}

/// Per-session behavior knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionOptions {
    pub settlement: SettlementPolicy,
    /// Append tool output that carries no operation marker.
    pub show_tool_chatter: bool,
}

/// Summary of a completed turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnReport {
    /// Frames decoded from the response.
    pub frames: usize,
    /// Entries appended by this turn, user message included.
    pub appended: Vec<MessageId>,
    /// Operations handed to settlement pollers.
    pub settlements: Vec<OperationId>,
}

#[derive(Default)]
struct Turn {
    loading: Option<MessageId>,
    transactions: Vec<MessageId>,
    report: TurnReport,
}

/// One conversation bound to one credential.
pub struct Session {
    client: AgentClient,
    log: LogHandle,
    writer: JoinHandle<ConversationLog>,
    settlements: Settlements,
    options: SessionOptions,
    last_active: Instant,
}

impl Session {
    /// Starts the log writer for a new, empty conversation.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        client: AgentClient,
        status: Arc<dyn StatusSource>,
        options: SessionOptions,
        updates: Option<LogUpdateTx>,
    ) -> Self {
        let (log, writer) = spawn_writer(ConversationLog::new(), updates);
        let settlements = Settlements::new(
            status,
            log.clone(),
            options.settlement,
            CancellationToken::new(),
        );
        Self {
            client,
            log,
            writer,
            settlements,
            options,
            last_active: Instant::now(),
        }
    }

    pub fn log(&self) -> &LogHandle {
        &self.log
    }

    pub fn credential(&self) -> &Credential {
        self.client.credential()
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    /// Settlements still in flight.
    pub fn pending(&self) -> Vec<(MessageId, OperationId)> {
        self.settlements.pending()
    }

    pub fn is_settling(&self) -> bool {
        self.settlements.is_settling()
    }

    /// Runs one user turn to completion or to its first fatal error.
    ///
    /// Returns once the response stream ends; settlement pollers started by
    /// the turn keep running. On failure the log already holds the error
    /// entry.
    pub async fn run_turn(&mut self, input: &str) -> Result<TurnReport, TurnError> {
        self.last_active = Instant::now();
        let mut turn = Turn::default();

        let user = self.log.append(Message::user(input)).await?;
        turn.report.appended.push(user);
        turn.loading = Some(
            self.log
                .append(Message::system(LOADING_TEXT).with_kind(MessageKind::Loading))
                .await?,
        );

        let result = self.drive(input, &mut turn).await;
        self.last_active = Instant::now();

        match result {
            Ok(()) => {
                if let Some(loading) = turn.loading.take() {
                    self.log.remove(loading).await?;
                }
                tracing::debug!(
                    frames = turn.report.frames,
                    settlements = turn.report.settlements.len(),
                    "turn finished"
                );
                Ok(turn.report)
            }
            Err(err) => {
                tracing::warn!(kind = %err.kind, error = %err, "turn aborted");
                self.abort(&mut turn, &err).await?;
                Err(err)
            }
        }
    }

    async fn drive(&mut self, input: &str, turn: &mut Turn) -> Result<(), TurnError> {
        let mut frames = self.client.send_chat(input).await?;

        while let Some(frame) = frames.next().await {
            let record = frame?;
            if let Some(loading) = turn.loading.take() {
                self.log.remove(loading).await?;
            }
            turn.report.frames += 1;

            match classify(&record) {
                Some(event) => self.apply(event, turn).await?,
                None => tracing::debug!(frame = turn.report.frames, "ignoring unrecognized record"),
            }
        }

        Ok(())
    }

    async fn apply(&mut self, event: StreamEvent, turn: &mut Turn) -> Result<(), TurnError> {
        match event {
            StreamEvent::AgentText(text) => {
                let id = self.log.append(Message::agent(text)).await?;
                turn.report.appended.push(id);
            }
            StreamEvent::ToolResult(result) => self.apply_tool(result, turn).await?,
            StreamEvent::ProtocolError(message) => return Err(TurnError::protocol(message)),
        }
        Ok(())
    }

    async fn apply_tool(&mut self, result: ToolResult, turn: &mut Turn) -> Result<(), LogClosed> {
        if let Some(error) = &result.error {
            let message = Message::tool(format!("Tool Error: {error}")).with_kind(MessageKind::Error);
            turn.report.appended.push(self.log.append(message).await?);
            return Ok(());
        }

        let message = match result.content {
            ToolContent::Text(ref text) => match extract(text) {
                Extraction::Operation(operation) => {
                    let entry = self
                        .log
                        .append(Message::tool(text.as_str()).with_kind(MessageKind::Transaction))
                        .await?;
                    turn.report.appended.push(entry);
                    turn.transactions.push(entry);
                    turn.report.settlements.push(operation.clone());
                    self.settlements.spawn(operation, text.clone(), entry);
                    return Ok(());
                }
                Extraction::MarkedWithoutId => Some(Message::tool(text.as_str())),
                Extraction::Unmarked => self.chatter(text.clone()),
            },
            ToolContent::Structured(ref value) => {
                let pretty = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
                self.chatter(pretty)
            }
            ToolContent::Absent => {
                Some(Message::tool(result.fallback_text()).with_kind(MessageKind::Success))
            }
        };

        if let Some(message) = message {
            turn.report.appended.push(self.log.append(message).await?);
        }
        Ok(())
    }

    fn chatter(&self, text: String) -> Option<Message> {
        if self.options.show_tool_chatter {
            Some(Message::tool(text))
        } else {
            tracing::debug!(len = text.len(), "suppressing tool output");
            None
        }
    }

    /// Leaves the log consistent after a fatal error: this turn's loading and
    /// transaction entries go away, their pollers stop, and one error entry
    /// is appended.
    async fn abort(&mut self, turn: &mut Turn, err: &TurnError) -> Result<(), LogClosed> {
        let mut ids = turn.transactions.clone();
        ids.extend(turn.loading.take());
        self.log
            .strip_turn(ids, vec![MessageKind::Loading, MessageKind::Transaction])
            .await?;
        self.settlements.cancel(&turn.transactions);

        let message = Message::system(format!("Error: {}", err.message)).with_kind(MessageKind::Error);
        turn.report.appended.push(self.log.append(message).await?);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn settlements_mut(&mut self) -> &mut Settlements {
        &mut self.settlements
    }

    /// Waits for every in-flight settlement to resolve on its own.
    pub async fn wait_for_settlements(&mut self) -> Vec<(MessageId, SettlementOutcome)> {
        self.settlements.join_all().await
    }

    /// Ends the session: cancels and joins every poller, then returns the
    /// final log.
    pub async fn shutdown(self) -> anyhow::Result<ConversationLog> {
        let Self {
            log,
            writer,
            mut settlements,
            ..
        } = self;

        settlements.cancel_all();
        let outcomes = settlements.join_all().await;
        if !outcomes.is_empty() {
            tracing::info!(abandoned = outcomes.len(), "cancelled in-flight settlements");
        }
        drop(settlements);
        drop(log);

        writer.await.context("Conversation log writer failed")
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("credential", self.client.credential())
            .field("pending", &self.settlements.pending().len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
