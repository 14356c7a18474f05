//! Settlement polling for submitted operations.
//!
//! Each detected operation gets its own poller task. A poller waits one
//! interval, asks the status endpoint whether the operation has been
//! included in a transaction, and repeats until it is confirmed, the attempt
//! ceiling is reached, or its cancellation token fires. Whatever happens, the
//! pending transaction entry is reconciled into exactly one terminal entry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use settle_types::{Message, MessageId, MessageKind, OperationId};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::log::LogHandle;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 24;
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(5000);

/// Body of a status endpoint response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StatusReply {
    #[serde(default, rename = "transactionHash")]
    pub transaction_hash: Option<String>,
}

impl StatusReply {
    /// The settled transaction hash, if the operation has one yet.
    pub fn settled_hash(&self) -> Option<&str> {
        self.transaction_hash
            .as_deref()
            .filter(|hash| !hash.is_empty())
    }
}

/// Source of operation status, implemented over HTTP by `StatusClient`.
pub trait StatusSource: Send + Sync {
    fn query<'a>(&'a self, operation: &'a OperationId) -> BoxFuture<'a, anyhow::Result<StatusReply>>;
}

/// Tick interval and attempt ceiling for pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// A submitted operation awaiting settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSettlement {
    pub operation_id: OperationId,
    /// Ticks taken so far. Never exceeds `max_attempts`.
    pub attempt: u32,
    pub max_attempts: u32,
    pub interval: Duration,
    /// Exact content of the transaction entry.
    pub originating_content: String,
    /// The transaction entry this settlement resolves.
    pub entry: MessageId,
}

impl PendingSettlement {
    pub fn new(
        operation_id: OperationId,
        originating_content: impl Into<String>,
        entry: MessageId,
        policy: SettlementPolicy,
    ) -> Self {
        Self {
            operation_id,
            attempt: 0,
            max_attempts: policy.max_attempts.max(1),
            interval: policy.interval,
            originating_content: originating_content.into(),
            entry,
        }
    }
}

/// How a poller ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    Confirmed { transaction_hash: String },
    TimedOut,
    /// Cancelled before settlement (session teardown or turn abort).
    Abandoned,
}

impl fmt::Display for SettlementOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementOutcome::Confirmed { .. } => write!(f, "confirmed"),
            SettlementOutcome::TimedOut => write!(f, "timed out"),
            SettlementOutcome::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Builds the entry that replaces a confirmed transaction.
pub fn confirmed_message(content: &str, operation: &OperationId, transaction_hash: &str) -> Message {
    Message::tool(format!(
        "{content}\n\n✅ Transaction Confirmed!\n\n🔷 User Operation Hash:\n{operation}\n\n🔷 Transaction Hash:\n{transaction_hash}\n\nYou can view the transaction details on BSC Explorer."
    ))
    .with_kind(MessageKind::Success)
}

/// Builds the entry that replaces a transaction that never settled in time.
pub fn timed_out_message(content: &str) -> Message {
    Message::tool(format!(
        "{content}\n\nTransaction status update timed out. Please check the blockchain explorer using the operation hash."
    ))
    .with_kind(MessageKind::Warning)
}

/// Builds the entry that replaces a transaction whose tracking was cancelled.
pub fn abandoned_message(content: &str) -> Message {
    Message::tool(format!(
        "{content}\n\nTransaction status tracking stopped before settlement. Please check the blockchain explorer using the operation hash."
    ))
    .with_kind(MessageKind::Warning)
}

/// Polls one pending settlement to completion.
pub struct SettlementPoller {
    pending: PendingSettlement,
    source: Arc<dyn StatusSource>,
    log: LogHandle,
    cancel: CancellationToken,
}

impl SettlementPoller {
    pub fn new(
        pending: PendingSettlement,
        source: Arc<dyn StatusSource>,
        log: LogHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pending,
            source,
            log,
            cancel,
        }
    }

    /// Runs until confirmed, timed out or cancelled, then reconciles the
    /// transaction entry.
    pub async fn run(mut self) -> SettlementOutcome {
        let outcome = self.poll().await;
        self.resolve(&outcome).await;
        outcome
    }

    /// Ticks fall at fixed offsets from the start. A query may run until
    /// the next tick; one that does not answer by then counts as a failed
    /// attempt, so the poller ends no later than `max_attempts + 1`
    /// intervals after it started.
    async fn poll(&mut self) -> SettlementOutcome {
        let interval = self.pending.interval;
        let started = Instant::now();

        loop {
            let attempt = self.pending.attempt + 1;
            let tick = started + interval * attempt;
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return SettlementOutcome::Abandoned,
                () = time::sleep_until(tick) => {}
            }

            self.pending.attempt = attempt;
            let operation = &self.pending.operation_id;

            let reply = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return SettlementOutcome::Abandoned,
                reply = time::timeout_at(tick + interval, self.source.query(operation)) => reply,
            };

            match reply {
                Ok(Ok(reply)) => {
                    if let Some(hash) = reply.settled_hash() {
                        return SettlementOutcome::Confirmed {
                            transaction_hash: hash.to_string(),
                        };
                    }
                    tracing::debug!(operation = %operation, attempt, "operation not settled yet");
                }
                Ok(Err(err)) => {
                    let error = format!("{err:#}");
                    tracing::warn!(operation = %operation, attempt, %error, "status query failed");
                }
                Err(_) => {
                    tracing::warn!(operation = %operation, attempt, "status query did not answer before the next tick");
                }
            }

            if attempt >= self.pending.max_attempts {
                return SettlementOutcome::TimedOut;
            }
        }
    }

    async fn resolve(&self, outcome: &SettlementOutcome) {
        let pending = &self.pending;
        let content = pending.originating_content.as_str();
        let replacement = match outcome {
            SettlementOutcome::Confirmed { transaction_hash } => {
                confirmed_message(content, &pending.operation_id, transaction_hash)
            }
            SettlementOutcome::TimedOut => timed_out_message(content),
            SettlementOutcome::Abandoned => abandoned_message(content),
        };
        debug_assert!(replacement.kind.is_some_and(MessageKind::is_terminal));

        match self
            .log
            .reconcile_entry(pending.entry, MessageKind::Transaction, replacement)
            .await
        {
            Ok(Some(_)) => tracing::info!(
                operation = %pending.operation_id,
                attempts = pending.attempt,
                %outcome,
                "settlement resolved"
            ),
            Ok(None) => tracing::debug!(
                operation = %pending.operation_id,
                %outcome,
                "transaction entry already gone"
            ),
            Err(err) => tracing::debug!(operation = %pending.operation_id, %err, "log closed before settlement"),
        }
    }
}

type InFlightMap = Arc<Mutex<BTreeMap<MessageId, OperationId>>>;

/// The set of pollers owned by one session.
///
/// Pollers run on their own tasks; the set only tracks them so they can be
/// listed, cancelled and joined. Dropping the set cancels every poller and
/// lets each one resolve its entry as abandoned.
pub struct Settlements {
    source: Arc<dyn StatusSource>,
    log: LogHandle,
    policy: SettlementPolicy,
    cancel: CancellationToken,
    tokens: HashMap<MessageId, CancellationToken>,
    in_flight: InFlightMap,
    tasks: JoinSet<(MessageId, SettlementOutcome)>,
}

impl Settlements {
    /// `cancel` is the session token; each poller gets a child of it.
    pub fn new(
        source: Arc<dyn StatusSource>,
        log: LogHandle,
        policy: SettlementPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            log,
            policy,
            cancel,
            tokens: HashMap::new(),
            in_flight: Arc::new(Mutex::new(BTreeMap::new())),
            tasks: JoinSet::new(),
        }
    }

    /// Starts polling for the transaction entry `entry`.
    pub fn spawn(&mut self, operation_id: OperationId, originating_content: String, entry: MessageId) {
        let pending = PendingSettlement::new(operation_id.clone(), originating_content, entry, self.policy);
        let token = self.cancel.child_token();
        let poller = SettlementPoller::new(
            pending,
            Arc::clone(&self.source),
            self.log.clone(),
            token.clone(),
        );

        self.reap_finished();
        lock(&self.in_flight).insert(entry, operation_id.clone());
        self.tokens.insert(entry, token);

        tracing::debug!(operation = %operation_id, %entry, "settlement poller started");
        let in_flight = Arc::clone(&self.in_flight);
        self.tasks.spawn(async move {
            let outcome = poller.run().await;
            lock(&in_flight).remove(&entry);
            (entry, outcome)
        });
    }

    /// Drops finished pollers and their tokens. Their outcomes are already
    /// in the log.
    fn reap_finished(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            match result {
                Ok((entry, outcome)) => {
                    self.tokens.remove(&entry);
                    tracing::trace!(%entry, %outcome, "reaped settlement poller");
                }
                Err(err) => tracing::warn!(%err, "settlement poller failed"),
            }
        }
        self.tokens.retain(|_, token| !token.is_cancelled());
    }

    /// Cancels the pollers for the given transaction entries.
    pub fn cancel(&mut self, entries: &[MessageId]) {
        for entry in entries {
            if let Some(token) = self.tokens.remove(entry) {
                token.cancel();
            }
        }
    }

    /// Cancels every poller. Each resolves its entry as abandoned.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Waits for every poller to finish and returns their outcomes in
    /// completion order. Pollers reaped by an earlier `spawn` are not
    /// reported again.
    pub async fn join_all(&mut self) -> Vec<(MessageId, SettlementOutcome)> {
        let mut outcomes = Vec::new();
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => tracing::warn!(%err, "settlement poller failed"),
            }
        }
        self.tokens.clear();
        outcomes
    }

    /// Settlements still in flight, ordered by entry id.
    pub fn pending(&self) -> Vec<(MessageId, OperationId)> {
        lock(&self.in_flight)
            .iter()
            .map(|(entry, operation)| (*entry, operation.clone()))
            .collect()
    }

    pub fn is_settling(&self) -> bool {
        !lock(&self.in_flight).is_empty()
    }
}

impl Drop for Settlements {
    fn drop(&mut self) {
        self.cancel.cancel();
        // Detached pollers observe the cancellation, resolve their entries
        // and exit on their own.
        self.tasks.detach_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
