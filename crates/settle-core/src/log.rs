//! Conversation log and its single-writer mutation queue.
//!
//! `ConversationLog` is a plain ordered sequence. At runtime it is owned by
//! one writer task (`spawn_writer`); the session and every settlement poller
//! hold a `LogHandle` and submit commands through an mpsc queue, so appends
//! and reconciliations are applied one at a time in arrival order.

use std::fmt;

use settle_types::{Entry, Message, MessageId, MessageKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Ids involved in a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub removed: MessageId,
    pub appended: MessageId,
}

/// Ordered, append-mostly sequence of conversation entries.
#[derive(Debug, Clone, Default)]
pub struct ConversationLog {
    entries: Vec<Entry>,
    next_id: u64,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message at the end and returns its id.
    pub fn append(&mut self, message: Message) -> MessageId {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry { id, message });
        id
    }

    /// Replaces the most recent entry with `old_content` and `old_kind`.
    ///
    /// The matching entry is removed and `replacement` is appended at the
    /// end of the log. Returns `None` (and changes nothing) when no entry
    /// matches, so repeating a reconciliation is harmless.
    pub fn reconcile(
        &mut self,
        old_content: &str,
        old_kind: MessageKind,
        replacement: Message,
    ) -> Option<Reconciled> {
        let index = self
            .entries
            .iter()
            .rposition(|entry| entry.message.is(old_kind) && entry.message.content == old_content)?;
        Some(self.replace_at(index, replacement))
    }

    /// Like [`ConversationLog::reconcile`], keyed by entry id.
    pub fn reconcile_entry(
        &mut self,
        id: MessageId,
        old_kind: MessageKind,
        replacement: Message,
    ) -> Option<Reconciled> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.id == id && entry.message.is(old_kind))?;
        Some(self.replace_at(index, replacement))
    }

    fn replace_at(&mut self, index: usize, replacement: Message) -> Reconciled {
        let removed = self.entries.remove(index).id;
        let appended = self.append(replacement);
        Reconciled { removed, appended }
    }

    /// Removes an entry by id.
    pub fn remove(&mut self, id: MessageId) -> Option<Entry> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Removes every listed entry that is still live and has one of `kinds`.
    ///
    /// Returns the ids that were actually removed.
    pub fn strip(&mut self, ids: &[MessageId], kinds: &[MessageKind]) -> Vec<MessageId> {
        let mut removed = Vec::new();
        self.entries.retain(|entry| {
            let strip = ids.contains(&entry.id)
                && entry.message.kind.is_some_and(|kind| kinds.contains(&kind));
            if strip {
                removed.push(entry.id);
            }
            !strip
        });
        removed
    }

    pub fn get(&self, id: MessageId) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Live entries of the given kind, oldest first.
    pub fn of_kind(&self, kind: MessageKind) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(move |entry| entry.message.is(kind))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Change notification published by the writer after each mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogUpdate {
    Appended(Entry),
    Removed(MessageId),
}

/// Observer side of the writer's update feed.
pub type LogUpdateTx = mpsc::UnboundedSender<LogUpdate>;
pub type LogUpdateRx = mpsc::UnboundedReceiver<LogUpdate>;

/// Creates a channel for observing log updates.
pub fn update_channel() -> (LogUpdateTx, LogUpdateRx) {
    mpsc::unbounded_channel()
}

/// The writer task has stopped; the log can no longer be mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogClosed;

impl fmt::Display for LogClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conversation log is closed")
    }
}

impl std::error::Error for LogClosed {}

enum ReconcileTarget {
    Content(String),
    Entry(MessageId),
}

enum LogCommand {
    Append {
        message: Message,
        reply: oneshot::Sender<MessageId>,
    },
    Reconcile {
        target: ReconcileTarget,
        old_kind: MessageKind,
        replacement: Message,
        reply: oneshot::Sender<Option<Reconciled>>,
    },
    Remove {
        id: MessageId,
        reply: oneshot::Sender<bool>,
    },
    Strip {
        ids: Vec<MessageId>,
        kinds: Vec<MessageKind>,
        reply: oneshot::Sender<Vec<MessageId>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<Entry>>,
    },
}

/// Cloneable front of the log writer task.
#[derive(Debug, Clone)]
pub struct LogHandle {
    tx: mpsc::UnboundedSender<LogCommand>,
}

impl LogHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> LogCommand,
    ) -> Result<T, LogClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).map_err(|_| LogClosed)?;
        rx.await.map_err(|_| LogClosed)
    }

    pub async fn append(&self, message: Message) -> Result<MessageId, LogClosed> {
        self.request(|reply| LogCommand::Append { message, reply })
            .await
    }

    /// Content-keyed reconciliation; see [`ConversationLog::reconcile`].
    pub async fn reconcile(
        &self,
        old_content: impl Into<String>,
        old_kind: MessageKind,
        replacement: Message,
    ) -> Result<Option<Reconciled>, LogClosed> {
        let target = ReconcileTarget::Content(old_content.into());
        self.request(|reply| LogCommand::Reconcile {
            target,
            old_kind,
            replacement,
            reply,
        })
        .await
    }

    /// Id-keyed reconciliation; see [`ConversationLog::reconcile_entry`].
    pub async fn reconcile_entry(
        &self,
        id: MessageId,
        old_kind: MessageKind,
        replacement: Message,
    ) -> Result<Option<Reconciled>, LogClosed> {
        self.request(|reply| LogCommand::Reconcile {
            target: ReconcileTarget::Entry(id),
            old_kind,
            replacement,
            reply,
        })
        .await
    }

    pub async fn remove(&self, id: MessageId) -> Result<bool, LogClosed> {
        self.request(|reply| LogCommand::Remove { id, reply }).await
    }

    /// See [`ConversationLog::strip`].
    pub async fn strip_turn(
        &self,
        ids: Vec<MessageId>,
        kinds: Vec<MessageKind>,
    ) -> Result<Vec<MessageId>, LogClosed> {
        self.request(|reply| LogCommand::Strip { ids, kinds, reply })
            .await
    }

    /// Copies the current entries.
    pub async fn snapshot(&self) -> Result<Vec<Entry>, LogClosed> {
        self.request(|reply| LogCommand::Snapshot { reply }).await
    }
}

/// Starts the writer task that owns `log`.
///
/// The task ends once every `LogHandle` has been dropped and returns the
/// final log.
pub fn spawn_writer(
    log: ConversationLog,
    updates: Option<LogUpdateTx>,
) -> (LogHandle, JoinHandle<ConversationLog>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_writer(log, rx, updates));
    (LogHandle { tx }, task)
}

async fn run_writer(
    mut log: ConversationLog,
    mut rx: mpsc::UnboundedReceiver<LogCommand>,
    updates: Option<LogUpdateTx>,
) -> ConversationLog {
    let publish = |update: LogUpdate| {
        if let Some(tx) = &updates {
            let _ = tx.send(update);
        }
    };

    while let Some(command) = rx.recv().await {
        match command {
            LogCommand::Append { message, reply } => {
                let id = log.append(message);
                if let Some(entry) = log.get(id) {
                    publish(LogUpdate::Appended(entry.clone()));
                }
                let _ = reply.send(id);
            }
            LogCommand::Reconcile {
                target,
                old_kind,
                replacement,
                reply,
            } => {
                let result = match target {
                    ReconcileTarget::Content(content) => {
                        log.reconcile(&content, old_kind, replacement)
                    }
                    ReconcileTarget::Entry(id) => log.reconcile_entry(id, old_kind, replacement),
                };
                if let Some(done) = result {
                    publish(LogUpdate::Removed(done.removed));
                    if let Some(entry) = log.get(done.appended) {
                        publish(LogUpdate::Appended(entry.clone()));
                    }
                }
                let _ = reply.send(result);
            }
            LogCommand::Remove { id, reply } => {
                let removed = log.remove(id).is_some();
                if removed {
                    publish(LogUpdate::Removed(id));
                }
                let _ = reply.send(removed);
            }
            LogCommand::Strip { ids, kinds, reply } => {
                let removed = log.strip(&ids, &kinds);
                for id in &removed {
                    publish(LogUpdate::Removed(*id));
                }
                let _ = reply.send(removed);
            }
            LogCommand::Snapshot { reply } => {
                let _ = reply.send(log.entries().to_vec());
            }
        }
    }

    log
}
