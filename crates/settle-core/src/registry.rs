//! Sessions keyed by credential.
//!
//! The registry hands out one `Session` per credential, creating it on first
//! use. Keys are credential fingerprints; the raw secret is only held by the
//! session's client.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::client::Credential;
use crate::log::ConversationLog;
use crate::session::Session;

/// Lifetime rules for registered sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryPolicy {
    /// Sessions untouched for this long are evicted. Zero disables eviction.
    pub idle_timeout: Duration,
    /// Soft upper bound on live sessions.
    pub max_sessions: usize,
    /// Never evict a session that still has settlements in flight.
    pub keep_while_settling: bool,
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(1800),
            max_sessions: 8,
            keep_while_settling: true,
        }
    }
}

/// Credential-keyed session cache.
#[derive(Debug)]
pub struct SessionRegistry {
    policy: RegistryPolicy,
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new(policy: RegistryPolicy) -> Self {
        Self {
            policy,
            sessions: HashMap::new(),
        }
    }

    pub fn policy(&self) -> RegistryPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, credential: &Credential) -> bool {
        self.sessions.contains_key(&credential.fingerprint())
    }

    pub fn get_mut(&mut self, credential: &Credential) -> Option<&mut Session> {
        self.sessions.get_mut(&credential.fingerprint())
    }

    /// Returns the session for `credential`, creating it with `create` on a
    /// miss.
    ///
    /// Idle sessions are evicted first; when the registry is still full the
    /// least recently active evictable session makes room.
    pub fn get_or_create(
        &mut self,
        credential: &Credential,
        create: impl FnOnce() -> Session,
    ) -> &mut Session {
        let key = credential.fingerprint();
        if !self.sessions.contains_key(&key) {
            self.evict_idle();
            if self.sessions.len() >= self.policy.max_sessions.max(1) {
                self.evict_oldest();
            }
        }

        self.sessions.entry(key).or_insert_with_key(|key| {
            tracing::info!(session = %key, "creating session");
            create()
        })
    }

    /// Drops sessions idle for longer than the policy allows.
    ///
    /// Dropping a session cancels its pollers. Returns the number evicted.
    pub fn evict_idle(&mut self) -> usize {
        if self.policy.idle_timeout.is_zero() {
            return 0;
        }
        let now = Instant::now();
        let policy = self.policy;
        let before = self.sessions.len();
        self.sessions.retain(|key, session| {
            let idle = now.saturating_duration_since(session.last_active());
            let keep = idle < policy.idle_timeout || (policy.keep_while_settling && session.is_settling());
            if !keep {
                tracing::info!(session = %key, idle_secs = idle.as_secs(), "evicting idle session");
            }
            keep
        });
        before - self.sessions.len()
    }

    fn evict_oldest(&mut self) {
        let keep_while_settling = self.policy.keep_while_settling;
        let oldest = self
            .sessions
            .iter()
            .filter(|(_, session)| !(keep_while_settling && session.is_settling()))
            .min_by_key(|(_, session)| session.last_active())
            .map(|(key, _)| key.clone());

        match oldest {
            Some(key) => {
                tracing::info!(session = %key, "evicting session to stay within capacity");
                self.sessions.remove(&key);
            }
            None => tracing::warn!(
                sessions = self.sessions.len(),
                "every session is settling; exceeding capacity"
            ),
        }
    }

    /// Removes and shuts down every session, returning their final logs.
    ///
    /// With `wait`, in-flight settlements are allowed to resolve first.
    pub async fn shutdown_all(&mut self, wait: bool) -> Vec<ConversationLog> {
        let mut logs = Vec::new();
        for (key, mut session) in self.sessions.drain() {
            if wait {
                session.wait_for_settlements().await;
            }
            match session.shutdown().await {
                Ok(log) => logs.push(log),
                Err(err) => {
                    let error = format!("{err:#}");
                    tracing::warn!(session = %key, %error, "session shutdown failed");
                }
            }
        }
        logs
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::future::BoxFuture;
    use settle_types::{Message, MessageKind, OperationId};

    use super::*;
    use crate::client::AgentClient;
    use crate::session::SessionOptions;
    use crate::settlement::{StatusReply, StatusSource};

    struct NeverSettles;

    impl StatusSource for NeverSettles {
        fn query<'a>(&'a self, _operation: &'a OperationId) -> BoxFuture<'a, anyhow::Result<StatusReply>> {
            Box::pin(async { Ok(StatusReply::default()) })
        }
    }

    fn session_for(credential: &Credential) -> Session {
        let client = AgentClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/api/agent",
            credential.clone(),
        );
        Session::new(client, Arc::new(NeverSettles), SessionOptions::default(), None)
    }

    fn policy(max_sessions: usize) -> RegistryPolicy {
        RegistryPolicy {
            idle_timeout: Duration::from_secs(60),
            max_sessions,
            keep_while_settling: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_on_miss_and_reuse() {
        let mut registry = SessionRegistry::new(policy(4));
        let key = Credential::new("0xaaa");

        let mut created = 0;
        registry.get_or_create(&key, || {
            created += 1;
            session_for(&key)
        });
        registry.get_or_create(&key, || {
            created += 1;
            session_for(&key)
        });

        assert_eq!(created, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&key));
        assert!(!registry.contains(&Credential::new("0xbbb")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_are_evicted() {
        let mut registry = SessionRegistry::new(policy(4));
        let key = Credential::new("0xaaa");
        registry.get_or_create(&key, || session_for(&key));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(registry.evict_idle(), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(registry.evict_idle(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settling_sessions_survive_idle_eviction() {
        let mut registry = SessionRegistry::new(policy(4));
        let key = Credential::new("0xaaa");
        let session = registry.get_or_create(&key, || session_for(&key));

        let entry = session
            .log()
            .append(Message::tool("User Operation Hash: 0x1").with_kind(MessageKind::Transaction))
            .await
            .unwrap();
        session.settlements_mut().spawn(
            OperationId::new("0x1"),
            "User Operation Hash: 0x1".to_string(),
            entry,
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.evict_idle(), 0);
        assert_eq!(registry.len(), 1);

        registry.shutdown_all(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_least_recently_active() {
        let mut registry = SessionRegistry::new(policy(2));
        let a = Credential::new("0xa");
        let b = Credential::new("0xb");
        let c = Credential::new("0xc");

        registry.get_or_create(&a, || session_for(&a));
        tokio::time::advance(Duration::from_secs(1)).await;
        registry.get_or_create(&b, || session_for(&b));
        tokio::time::advance(Duration::from_secs(1)).await;
        registry.get_or_create(&c, || session_for(&c));

        assert_eq!(registry.len(), 2);
        assert!(!registry.contains(&a));
        assert!(registry.contains(&b));
        assert!(registry.contains(&c));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_all_returns_logs() {
        let mut registry = SessionRegistry::new(policy(4));
        let a = Credential::new("0xa");
        let session = registry.get_or_create(&a, || session_for(&a));
        session.log().append(Message::user("hello")).await.unwrap();

        let logs = registry.shutdown_all(false).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].len(), 1);
        assert!(registry.is_empty());
    }
}
