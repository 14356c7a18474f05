//! CLI command handlers.

pub mod chat;
pub mod config;
pub mod send;

use std::sync::Arc;

use anyhow::Result;
use settle_core::client::{Connector, Credential};
use settle_core::config::Config;
use settle_core::log::LogUpdateTx;
use settle_core::session::Session;
use settle_core::settlement::StatusSource;

/// Everything a conversation command needs to open sessions.
pub struct Context {
    pub config: Config,
    connector: Connector,
    status: Arc<dyn StatusSource>,
    key_env: Option<String>,
}

impl Context {
    pub fn new(config: Config, agent_url: Option<&str>, key_env: Option<String>) -> Result<Self> {
        let endpoints = config.endpoints(agent_url)?;
        tracing::debug!(
            chat = %endpoints.chat_url,
            status = %endpoints.status_url,
            "resolved endpoints"
        );
        let connector = Connector::new(endpoints, config.request_timeout())?;
        let status: Arc<dyn StatusSource> = Arc::new(connector.status());
        Ok(Self {
            config,
            connector,
            status,
            key_env,
        })
    }

    /// Credential for the initial wallet.
    pub fn credential(&self) -> Result<Credential> {
        self.config.credential(self.key_env.as_deref())
    }

    /// Opens a session whose log updates feed the transcript printer.
    pub fn open_session(&self, credential: Credential, updates: LogUpdateTx) -> Session {
        Session::new(
            self.connector.agent(credential),
            Arc::clone(&self.status),
            self.config.session_options(),
            Some(updates),
        )
    }
}
