//! Connection management for MongoDB
//!
//! This module provides connection management functionality including:
//! - Connection establishment and termination
//! - Connection pool configuration
//! - Handing out wire channels for the aggregate driver

use mongodb::{Client, options::ClientOptions};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use bson::doc;

use crate::channel::MongoChannel;
use crate::config::ConnectionConfig;
use crate::error::{AggError, Result, TransportError};

/// MongoDB connection manager
///
/// Owns the pooled client and the usability flag shared with every channel
/// it hands out.
pub struct ConnectionManager {
    /// MongoDB client instance
    client: Option<Client>,

    /// Connection configuration
    config: ConnectionConfig,

    /// Current connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Connection URI
    uri: String,

    /// Cleared on disconnect so open cursors stop sending kill notifications
    usable: Arc<AtomicBool>,
}

/// Connection state information
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,

    /// Currently connecting
    Connecting,

    /// Connected and ready
    Connected,

    /// Connection failed
    Failed(String),
}

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool
    pub max_size: u32,

    /// Minimum number of idle connections
    pub min_idle: u32,

    /// Connection timeout duration
    pub connection_timeout: Duration,

    /// Idle connection timeout duration
    pub idle_timeout: Duration,
}

impl ConnectionManager {
    /// Create a new connection manager
    ///
    /// # Arguments
    /// * `uri` - MongoDB connection URI
    /// * `config` - Connection configuration
    ///
    /// # Returns
    /// * `Self` - New connection manager instance
    pub fn new(uri: String, config: ConnectionConfig) -> Self {
        Self {
            client: None,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            uri,
            usable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Establish connection to MongoDB
    ///
    /// # Returns
    /// * `Result<()>` - Success or connection error
    pub async fn connect(&mut self) -> Result<()> {
        self.set_state(ConnectionState::Connecting).await;
        info!("Connecting to {}", redact_uri(&self.uri));

        let options = match Self::parse_uri(&self.uri).await {
            Ok(options) => self.configure_pool(options),
            Err(e) => {
                self.set_state(ConnectionState::Failed(e.to_string())).await;
                return Err(e);
            }
        };

        let client = Client::with_options(options)?;
        self.client = Some(client);

        if let Err(e) = self.ping().await {
            warn!("Ping after connect failed: {}", e);
            self.client = None;
            self.set_state(ConnectionState::Failed(e.to_string())).await;
            return Err(e);
        }

        self.usable.store(true, std::sync::atomic::Ordering::SeqCst);
        self.set_state(ConnectionState::Connected).await;
        info!("Connected to {}", redact_uri(&self.uri));
        Ok(())
    }

    /// Disconnect from MongoDB
    ///
    /// Invalidates every channel handed out and shuts the client down.
    ///
    /// # Returns
    /// * `Result<()>` - Success or error
    pub async fn disconnect(&mut self) -> Result<()> {
        self.usable.store(false, std::sync::atomic::Ordering::SeqCst);
        if let Some(client) = self.client.take() {
            client.shutdown().await;
            debug!("Client shut down");
        }
        self.set_state(ConnectionState::Disconnected).await;
        Ok(())
    }

    /// Get the MongoDB client
    ///
    /// # Returns
    /// * `Result<&Client>` - Reference to client or error
    pub fn get_client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| AggError::Transport(TransportError::fatal("Not connected to MongoDB")))
    }

    /// Get a wire channel over the current client
    ///
    /// # Returns
    /// * `Result<MongoChannel>` - Channel sharing this manager's usability flag
    pub fn channel(&self) -> Result<MongoChannel> {
        let client = self.get_client()?.clone();
        Ok(MongoChannel::with_flag(client, Arc::clone(&self.usable)))
    }

    /// Get current connection state
    ///
    /// # Returns
    /// * `ConnectionState` - Current state
    pub async fn get_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    /// Check if currently connected
    ///
    /// # Returns
    /// * `bool` - True if connected
    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.read().await, ConnectionState::Connected)
    }

    /// Parse connection URI and create client options
    ///
    /// # Arguments
    /// * `uri` - MongoDB connection URI
    ///
    /// # Returns
    /// * `Result<ClientOptions>` - Parsed client options or error
    async fn parse_uri(uri: &str) -> Result<ClientOptions> {
        ClientOptions::parse(uri).await.map_err(|e| {
            AggError::InvalidArgument(format!("Invalid connection URI: {}", e))
        })
    }

    /// Configure client options with pool settings
    ///
    /// # Arguments
    /// * `options` - Base client options
    ///
    /// # Returns
    /// * `ClientOptions` - Configured options
    fn configure_pool(&self, mut options: ClientOptions) -> ClientOptions {
        let pool = PoolConfig::from(&self.config);
        options.max_pool_size = Some(pool.max_size);
        options.min_pool_size = Some(pool.min_idle);
        options.connect_timeout = Some(pool.connection_timeout);
        options.server_selection_timeout = Some(pool.connection_timeout);
        options.max_idle_time = Some(pool.idle_timeout);
        if options.app_name.is_none() {
            options.app_name = Some("aggcursor".to_string());
        }
        options
    }

    /// Update connection state
    ///
    /// # Arguments
    /// * `new_state` - New connection state
    async fn set_state(&self, new_state: ConnectionState) {
        *self.state.write().await = new_state;
    }

    /// Verify connection is alive by sending a ping
    ///
    /// # Returns
    /// * `Result<()>` - Ok if the server answered
    async fn ping(&self) -> Result<()> {
        let client = self.get_client()?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }
}

impl From<&ConnectionConfig> for PoolConfig {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            max_size: config.max_pool_size,
            min_idle: config.min_pool_size,
            connection_timeout: Duration::from_secs(config.timeout),
            idle_timeout: Duration::from_secs(config.idle_timeout),
        }
    }
}

/// Hide credentials in a connection URI before logging it
pub fn redact_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***@{}", scheme, &rest[at + 1..]),
        None => uri.to_string(),
    }
}
