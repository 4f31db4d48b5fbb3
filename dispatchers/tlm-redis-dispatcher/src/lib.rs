use std::fmt;

use async_trait::async_trait;
use redis::{
    aio::MultiplexedConnection, AsyncCommands, ConnectionAddr, ConnectionInfo,
    IntoConnectionInfo, RedisConnectionInfo, RedisError,
};
use serde::Deserialize;
use thiserror::Error;
use tlm_core::{Event, ExportError, Exporter};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use utils::substitute_with_event;

#[derive(Error, Debug)]
pub enum Error {
    #[error("redis error, {0}")]
    Redis(#[from] RedisError),
    #[error("serialize/deserialize error, {0}")]
    Serde(#[from] serde_json::Error),
    #[error("can't render {template}, {reason}")]
    Template { template: String, reason: String },
}

impl From<Error> for ExportError {
    fn from(e: Error) -> Self {
        match e {
            Error::Redis(e) => ExportError::Unavailable(format!("redis error, {e}")),
            Error::Serde(e) => ExportError::Serde(e),
            e @ Error::Template { .. } => ExportError::Refused(e.to_string()),
        }
    }
}

/// Pushes, publishes or streams every event to Redis. Keys and channels may
/// hold `%{/pointer}` placeholders filled from the event.
#[derive(Deserialize)]
pub struct RedisDispatcher {
    id: String,
    #[serde(default)]
    mode: Mode,
    // host, port, auth and database_number sit next to id and mode
    #[serde(flatten)]
    config: Config,
    #[serde(skip)]
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl fmt::Debug for RedisDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisDispatcher")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database_number", &self.config.database_number)
            .finish()
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub auth: Option<String>,
    #[serde(default = "default_database_number")]
    pub database_number: u8,
}

impl IntoConnectionInfo for Config {
    fn into_connection_info(self) -> redis::RedisResult<ConnectionInfo> {
        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host, self.port),
            redis: RedisConnectionInfo {
                db: self.database_number as i64,
                username: None,
                password: self.auth,
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth: None,
            database_number: default_database_number(),
        }
    }
}

pub fn default_host() -> String {
    "localhost".to_string()
}

pub fn default_port() -> u16 {
    6379
}

pub fn default_database_number() -> u8 {
    0
}

pub fn default_key() -> String {
    "tlm".to_string()
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Mode {
    LPush { key: String },
    RPush { key: String },
    Pub { channel: String },
    XAdd { key: String },
}

impl Default for Mode {
    fn default() -> Self {
        Self::RPush { key: default_key() }
    }
}

impl Mode {
    fn template(&self) -> &str {
        match self {
            Mode::LPush { key } | Mode::RPush { key } | Mode::XAdd { key } => key,
            Mode::Pub { channel } => channel,
        }
    }

    /// The key or channel this event goes to.
    pub fn target(&self, event: &Event) -> Result<String, Error> {
        let template = self.template();
        substitute_with_event(template, event).map_err(|reason| Error::Template {
            template: template.to_string(),
            reason,
        })
    }
}

impl RedisDispatcher {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: Default::default(),
            mode: Default::default(),
            connection: Mutex::new(None),
        }
    }

    pub fn set_mode(&mut self, mode: Mode) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn set_password(&mut self, password: impl Into<String>) -> &mut Self {
        self.config.auth = Some(password.into());
        self
    }

    pub fn set_address(&mut self, host: impl Into<String>, port: u16) -> &mut Self {
        self.config.host = host.into();
        self.config.port = port;
        self
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    // connects lazily and hands out a clone of the shared connection
    async fn connection(&self) -> Result<MultiplexedConnection, Error> {
        let mut connection = self.connection.lock().await;
        if let Some(connection) = connection.as_ref() {
            return Ok(connection.clone());
        }
        let established = redis::Client::open(self.config.clone())?
            .get_multiplexed_tokio_connection()
            .await?;
        info!(
            "{} connected to redis at {}:{}",
            self.id, self.config.host, self.config.port
        );
        *connection = Some(established.clone());
        Ok(established)
    }

    async fn reset(&self) {
        *self.connection.lock().await = None;
    }

    async fn send(&self, event: &Event) -> Result<(), Error> {
        let target = self.mode.target(event)?;
        let value = serde_json::to_string(event)?;
        let mut connection = self.connection().await?;

        let result = match &self.mode {
            Mode::LPush { .. } => connection.lpush::<_, _, ()>(&target, value).await,
            Mode::RPush { .. } => connection.rpush::<_, _, ()>(&target, value).await,
            Mode::Pub { .. } => connection.publish::<_, _, ()>(&target, value).await,
            Mode::XAdd { .. } => {
                connection
                    .xadd::<_, _, _, _, ()>(&target, "*", &[("event", value)])
                    .await
            }
        };
        if let Err(e) = result {
            warn!("{} lost its redis connection, {e}", self.id);
            self.reset().await;
            return Err(e.into());
        }
        debug!("event {} is dispatched to {target}", event.id());
        Ok(())
    }
}

#[async_trait]
impl Exporter for RedisDispatcher {
    fn id(&self) -> &str {
        self.id.as_str()
    }

    async fn export(&self, event: &Event) -> Result<(), ExportError> {
        Ok(self.send(event).await?)
    }
}
