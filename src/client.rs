use std::path::PathBuf;

use bytes::Bytes;

use crate::command::{Command, IntoArg, Kind};
use crate::error::{Error, Result};
use crate::frame::Reply;
use crate::pipeline::Pipeline;
use crate::pool::Pool;
use crate::subscribe::Subscriber;

/// Where the server lives.
#[derive(Clone, Debug)]
pub enum ServerAddr {
    /// `host:port`, e.g. "127.0.0.1:6379".
    Tcp(String),
    Unix(PathBuf),
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub addr: ServerAddr,
    /// Database index selected on every new connection and re-selected
    /// when a locked connection returns to the pool.
    pub db: u32,
    /// Optional AUTH password, sent before anything else on a new
    /// connection.
    pub auth: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: ServerAddr::Tcp("127.0.0.1:6379".to_string()),
            db: 0,
            auth: None,
        }
    }
}

impl ClientConfig {
    pub fn tcp(host: &str, port: u16) -> ClientConfig {
        ClientConfig {
            addr: ServerAddr::Tcp(format!("{}:{}", host, port)),
            ..ClientConfig::default()
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> ClientConfig {
        ClientConfig {
            addr: ServerAddr::Unix(path.into()),
            ..ClientConfig::default()
        }
    }
}

/// The client facade: a connection pool plus typed helpers for the common
/// commands. Cheap to clone; clones share the pool.
///
/// There is no process-wide default client; everything hangs off a value
/// constructed here.
#[derive(Clone)]
pub struct Client {
    pool: Pool,
}

impl Client {
    /// Creates a client without touching the network. The first command
    /// opens the first connection.
    pub fn new(config: ClientConfig) -> Client {
        Client {
            pool: Pool::new(config),
        }
    }

    /// Creates a client and eagerly opens (and validates) one connection.
    pub async fn connect(config: ClientConfig) -> Result<Client> {
        let client = Client::new(config);
        client.ping().await?;
        Ok(client)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Sends a raw command on a shared pooled connection. Error replies
    /// come back as `Reply::Error` values, not as `Err`.
    pub async fn send(&self, cmd: &Command) -> Result<Reply> {
        self.pool.send(cmd).await
    }

    /// A new, empty pipeline over this client's pool.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.pool.clone())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.pool.send(&Command::new("GET").arg(key)).await? {
            Reply::Bulk(data) => Ok(Some(data)),
            Reply::Null => Ok(None),
            Reply::Error(message) => Err(Error::ErrorReply(message)),
            reply => Err(unexpected(reply)),
        }
    }

    pub async fn set(&self, key: &str, value: impl IntoArg) -> Result<()> {
        match self
            .pool
            .send(&Command::new("SET").arg(key).arg(value))
            .await?
        {
            Reply::Simple(_) => Ok(()),
            Reply::Error(message) => Err(Error::ErrorReply(message)),
            reply => Err(unexpected(reply)),
        }
    }

    /// Deletes the given keys, returning how many existed.
    pub async fn del(&self, keys: &[&str]) -> Result<i64> {
        let cmd = Command::new("DEL").args(keys.iter().copied());
        expect_integer(self.pool.send(&cmd).await?)
    }

    pub async fn exists(&self, keys: &[&str]) -> Result<i64> {
        let cmd = Command::new("EXISTS").args(keys.iter().copied());
        expect_integer(self.pool.send(&cmd).await?)
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        expect_integer(self.pool.send(&Command::new("INCR").arg(key)).await?)
    }

    pub async fn decr(&self, key: &str) -> Result<i64> {
        expect_integer(self.pool.send(&Command::new("DECR").arg(key)).await?)
    }

    pub async fn ping(&self) -> Result<String> {
        match self.pool.send(&Command::new("PING")).await? {
            Reply::Simple(text) => Ok(text),
            Reply::Bulk(data) => Ok(String::from_utf8_lossy(&data).into_owned()),
            Reply::Error(message) => Err(Error::ErrorReply(message)),
            reply => Err(unexpected(reply)),
        }
    }

    pub async fn echo(&self, message: impl IntoArg) -> Result<Bytes> {
        match self.pool.send(&Command::new("ECHO").arg(message)).await? {
            Reply::Bulk(data) => Ok(data),
            Reply::Error(message) => Err(Error::ErrorReply(message)),
            reply => Err(unexpected(reply)),
        }
    }

    /// Publishes a message, returning the number of subscribers that
    /// received it.
    pub async fn publish(&self, channel: &str, payload: impl IntoArg) -> Result<i64> {
        let cmd = Command::new("PUBLISH").arg(channel).arg(payload);
        expect_integer(self.pool.send(&cmd).await?)
    }

    pub async fn flushdb(&self) -> Result<()> {
        self.pool.send(&Command::new("FLUSHDB")).await?.ok()?;
        Ok(())
    }

    pub async fn lpush(&self, key: &str, value: impl IntoArg) -> Result<i64> {
        let cmd = Command::new("LPUSH").arg(key).arg(value);
        expect_integer(self.pool.send(&cmd).await?)
    }

    pub async fn rpush(&self, key: &str, value: impl IntoArg) -> Result<i64> {
        let cmd = Command::new("RPUSH").arg(key).arg(value);
        expect_integer(self.pool.send(&cmd).await?)
    }

    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Bytes>> {
        let cmd = Command::new("LRANGE").arg(key).arg(start).arg(stop);
        match self.pool.send(&cmd).await? {
            Reply::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Bulk(data) => Ok(data),
                    reply => Err(unexpected(reply)),
                })
                .collect(),
            Reply::Error(message) => Err(Error::ErrorReply(message)),
            reply => Err(unexpected(reply)),
        }
    }

    /// Locks a connection, puts it in subscriber mode for the given
    /// channels and returns the handle that receives its push events.
    pub async fn subscribe(&self, channels: &[&str]) -> Result<Subscriber> {
        self.subscriber(Kind::Subscribe, channels).await
    }

    pub async fn psubscribe(&self, patterns: &[&str]) -> Result<Subscriber> {
        self.subscriber(Kind::Psubscribe, patterns).await
    }

    async fn subscriber(&self, kind: Kind, names: &[&str]) -> Result<Subscriber> {
        let conn = self.pool.get_exclusive().await?;
        let events = conn.register_subscriber()?;
        if let Err(err) = conn.subscribe_cmd(kind, names).await {
            let _ = self.pool.release(conn).await;
            return Err(err);
        }
        Ok(Subscriber::new(self.pool.clone(), conn, events))
    }

    /// Closes every pooled connection. Locked connections (subscribers,
    /// in-flight pipelines) are closed by their owners.
    pub async fn close(&self) -> Result<()> {
        self.pool.close().await
    }
}

fn expect_integer(reply: Reply) -> Result<i64> {
    match reply {
        Reply::Integer(value) => Ok(value),
        Reply::Error(message) => Err(Error::ErrorReply(message)),
        reply => Err(unexpected(reply)),
    }
}

fn unexpected(reply: Reply) -> Error {
    Error::Protocol(format!("unexpected reply: {:?}", reply))
}
