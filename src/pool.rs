use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::client::ClientConfig;
use crate::command::{Command, Kind};
use crate::connection::{Connection, Mode};
use crate::error::{Error, Result};
use crate::frame::Reply;

/// A rotating set of shared connections plus the machinery for checking
/// connections out for exclusive use (transactions, subscriptions,
/// pipeline flushes).
///
/// A connection is in exactly one of three places: the available set here,
/// the hands of whoever locked it, or closed (and owned by nobody). Locked
/// connections are not tracked by the pool at all; they come back through
/// `release`.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: ClientConfig,
    available: Mutex<VecDeque<Connection>>,
}

impl Pool {
    pub fn new(config: ClientConfig) -> Pool {
        Pool {
            inner: Arc::new(PoolInner {
                config,
                available: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Sends one command on a shared connection, opening a new one when
    /// none is available. Connection-affine commands are rejected by the
    /// connection itself, which is what keeps one caller's transaction
    /// from bleeding into another caller's traffic.
    pub async fn send(&self, cmd: &Command) -> Result<Reply> {
        let conn = self.shared().await?;
        conn.send(cmd).await
    }

    /// Rotate-selects an available connection: pop from the front, push
    /// back to the rear. Spreads load instead of hammering one connection.
    fn rotate(&self) -> Option<Connection> {
        let mut available = self.available();
        while let Some(conn) = available.pop_front() {
            if conn.is_closed() {
                debug!(connection_id = %conn.id(), "discarding closed connection");
                continue;
            }
            available.push_back(conn.clone());
            return Some(conn);
        }
        None
    }

    async fn shared(&self) -> Result<Connection> {
        if let Some(conn) = self.rotate() {
            return Ok(conn);
        }
        let conn = Connection::open(&self.inner.config).await?;
        // New connections join the available set only after the connect
        // and handshake succeeded.
        conn.mark_shared();
        self.available().push_back(conn.clone());
        debug!(connection_id = %conn.id(), "opened new shared connection");
        Ok(conn)
    }

    /// Checks a connection out of the pool and locks it for the caller's
    /// sole use until it is released or closed.
    pub async fn get_exclusive(&self) -> Result<Connection> {
        let popped = {
            let mut available = self.available();
            loop {
                match available.pop_front() {
                    Some(conn) if conn.is_closed() => continue,
                    other => break other,
                }
            }
        };
        match popped {
            // The handle returned by lock() is the one that owns the
            // connection; clones held elsewhere are rejected until release.
            Some(conn) => conn.lock(),
            // Fresh connections are born locked.
            None => Connection::open(&self.inner.config).await,
        }
    }

    /// Returns a locked connection to the available set, after cleaning up
    /// whatever connection-local state the caller left behind: active
    /// subscriptions are unsubscribed, an open transaction is discarded,
    /// and a final SELECT round trip confirms the server has acknowledged
    /// all of it. The connection only rejoins the pool after that
    /// confirmation; a connection that fails mid-cleanup is closed and the
    /// error propagates.
    pub async fn release(&self, conn: Connection) -> Result<()> {
        if conn.is_closed() {
            // The pool never holds closed connections.
            return Ok(());
        }
        if !conn.is_locked() {
            return Err(Error::IllegalState(
                "cannot release a connection that is not locked".to_string(),
            ));
        }

        conn.clear_subscriber();
        if let Err(err) = self.cleanup(&conn).await {
            // The connection's state is unknown mid-cleanup; tear it down
            // so its read task does not linger unowned.
            debug!(connection_id = %conn.id(), "closing connection after failed cleanup");
            let _ = conn.close().await;
            return Err(err);
        }

        conn.mark_shared();
        self.available().push_back(conn);
        Ok(())
    }

    async fn cleanup(&self, conn: &Connection) -> Result<()> {
        if conn.mode() == Mode::Subscribed {
            conn.unsubscribe_cmd(Kind::Unsubscribe, &[]).await?;
            conn.unsubscribe_cmd(Kind::Punsubscribe, &[]).await?;
        }
        match conn.mode() {
            Mode::Multi => {
                conn.send(&Command::new("DISCARD")).await?.ok()?;
            }
            Mode::Watching => {
                conn.send(&Command::new("UNWATCH")).await?.ok()?;
            }
            _ => {}
        }
        conn.send(&Command::new("SELECT").arg(self.inner.config.db))
            .await?
            .ok()?;
        Ok(())
    }

    /// Closes every available connection and empties the pool. Locked
    /// connections are their owners' problem.
    pub async fn close(&self) -> Result<()> {
        let conns: Vec<Connection> = self.available().drain(..).collect();
        for conn in conns {
            let _ = conn.close().await;
        }
        Ok(())
    }

    /// Number of connections currently in the available set.
    pub fn available_len(&self) -> usize {
        self.available().len()
    }

    fn available(&self) -> MutexGuard<'_, VecDeque<Connection>> {
        self.inner
            .available
            .lock()
            .expect("pool available-set lock poisoned")
    }
}
