use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::command::Kind;
use crate::connection::Connection;
use crate::error::Result;
use crate::frame::Reply;
use crate::pool::Pool;

/// A push-delivered event on a subscribed connection: subscription
/// acknowledgements and published messages, in arrival order. These bypass
/// the per-command reply queue entirely.
#[derive(Clone, Debug, PartialEq)]
pub enum PushEvent {
    Subscribed { channel: String, count: i64 },
    Unsubscribed { channel: Option<String>, count: i64 },
    PSubscribed { pattern: String, count: i64 },
    PUnsubscribed { pattern: Option<String>, count: i64 },
    Message { channel: String, payload: Bytes },
    PMessage { pattern: String, channel: String, payload: Bytes },
}

impl PushEvent {
    /// Interprets a decoded reply as a push event. Only meaningful while
    /// the connection is in subscriber mode; outside it, reply arrays that
    /// happen to look like events are ordinary command results.
    pub(crate) fn parse(reply: &Reply) -> Option<PushEvent> {
        let items = match reply {
            Reply::Array(items) => items,
            _ => return None,
        };

        let kind = as_string(items.first()?)?;
        match (kind.as_str(), items.len()) {
            ("subscribe", 3) => Some(PushEvent::Subscribed {
                channel: as_string(&items[1])?,
                count: as_integer(&items[2])?,
            }),
            ("unsubscribe", 3) => Some(PushEvent::Unsubscribed {
                channel: as_optional_string(&items[1]),
                count: as_integer(&items[2])?,
            }),
            ("psubscribe", 3) => Some(PushEvent::PSubscribed {
                pattern: as_string(&items[1])?,
                count: as_integer(&items[2])?,
            }),
            ("punsubscribe", 3) => Some(PushEvent::PUnsubscribed {
                pattern: as_optional_string(&items[1]),
                count: as_integer(&items[2])?,
            }),
            ("message", 3) => Some(PushEvent::Message {
                channel: as_string(&items[1])?,
                payload: as_bytes(&items[2])?,
            }),
            ("pmessage", 4) => Some(PushEvent::PMessage {
                pattern: as_string(&items[1])?,
                channel: as_string(&items[2])?,
                payload: as_bytes(&items[3])?,
            }),
            _ => None,
        }
    }
}

fn as_string(reply: &Reply) -> Option<String> {
    match reply {
        Reply::Simple(s) => Some(s.clone()),
        Reply::Bulk(bytes) => String::from_utf8(bytes.to_vec()).ok(),
        _ => None,
    }
}

fn as_optional_string(reply: &Reply) -> Option<String> {
    match reply {
        Reply::Null => None,
        reply => as_string(reply),
    }
}

fn as_bytes(reply: &Reply) -> Option<Bytes> {
    match reply {
        Reply::Simple(s) => Some(Bytes::from(s.clone())),
        Reply::Bulk(bytes) => Some(bytes.clone()),
        _ => None,
    }
}

fn as_integer(reply: &Reply) -> Option<i64> {
    match reply {
        Reply::Integer(i) => Some(*i),
        _ => None,
    }
}

/// Exclusive handle over a connection in subscriber mode.
///
/// The connection is locked for the lifetime of the subscriber; `close`
/// unsubscribes everything and hands it back to the pool. Dropping the
/// subscriber without calling `close` leaks the connection (its read task
/// keeps running until the transport closes).
pub struct Subscriber {
    pool: Pool,
    conn: Connection,
    events: UnboundedReceiver<PushEvent>,
}

impl Subscriber {
    pub(crate) fn new(
        pool: Pool,
        conn: Connection,
        events: UnboundedReceiver<PushEvent>,
    ) -> Subscriber {
        Subscriber { pool, conn, events }
    }

    /// Waits for the next push event (acknowledgement or message).
    /// Returns `None` once the connection has closed.
    pub async fn next_event(&mut self) -> Option<PushEvent> {
        self.events.recv().await
    }

    /// Waits for the next published message, discarding acknowledgements.
    pub async fn next_message(&mut self) -> Option<PushEvent> {
        loop {
            match self.events.recv().await? {
                event @ (PushEvent::Message { .. } | PushEvent::PMessage { .. }) => {
                    return Some(event)
                }
                _ => continue,
            }
        }
    }

    pub async fn subscribe(&mut self, channels: &[&str]) -> Result<()> {
        self.conn.subscribe_cmd(Kind::Subscribe, channels).await
    }

    pub async fn psubscribe(&mut self, patterns: &[&str]) -> Result<()> {
        self.conn.subscribe_cmd(Kind::Psubscribe, patterns).await
    }

    /// Unsubscribes from the named channels, or from all channels when none
    /// are given. With zero active channel subscriptions this completes
    /// locally: the server would send nothing back, so nothing is written.
    pub async fn unsubscribe(&mut self, channels: &[&str]) -> Result<()> {
        self.conn.unsubscribe_cmd(Kind::Unsubscribe, channels).await
    }

    pub async fn punsubscribe(&mut self, patterns: &[&str]) -> Result<()> {
        self.conn
            .unsubscribe_cmd(Kind::Punsubscribe, patterns)
            .await
    }

    /// PING is the one ordinary command the server accepts in subscriber
    /// mode; its reply comes back through the normal reply queue.
    pub async fn ping(&mut self) -> Result<Reply> {
        self.conn.send(&crate::Command::new("PING")).await
    }

    /// Number of active (channel, pattern) subscriptions.
    pub fn subscription_count(&self) -> (usize, usize) {
        self.conn.subscription_count()
    }

    /// Unsubscribes from everything and returns the connection to the pool.
    pub async fn close(self) -> Result<()> {
        self.pool.release(self.conn).await
    }
}
