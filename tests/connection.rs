use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::sleep;

use tokredis::command::Kind;
use tokredis::connection::Mode;
use tokredis::{Client, ClientConfig, Command, Connection, Error, Pool, PushEvent, Reply};

/// A TCP peer that accepts one connection, records every byte the client
/// writes and sends back whatever canned bytes the test feeds it. Dropping
/// `replies` closes the connection.
struct ScriptedServer {
    config: ClientConfig,
    replies: UnboundedSender<Vec<u8>>,
    received: Arc<Mutex<Vec<u8>>>,
}

async fn scripted_server() -> ScriptedServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let received = Arc::new(Mutex::new(Vec::new()));
    let inbound = Arc::clone(&received);

    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            let (mut reader, mut writer) = socket.into_split();

            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = reader.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    inbound.lock().unwrap().extend_from_slice(&buf[..n]);
                }
            });

            while let Some(data) = rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
            }
            // Dropping the writer half closes the connection.
        }
    });

    ScriptedServer {
        config: ClientConfig::tcp("127.0.0.1", addr.port()),
        replies: tx,
        received,
    }
}

#[tokio::test]
async fn replies_match_send_order_across_fragments() {
    let server = scripted_server().await;
    let conn = Connection::open(&server.config).await.unwrap();

    let c1 = conn.clone();
    let first = tokio::spawn(async move { c1.send(&Command::new("GET").arg("a")).await });
    sleep(Duration::from_millis(100)).await;

    let c2 = conn.clone();
    let second = tokio::spawn(async move { c2.send(&Command::new("GET").arg("b")).await });
    sleep(Duration::from_millis(100)).await;

    // Both replies arrive fragmented: the second one is split mid-frame.
    server.replies.send(b"$5\r\nfirst\r\n$6\r".to_vec()).unwrap();
    sleep(Duration::from_millis(100)).await;
    server.replies.send(b"\nsecond\r\n".to_vec()).unwrap();

    assert_eq!(
        first.await.unwrap().unwrap(),
        Reply::Bulk(Bytes::from("first"))
    );
    assert_eq!(
        second.await.unwrap().unwrap(),
        Reply::Bulk(Bytes::from("second"))
    );
}

#[tokio::test]
async fn error_reply_is_local_to_one_command() {
    let server = scripted_server().await;
    let conn = Connection::open(&server.config).await.unwrap();

    let replies = server.replies.clone();
    let cmd = Command::new("GET").arg("a");
    let (first, _) = tokio::join!(conn.send(&cmd), async {
        sleep(Duration::from_millis(100)).await;
        replies.send(b"-ERR something went wrong\r\n".to_vec()).unwrap();
    });
    // The error reply comes back as a value, not an `Err`.
    assert_eq!(
        first.unwrap(),
        Reply::Error("ERR something went wrong".to_string())
    );

    // The connection is still healthy and delivers the next reply.
    let replies = server.replies.clone();
    let cmd = Command::new("GET").arg("b");
    let (second, _) = tokio::join!(conn.send(&cmd), async {
        sleep(Duration::from_millis(100)).await;
        replies.send(b"$2\r\nok\r\n".to_vec()).unwrap();
    });
    assert_eq!(second.unwrap(), Reply::Bulk(Bytes::from("ok")));
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn pending_commands_fail_when_connection_closes() {
    let server = scripted_server().await;
    let conn = Connection::open(&server.config).await.unwrap();

    let mut handles = Vec::new();
    for key in ["a", "b", "c"] {
        let conn = conn.clone();
        handles.push(tokio::spawn(async move {
            conn.send(&Command::new("GET").arg(key)).await
        }));
        sleep(Duration::from_millis(50)).await;
    }

    // Server hangs up with three commands in flight.
    drop(server.replies);

    for handle in handles {
        assert!(matches!(
            handle.await.unwrap(),
            Err(Error::ConnectionClosed)
        ));
    }
    assert!(conn.is_closed());

    // Commands after the close fail immediately.
    let err = conn.send(&Command::new("GET").arg("d")).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
}

#[tokio::test]
async fn affine_command_on_shared_connection_is_rejected() {
    let server = scripted_server().await;
    let pool = Pool::new(server.config.clone());

    for name in ["MULTI", "WATCH", "SELECT", "SUBSCRIBE"] {
        let err = pool
            .send(&Command::new(name).arg("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)), "{name}");
    }
}

#[tokio::test]
async fn double_lock_fails() {
    let server = scripted_server().await;
    let pool = Pool::new(server.config.clone());

    let conn = pool.get_exclusive().await.unwrap();
    assert!(conn.is_locked());
    assert!(matches!(conn.lock(), Err(Error::AlreadyLocked)));
}

#[tokio::test]
async fn normal_command_rejected_while_subscribed() {
    let server = scripted_server().await;
    let conn = Connection::open(&server.config).await.unwrap();

    let _events = conn.register_subscriber().unwrap();
    conn.subscribe_cmd(Kind::Subscribe, &["news"]).await.unwrap();
    assert_eq!(conn.mode(), Mode::Subscribed);

    let err = conn.send(&Command::new("GET").arg("x")).await.unwrap_err();
    assert!(matches!(err, Error::IllegalState(_)));
}

#[tokio::test]
async fn ping_while_subscribed_uses_the_reply_queue() {
    let server = scripted_server().await;
    let conn = Connection::open(&server.config).await.unwrap();

    let _events = conn.register_subscriber().unwrap();
    conn.subscribe_cmd(Kind::Subscribe, &["news"]).await.unwrap();

    let replies = server.replies.clone();
    let cmd = Command::new("PING");
    let (pong, _) = tokio::join!(conn.send(&cmd), async {
        sleep(Duration::from_millis(100)).await;
        replies.send(b"+PONG\r\n".to_vec()).unwrap();
    });
    assert_eq!(pong.unwrap(), Reply::Simple("PONG".to_string()));
}

#[tokio::test]
async fn bare_unsubscribe_with_no_subscriptions_completes_locally() {
    let server = scripted_server().await;
    let conn = Connection::open(&server.config).await.unwrap();
    let mut events = conn.register_subscriber().unwrap();

    conn.subscribe_cmd(Kind::Subscribe, &["news"]).await.unwrap();
    server
        .replies
        .send(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n".to_vec())
        .unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        PushEvent::Subscribed {
            channel: "news".to_string(),
            count: 1,
        }
    );

    conn.unsubscribe_cmd(Kind::Unsubscribe, &["news"])
        .await
        .unwrap();
    server
        .replies
        .send(b"*3\r\n$11\r\nunsubscribe\r\n$4\r\nnews\r\n:0\r\n".to_vec())
        .unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        PushEvent::Unsubscribed {
            channel: Some("news".to_string()),
            count: 0,
        }
    );
    assert_eq!(conn.mode(), Mode::Normal);

    // With zero subscriptions, a bare UNSUBSCRIBE never touches the wire:
    // the server sends nothing and receives nothing for it.
    sleep(Duration::from_millis(100)).await;
    let written_before = server.received.lock().unwrap().len();

    conn.unsubscribe_cmd(Kind::Unsubscribe, &[]).await.unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        PushEvent::Unsubscribed {
            channel: None,
            count: 0,
        }
    );

    sleep(Duration::from_millis(100)).await;
    assert_eq!(server.received.lock().unwrap().len(), written_before);
}

#[tokio::test]
async fn failed_release_closes_the_connection() {
    let server = scripted_server().await;
    let pool = Pool::new(server.config.clone());

    let conn = pool.get_exclusive().await.unwrap();

    // The cleanup SELECT round trip comes back as an error reply.
    let replies = server.replies.clone();
    let (result, _) = tokio::join!(pool.release(conn.clone()), async {
        sleep(Duration::from_millis(100)).await;
        replies.send(b"-ERR SELECT is not allowed\r\n".to_vec()).unwrap();
    });

    assert!(matches!(result, Err(Error::ErrorReply(_))));
    // The connection was torn down, not dropped on the floor, and it
    // never rejoined the pool.
    assert!(conn.is_closed());
    assert_eq!(pool.available_len(), 0);
}

#[tokio::test]
async fn pipeline_demultiplexes_fragmented_replies() {
    let server = scripted_server().await;
    let client = Client::new(server.config.clone());

    let mut pipeline = client.pipeline();
    pipeline.add(&Command::new("SET").arg("a").arg(1i64));
    pipeline.add(&Command::new("GET").arg("a"));
    assert_eq!(pipeline.len(), 2);

    let replies = server.replies.clone();
    let feeder = async {
        sleep(Duration::from_millis(100)).await;
        replies.send(b"+OK\r\n$1\r".to_vec()).unwrap();
        sleep(Duration::from_millis(100)).await;
        replies.send(b"\n1\r\n".to_vec()).unwrap();
        // Acknowledge the SELECT round trip that returns the connection to
        // the pool.
        sleep(Duration::from_millis(100)).await;
        replies.send(b"+OK\r\n".to_vec()).unwrap();
    };
    let (result, _) = tokio::join!(pipeline.send(), feeder);

    assert_eq!(
        result.unwrap(),
        vec![
            Reply::Simple("OK".to_string()),
            Reply::Bulk(Bytes::from("1")),
        ]
    );
    assert!(pipeline.is_empty());
    // The flush connection went back to the available set.
    assert_eq!(client.pool().available_len(), 1);
}

#[tokio::test]
async fn empty_pipeline_send_is_a_no_op() {
    let server = scripted_server().await;
    let client = Client::new(server.config.clone());

    let mut pipeline = client.pipeline();
    assert_eq!(pipeline.send().await.unwrap(), Vec::new());
    // No connection was ever opened.
    assert_eq!(client.pool().available_len(), 0);
}
