mod support;

use std::time::Duration;

use bytes::Bytes;
use redis_mux::{Client, Error, Options, Reply};
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;

fn args(parts: &[&str]) -> Vec<Bytes> {
    parts.iter().map(|p| Bytes::from(p.to_string())).collect()
}

/// S1: a command submitted after connect gets its reply delivered through
/// its continuation.
#[tokio::test]
async fn submits_command_and_receives_reply() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (addr, _server) =
                support::start_scripted_server(vec![support::reply(b"+PONG\r\n")]).await;

            let client = Client::new(Options::default());
            client.connect(addr.ip().to_string(), addr.port());

            wait_until(|| client.is_connected(), Duration::from_secs(2)).await;

            let (tx, rx) = oneshot::channel();
            let mut tx = Some(tx);
            client.submit(
                args(&["PING"]),
                Box::new(move |result| {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(result);
                    }
                }),
            );

            let result = tokio::time::timeout(Duration::from_secs(2), rx)
                .await
                .expect("reply timed out")
                .expect("continuation dropped");
            assert_eq!(result.unwrap(), Reply::Bytes(Bytes::from("PONG")));
        })
        .await;
}

/// A RESP error reply is routed to the continuation's error slot with the
/// server's raw error text, unprefixed.
#[tokio::test]
async fn error_reply_surfaces_as_redis_error() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (addr, _server) = support::start_scripted_server(vec![support::reply(
                b"-ERR unknown command\r\n",
            )])
            .await;

            let client = Client::new(Options::default());
            client.connect(addr.ip().to_string(), addr.port());
            wait_until(|| client.is_connected(), Duration::from_secs(2)).await;

            let (tx, rx) = oneshot::channel();
            let mut tx = Some(tx);
            client.submit(
                args(&["NOTACOMMAND"]),
                Box::new(move |result| {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(result);
                    }
                }),
            );

            let result = tokio::time::timeout(Duration::from_secs(2), rx)
                .await
                .unwrap()
                .unwrap();
            match result {
                Err(Error::Redis(msg)) => assert_eq!(msg, "ERR unknown command"),
                other => panic!("expected Redis error, got {:?}", other),
            }
        })
        .await;
}

/// Commands submitted beyond `max_pending` wait, and are promoted to
/// pending (and sent) only once a reply frees up room.
#[tokio::test]
async fn commands_beyond_max_pending_wait_then_promote() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (addr, _server) = support::start_scripted_server(vec![
                support::reply(b"+OK\r\n"),
                support::reply(b"+OK\r\n"),
            ])
            .await;

            let options = Options::builder().max_pending(1).build();
            let client = Client::new(options);
            client.connect(addr.ip().to_string(), addr.port());
            wait_until(|| client.is_connected(), Duration::from_secs(2)).await;

            let (tx, _rx) = mpsc::unbounded_channel();
            for _ in 0..2 {
                let tx = tx.clone();
                client.submit(
                    args(&["SET", "k", "v"]),
                    Box::new(move |result| {
                        let _ = tx.send(result);
                    }),
                );
            }

            assert_eq!(client.pending_count(), 1);
            assert_eq!(client.waiting_count(), 1);

            wait_until(|| client.waiting_count() == 0, Duration::from_secs(2)).await;
        })
        .await;
}

/// `disconnect()` fails every pending command with `Disconnected` and every
/// waiting command with `Skipped`, and is a no-op on a second call.
#[tokio::test]
async fn disconnect_drains_both_queues() {
    let local = LocalSet::new();
    local
        .run_until(async {
            // Never replies, so the one command stays pending and the
            // second sits in the waiting queue behind max_pending.
            let (addr, _server) = support::start_scripted_server(vec![]).await;

            let options = Options::builder().max_pending(1).build();
            let client = Client::new(options);
            client.connect(addr.ip().to_string(), addr.port());
            wait_until(|| client.is_connected(), Duration::from_secs(2)).await;

            let (pending_tx, pending_rx) = oneshot::channel();
            let mut pending_tx = Some(pending_tx);
            client.submit(
                args(&["GET", "a"]),
                Box::new(move |result| {
                    if let Some(tx) = pending_tx.take() {
                        let _ = tx.send(result);
                    }
                }),
            );

            let (waiting_tx, waiting_rx) = oneshot::channel();
            let mut waiting_tx = Some(waiting_tx);
            client.submit(
                args(&["GET", "b"]),
                Box::new(move |result| {
                    if let Some(tx) = waiting_tx.take() {
                        let _ = tx.send(result);
                    }
                }),
            );

            wait_until(|| client.waiting_count() == 1, Duration::from_secs(2)).await;

            client.disconnect();
            client.disconnect(); // must not panic or double-fail anything

            assert!(matches!(pending_rx.await.unwrap(), Err(Error::Disconnected)));
            assert!(matches!(waiting_rx.await.unwrap(), Err(Error::Skipped)));
        })
        .await;
}

/// `cancel_all` skips the in-flight command's eventual reply without
/// touching the connection, and fails whatever is waiting.
#[tokio::test]
async fn cancel_all_skips_pending_and_fails_waiting() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (addr, _server) =
                support::start_scripted_server(vec![support::reply(b"+OK\r\n")]).await;

            let options = Options::builder().max_pending(1).build();
            let client = Client::new(options);
            client.connect(addr.ip().to_string(), addr.port());
            wait_until(|| client.is_connected(), Duration::from_secs(2)).await;

            let (pending_tx, pending_rx) = oneshot::channel();
            let mut pending_tx = Some(pending_tx);
            client.submit(
                args(&["SET", "a", "1"]),
                Box::new(move |result| {
                    if let Some(tx) = pending_tx.take() {
                        let _ = tx.send(result);
                    }
                }),
            );

            let (waiting_tx, waiting_rx) = oneshot::channel();
            let mut waiting_tx = Some(waiting_tx);
            client.submit(
                args(&["SET", "b", "2"]),
                Box::new(move |result| {
                    if let Some(tx) = waiting_tx.take() {
                        let _ = tx.send(result);
                    }
                }),
            );

            wait_until(|| client.waiting_count() == 1, Duration::from_secs(2)).await;
            client.cancel_all();

            // spec.md §8 invariant 2: counts are observably 0 immediately,
            // not only once the server's real replies eventually drain the
            // queues.
            assert_eq!(client.pending_count(), 0);
            assert_eq!(client.waiting_count(), 0);

            assert!(matches!(waiting_rx.await.unwrap(), Err(Error::Skipped)));
            // The in-flight reply still arrives off the wire, but its
            // continuation was marked skipped, so it must never fire.
            assert!(tokio::time::timeout(Duration::from_millis(300), pending_rx)
                .await
                .is_err());
        })
        .await;
}

/// A command left pending past `command_timeout` fails with a connection-level
/// error even though the connection itself stays up and the server's real
/// reply is still to come.
#[tokio::test]
async fn command_times_out_while_still_pending() {
    let local = LocalSet::new();
    local
        .run_until(async {
            // The server never replies, so the command sits pending until
            // `command_timeout` fires it.
            let (addr, _server) = support::start_scripted_server(vec![]).await;

            let options = Options::builder().command_timeout(50).build();
            let client = Client::new(options);
            client.connect(addr.ip().to_string(), addr.port());
            wait_until(|| client.is_connected(), Duration::from_secs(2)).await;

            let (tx, rx) = oneshot::channel();
            let mut tx = Some(tx);
            client.submit(
                args(&["GET", "a"]),
                Box::new(move |result| {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(result);
                    }
                }),
            );

            let result = tokio::time::timeout(Duration::from_secs(2), rx)
                .await
                .expect("continuation should fire once command_timeout elapses")
                .unwrap();
            assert!(matches!(result, Err(Error::CommandFailed(_))));
            assert_eq!(client.pending_count(), 0);
        })
        .await;
}

/// S4: a command stuck behind `max_pending` that never gets promoted fails
/// with `WaitingTimeout` once it has sat in the waiting queue long enough.
#[tokio::test]
async fn waiting_entries_expire_after_waiting_timeout() {
    let local = LocalSet::new();
    local
        .run_until(async {
            // No scripted replies: the first command stays pending forever,
            // so the second is stuck in the waiting queue until it times out.
            let (addr, _server) = support::start_scripted_server(vec![]).await;

            let options = Options::builder()
                .max_pending(1)
                .waiting_timeout(50)
                .build();
            let client = Client::new(options);
            client.connect(addr.ip().to_string(), addr.port());
            wait_until(|| client.is_connected(), Duration::from_secs(2)).await;

            client.submit(args(&["GET", "a"]), Box::new(|_| {}));

            let (tx, rx) = oneshot::channel();
            let mut tx = Some(tx);
            client.submit(
                args(&["GET", "b"]),
                Box::new(move |result| {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(result);
                    }
                }),
            );

            let result = tokio::time::timeout(Duration::from_secs(2), rx)
                .await
                .expect("waiting timeout never fired")
                .unwrap();
            assert!(matches!(result, Err(Error::WaitingTimeout)));
            assert_eq!(client.waiting_count(), 0);
        })
        .await;
}

/// S6: a `SUBSCRIBE` submission for N channels invokes its continuation once
/// per channel acknowledgement, each carrying the channel's subscribed count.
#[tokio::test]
async fn persistent_subscribe_delivers_one_reply_per_channel() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let acks = concat!(
                "*3\r\n$9\r\nsubscribe\r\n$2\r\nc1\r\n:1\r\n",
                "*3\r\n$9\r\nsubscribe\r\n$2\r\nc2\r\n:2\r\n",
                "*3\r\n$9\r\nsubscribe\r\n$2\r\nc3\r\n:3\r\n",
            );
            let (addr, _server) =
                support::start_scripted_server(vec![support::reply(acks.as_bytes())]).await;

            let client = Client::new(Options::default());
            client.connect(addr.ip().to_string(), addr.port());
            wait_until(|| client.is_connected(), Duration::from_secs(2)).await;

            let (tx, mut rx) = mpsc::unbounded_channel();
            client.submit(
                args(&["SUBSCRIBE", "c1", "c2", "c3"]),
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            );

            let mut counts = Vec::new();
            for _ in 0..3 {
                let result = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                    .await
                    .expect("subscribe ack timed out")
                    .expect("channel closed early");
                match result.unwrap() {
                    Reply::Array(items) => match &items[2] {
                        Reply::Integer(n) => counts.push(*n),
                        other => panic!("expected integer count, got {:?}", other),
                    },
                    other => panic!("expected array reply, got {:?}", other),
                }
            }
            assert_eq!(counts, vec![1, 2, 3]);
        })
        .await;
}

/// Calling `disconnect()` then `connect()` again must succeed: a latched
/// `closed` flag must not permanently block future connection attempts.
#[tokio::test]
async fn reconnects_after_explicit_disconnect() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (addr1, _server1) = support::start_scripted_server(vec![]).await;
            let client = Client::new(Options::default());
            client.connect(addr1.ip().to_string(), addr1.port());
            wait_until(|| client.is_connected(), Duration::from_secs(2)).await;

            client.disconnect();
            wait_until(|| !client.is_connected(), Duration::from_secs(2)).await;

            let (addr2, _server2) =
                support::start_scripted_server(vec![support::reply(b"+PONG\r\n")]).await;
            client.connect(addr2.ip().to_string(), addr2.port());
            wait_until(|| client.is_connected(), Duration::from_secs(2)).await;

            let (tx, rx) = oneshot::channel();
            let mut tx = Some(tx);
            client.submit(
                args(&["PING"]),
                Box::new(move |result| {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(result);
                    }
                }),
            );
            let result = tokio::time::timeout(Duration::from_secs(2), rx)
                .await
                .expect("reply timed out")
                .unwrap();
            assert_eq!(result.unwrap(), Reply::Bytes(Bytes::from("PONG")));
        })
        .await;
}

/// A server that accepts and immediately closes still reaches `Connected`
/// and then fails any command submitted into that short window with
/// `Disconnected`, rather than silently dropping it.
#[tokio::test]
async fn peer_closing_immediately_after_connect_fails_in_flight_command() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (addr, _server) = support::start_closing_server().await;

            let options = Options::builder().reconnect(false, 50, 0).build();
            let client = Client::new(options);
            client.connect(addr.ip().to_string(), addr.port());

            let (tx, rx) = oneshot::channel();
            let mut tx = Some(tx);
            client.submit(
                args(&["PING"]),
                Box::new(move |result| {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(result);
                    }
                }),
            );

            let result = tokio::time::timeout(Duration::from_secs(2), rx)
                .await
                .expect("continuation never fired")
                .unwrap();
            // Whether the break is first observed on the read side (clean
            // EOF) or the write side (a failed `write_frame`) depends on
            // exactly when the peer's FIN lands, so either failure shape is
            // acceptable here — the only thing under test is that the
            // command is failed at all, not silently dropped.
            assert!(matches!(result, Err(Error::Disconnected) | Err(Error::CommandFailed(_))));
            wait_until(|| !client.is_connected(), Duration::from_secs(2)).await;
        })
        .await;
}

/// When `resume_waiting_on_reconnect` is set, a connection break must leave
/// the waiting queue intact rather than failing it — only the in-flight
/// pending command is failed immediately. The first command is never
/// replied to, so room never frees up and the second command never leaves
/// the waiting queue before the break happens.
#[tokio::test]
async fn broken_connection_preserves_waiting_queue_when_resume_enabled() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
                // Close without ever replying: the client's read sees a
                // clean EOF while the first command is still pending.
            });

            let options = Options::builder()
                .max_pending(1)
                .resume_waiting_on_reconnect(true)
                .reconnect(false, 50, 0)
                .build();
            let client = Client::new(options);
            client.connect(addr.ip().to_string(), addr.port());
            wait_until(|| client.is_connected(), Duration::from_secs(2)).await;

            let (pending_tx, pending_rx) = oneshot::channel();
            let mut pending_tx = Some(pending_tx);
            client.submit(
                args(&["SET", "a", "1"]),
                Box::new(move |result| {
                    if let Some(tx) = pending_tx.take() {
                        let _ = tx.send(result);
                    }
                }),
            );

            client.submit(args(&["GET", "b"]), Box::new(|_| {}));
            wait_until(|| client.waiting_count() == 1, Duration::from_secs(2)).await;

            assert!(matches!(pending_rx.await.unwrap(), Err(Error::Disconnected)));

            // The broken-connection path must not also drain the waiting
            // queue: it should still be sitting there, untouched.
            wait_until(|| !client.is_connected(), Duration::from_secs(2)).await;
            assert_eq!(client.waiting_count(), 1);
        })
        .await;
}

/// S2: a `SET` submitted, then a `GET` submitted from inside the `SET`'s own
/// continuation, both resolve correctly — re-entrant `submit` from inside a
/// continuation must work, not just be tolerated.
#[tokio::test]
async fn submit_from_inside_a_continuation_resolves() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (addr, _server) = support::start_scripted_server(vec![
                support::reply(b"+OK\r\n"),
                support::reply(b"$3\r\nbar\r\n"),
            ])
            .await;

            let client = Client::new(Options::default());
            client.connect(addr.ip().to_string(), addr.port());
            wait_until(|| client.is_connected(), Duration::from_secs(2)).await;

            let (tx, rx) = oneshot::channel();
            let mut tx = Some(tx);
            let inner_client = client.clone();
            client.submit(
                args(&["SET", "foo", "bar"]),
                Box::new(move |result| {
                    assert_eq!(result.unwrap(), Reply::Bytes(Bytes::from("OK")));
                    let mut tx = tx.take();
                    inner_client.submit(
                        args(&["GET", "foo"]),
                        Box::new(move |result| {
                            if let Some(tx) = tx.take() {
                                let _ = tx.send(result);
                            }
                        }),
                    );
                }),
            );

            let result = tokio::time::timeout(Duration::from_secs(2), rx)
                .await
                .expect("inner reply timed out")
                .unwrap();
            assert_eq!(result.unwrap(), Reply::Bytes(Bytes::from("bar")));
        })
        .await;
}

/// A brand new client that was never connected must reject `submit`
/// synchronously rather than buffering it forever in the waiting queue
/// (spec.md §4.3(a): no connection active and no reconnect in progress).
#[tokio::test]
async fn submit_before_any_connect_attempt_fails_synchronously() {
    let client = Client::new(Options::default());
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);
    client.submit(
        args(&["PING"]),
        Box::new(move |result| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(result);
            }
        }),
    );
    let result = rx.await.expect("continuation never fired synchronously");
    assert!(matches!(result, Err(Error::Disconnected)));
    assert_eq!(client.waiting_count(), 0);
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within timeout");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
