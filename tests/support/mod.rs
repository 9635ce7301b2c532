//! A minimal scripted RESP server used by the integration tests. It is not
//! a Redis reimplementation: it accepts a single connection and replays a
//! fixed sequence of replies, reading (and discarding) whatever command
//! bytes arrive in between.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// One scripted exchange: wait for a command to arrive, then write `reply`
/// back verbatim (already RESP-encoded).
pub struct Script {
    pub reply: &'static [u8],
}

pub fn reply(bytes: &'static [u8]) -> Script {
    Script { reply: bytes }
}

/// Starts a stub server on an ephemeral port that accepts one connection
/// and, for each entry in `script`, waits for at least one byte of command
/// input before writing the scripted reply. Returns the bound address and
/// a handle to the background task.
pub async fn start_scripted_server(script: Vec<Script>) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        for step in script {
            // Drain at least one read's worth of command bytes before
            // replying, so replies line up with the client's writes.
            let _ = socket.read(&mut buf).await;
            socket.write_all(step.reply).await.unwrap();
        }
        // Keep the socket open until the test drops the handle, so a
        // client waiting on a later read doesn't see a premature EOF.
        let mut sink = [0u8; 64];
        loop {
            match socket.read(&mut sink).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    });

    (addr, handle)
}

/// Starts a listener that accepts a connection and immediately closes it,
/// simulating a server that drops the connection right after connect.
pub async fn start_closing_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
    });
    (addr, handle)
}
