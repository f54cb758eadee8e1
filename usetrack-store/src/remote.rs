//! # Network Store
//!
//! Purpose: Execute pipelined commands against a Redis-compatible server so
//! every process of a deployment merges into the same aggregate.
//!
//! ## Design Principles
//!
//! 1. **Lazy Connection**: The socket is opened on first use and re-opened on
//!    the call after any failure; construction never touches the network.
//! 2. **Bounded I/O**: Connect, write and each reply read are bounded by the
//!    configured I/O timeout.
//! 3. **Poison on Error**: Any transport or framing error drops the connection,
//!    since its read buffer can no longer be trusted to be reply-aligned.
//! 4. **Cancel Safe**: A cancelled call (merge timeout, dropped HTTP handler)
//!    also drops the connection; the slot is only refilled after every reply
//!    of a pipeline has been read.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};
use usetrack_common::{UsetrackError, UsetrackResult};

use crate::command::{Command, Reply};
use crate::resp::{encode_command, parse_reply};
use crate::store::SharedStore;

const READ_CHUNK: usize = 16 * 1024;

struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

/// Store backed by a Redis-compatible server.
pub struct RespStore {
    addr: String,
    db: u32,
    io_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl RespStore {
    pub fn new(addr: impl Into<String>, db: u32, io_timeout: Duration) -> Self {
        RespStore {
            addr: addr.into(),
            db,
            io_timeout,
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> UsetrackResult<Connection> {
        let stream = timeout(self.io_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| UsetrackError::Timeout(self.io_timeout))??;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, db = self.db, "connected to store");

        let mut conn = Connection {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
        };
        if self.db != 0 {
            let mut replies = self.round_trip(&mut conn, &[Command::Select(self.db)]).await?;
            if let Some(reply) = replies.pop() {
                reply.check()?;
            }
        }
        Ok(conn)
    }

    async fn round_trip(
        &self,
        conn: &mut Connection,
        commands: &[Command],
    ) -> UsetrackResult<Vec<Reply>> {
        conn.write_buf.clear();
        for command in commands {
            encode_command(&command.to_args(), &mut conn.write_buf);
        }
        timeout(self.io_timeout, conn.stream.write_all(&conn.write_buf))
            .await
            .map_err(|_| UsetrackError::Timeout(self.io_timeout))??;

        let mut replies = Vec::with_capacity(commands.len());
        while replies.len() < commands.len() {
            match parse_reply(&mut conn.read_buf) {
                Ok(Some(reply)) => {
                    replies.push(reply);
                    continue;
                }
                Ok(None) => {}
                Err(_) => {
                    return Err(UsetrackError::ProtocolViolation(
                        "malformed RESP reply".into(),
                    ));
                }
            }

            conn.read_buf.reserve(READ_CHUNK);
            let read = timeout(self.io_timeout, conn.stream.read_buf(&mut conn.read_buf))
                .await
                .map_err(|_| UsetrackError::Timeout(self.io_timeout))??;
            if read == 0 {
                return Err(UsetrackError::Unreachable(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "store closed the connection",
                )));
            }
        }
        Ok(replies)
    }
}

#[async_trait]
impl SharedStore for RespStore {
    async fn execute(&self, commands: Vec<Command>) -> UsetrackResult<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let mut guard = self.conn.lock().await;
        // The connection stays out of the slot while replies are pending, so a
        // caller cancelled mid-round-trip drops it instead of leaving unread
        // replies for the next command.
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        match self.round_trip(&mut conn, &commands).await {
            Ok(replies) => {
                *guard = Some(conn);
                Ok(replies)
            }
            Err(err) => {
                warn!(addr = %self.addr, error = %err, "dropping store connection");
                Err(err)
            }
        }
    }

    fn describe(&self) -> String {
        format!("redis://{}/{}", self.addr, self.db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts one connection and answers each request chunk with `reply`.
    async fn scripted_server(reply: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if socket.write_all(reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn pipelines_replies_in_order() {
        let addr = scripted_server(b"+PONG\r\n:7\r\n").await;
        let store = RespStore::new(addr, 0, Duration::from_secs(1));
        let replies = store
            .execute(vec![Command::Ping, Command::HLen { key: "h".into() }])
            .await
            .unwrap();
        assert_eq!(replies, vec![Reply::Status("PONG".into()), Reply::Integer(7)]);
    }

    #[tokio::test]
    async fn cancelled_call_never_leaks_replies_into_the_next() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut first = true;
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let slow = std::mem::take(&mut first);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                        let reply: &[u8] = if slow {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            b":111\r\n"
                        } else {
                            b":222\r\n"
                        };
                        if socket.write_all(reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let store = RespStore::new(addr, 0, Duration::from_secs(2));
        let cancelled = timeout(
            Duration::from_millis(50),
            store.execute(vec![Command::HLen { key: "h".into() }]),
        )
        .await;
        assert!(cancelled.is_err());

        // Give the slow reply time to arrive on the abandoned socket.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let replies = store
            .execute(vec![Command::HLen { key: "h".into() }])
            .await
            .unwrap();
        assert_eq!(replies, vec![Reply::Integer(222)]);
    }

    #[tokio::test]
    async fn unreachable_server_is_retryable() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let store = RespStore::new(addr, 0, Duration::from_millis(500));
        let err = store.execute(vec![Command::Ping]).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let store = RespStore::new(addr, 0, Duration::from_millis(50));
        let err = store.execute(vec![Command::Ping]).await.unwrap_err();
        assert!(matches!(err, UsetrackError::Timeout(_)));
    }
}
