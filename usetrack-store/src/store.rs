//! # Shared Store Interface
//!
//! ## Design Principles
//!
//! 1. **Strategy Pattern**: Abstract the transport behind a trait so the
//!    in-memory store and the network store are swappable under the adapters.
//! 2. **Pipelined API**: A call carries a batch of commands and returns one
//!    reply per command, in order, so a merge costs one round trip.
//! 3. **Replies, Not Exceptions**: Per-command server errors come back as
//!    [`Reply::Error`]; only transport failures are `Err`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use usetrack_common::{StoreUrl, UsetrackResult};

use crate::command::{Command, Reply};
use crate::memory::MemoryStore;
use crate::remote::RespStore;

/// A backing store shared by every process of a deployment.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Executes `commands` in order and returns their replies.
    ///
    /// The returned vector has exactly one entry per command.
    async fn execute(&self, commands: Vec<Command>) -> UsetrackResult<Vec<Reply>>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// Opens the store named by `url`.
///
/// The network store connects lazily, so an unreachable server is reported on
/// the first command rather than here.
pub fn connect(url: &StoreUrl, io_timeout: Duration) -> Arc<dyn SharedStore> {
    match url {
        StoreUrl::Memory => Arc::new(MemoryStore::new()),
        StoreUrl::Resp { addr, db } => Arc::new(RespStore::new(addr.clone(), *db, io_timeout)),
    }
}

/// Executes a single command.
pub async fn execute_one(store: &dyn SharedStore, command: Command) -> UsetrackResult<Reply> {
    let mut replies = store.execute(vec![command]).await?;
    replies.pop().ok_or_else(|| {
        usetrack_common::UsetrackError::ProtocolViolation("missing reply".into())
    })
}
