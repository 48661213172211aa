//! # Shard Executors
//!
//! Parallel per-shard actors. Each shard is one OS thread that exclusively
//! owns its [`ShardState`] (the per-shard table states); nothing mutable is
//! shared across shards. Cross-shard work travels as closures over a channel
//! — the moral equivalent of `submit_to(shard, fn)` — and replies come back
//! over one-shot channels. Keyspace-level drivers run on the caller's thread
//! and fan out to all shards in parallel with [`ShardPool::submit_all`].

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::thread;

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use thiserror::Error;
use tracing::debug;

use crate::sstable::ShardId;
use crate::table::{TableId, TableState};

/// Errors from the shard executor layer.
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("no such shard: {0}")]
    NoSuchShard(ShardId),

    #[error("shard {0} is no longer running")]
    ShardGone(ShardId),

    #[error("failed to spawn shard thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl From<ShardError> for crate::compaction::CompactionError {
    fn from(e: ShardError) -> Self {
        crate::compaction::CompactionError::Internal(e.to_string())
    }
}

/// State owned by one shard actor. Only that shard's thread ever touches it.
pub struct ShardState {
    pub shard: ShardId,
    pub tables: HashMap<TableId, TableState>,
}

type ShardMessage = Box<dyn FnOnce(&mut ShardState) + Send + 'static>;

/// A fixed-size pool of shard actors.
pub struct ShardPool {
    senders: Vec<Sender<ShardMessage>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ShardPool {
    /// Spawns `count` shard threads.
    pub fn new(count: usize) -> Result<Self, ShardError> {
        let count = count.max(1);
        let mut senders = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);
        for shard in 0..count {
            let (tx, rx): (Sender<ShardMessage>, Receiver<ShardMessage>) = unbounded();
            let handle = thread::Builder::new()
                .name(format!("shard-{shard}"))
                .spawn(move || {
                    let mut state = ShardState {
                        shard,
                        tables: HashMap::new(),
                    };
                    while let Ok(message) = rx.recv() {
                        message(&mut state);
                    }
                    debug!(shard, "shard actor exiting");
                })?;
            senders.push(tx);
            workers.push(handle);
        }
        Ok(ShardPool { senders, workers })
    }

    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    /// Runs `f` on the given shard's thread and waits for its result.
    pub fn submit_to<R, F>(&self, shard: ShardId, f: F) -> Result<R, ShardError>
    where
        R: Send + 'static,
        F: FnOnce(&mut ShardState) -> R + Send + 'static,
    {
        let sender = self
            .senders
            .get(shard)
            .ok_or(ShardError::NoSuchShard(shard))?;
        let (tx, rx) = bounded(1);
        sender
            .send(Box::new(move |state: &mut ShardState| {
                let _ = tx.send(f(state));
            }))
            .map_err(|_| ShardError::ShardGone(shard))?;
        rx.recv().map_err(|_| ShardError::ShardGone(shard))
    }

    /// Runs `f` on every shard in parallel and collects the results in shard
    /// order. Submission is non-blocking; collection waits for all shards.
    pub fn submit_all<R, F>(&self, f: F) -> Result<Vec<R>, ShardError>
    where
        R: Send + 'static,
        F: Fn(&mut ShardState) -> R + Send + Clone + 'static,
    {
        let mut receivers = Vec::with_capacity(self.senders.len());
        for (shard, sender) in self.senders.iter().enumerate() {
            let (tx, rx) = bounded(1);
            let f = f.clone();
            sender
                .send(Box::new(move |state: &mut ShardState| {
                    let _ = tx.send(f(state));
                }))
                .map_err(|_| ShardError::ShardGone(shard))?;
            receivers.push((shard, rx));
        }
        let mut results = Vec::with_capacity(receivers.len());
        for (shard, rx) in receivers {
            results.push(rx.recv().map_err(|_| ShardError::ShardGone(shard))?);
        }
        Ok(results)
    }
}

impl Drop for ShardPool {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
