//! Queue types shared by the client and server task sets.
//!
//! Each peer is a fixed set of tasks communicating exclusively through
//! bounded queues; no mutable state crosses a task boundary. A slow
//! transport therefore backpressures through the whole pipeline instead of
//! growing memory without limit.

use tokio::sync::mpsc;

use crate::sync::protocol::{ClientMsg, ServerMsg};

/// Fixed chunk size, identical on both peers. Chunk boundaries are
/// positional, not content-defined: the protocol trades bandwidth for
/// per-chunk false negatives on shifted content. The size is part of the
/// wire contract and is not negotiated.
pub const CHUNK_SIZE: usize = 4096;

/// Watcher -> client orchestrator queue depth.
pub const EVENT_QUEUE_SIZE: usize = 1024;

/// Network reader -> orchestrator and orchestrator -> network writer depth.
pub const MSG_QUEUE_SIZE: usize = 64;

/// Server orchestrator -> hash scanner queue depth.
pub const JOB_QUEUE_SIZE: usize = 1024;

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Updated,
    Removed,
}

/// One filesystem change, named relative to the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub name: String,
    pub kind: WatchKind,
}

/// One file-to-sync job handed to the hash scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashJob {
    pub file: String,
    pub seq_no: u64,
}

/// Watcher -> client orchestrator.
pub fn event_queue() -> (mpsc::Sender<WatchEvent>, mpsc::Receiver<WatchEvent>) {
    mpsc::channel(EVENT_QUEUE_SIZE)
}

/// Inbound/outbound `ClientMsg` queue (server reader, client writer).
pub fn client_msg_queue() -> (mpsc::Sender<ClientMsg>, mpsc::Receiver<ClientMsg>) {
    mpsc::channel(MSG_QUEUE_SIZE)
}

/// Inbound/outbound `ServerMsg` queue (client reader, server writer).
pub fn server_msg_queue() -> (mpsc::Sender<ServerMsg>, mpsc::Receiver<ServerMsg>) {
    mpsc::channel(MSG_QUEUE_SIZE)
}

/// Server orchestrator -> hash scanner.
pub fn job_queue() -> (mpsc::Sender<HashJob>, mpsc::Receiver<HashJob>) {
    mpsc::channel(JOB_QUEUE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_queue_carries_jobs_in_order() {
        let (tx, mut rx) = job_queue();

        tx.send(HashJob {
            file: "a.txt".to_string(),
            seq_no: 1,
        })
        .await
        .unwrap();
        tx.send(HashJob {
            file: "b.txt".to_string(),
            seq_no: 2,
        })
        .await
        .unwrap();
        drop(tx);

        assert_eq!(rx.recv().await.unwrap().seq_no, 1);
        assert_eq!(rx.recv().await.unwrap().seq_no, 2);
        assert!(rx.recv().await.is_none());
    }
}
