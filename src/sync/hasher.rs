//! Hash scanner.
//!
//! A single worker draining the job queue FIFO, so hash streams for
//! different jobs never interleave on the wire. For each job it streams
//! the MD5 of every chunk of the server's current copy, terminated by
//! `HashEnd`; a missing copy yields the empty hash stream, which tells the
//! client to send everything.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::debug;

use crate::sync::channel::{HashJob, CHUNK_SIZE};
use crate::sync::protocol::ServerMsg;
use crate::sync::read_up_to;

/// Run the scanner until the job queue closes.
pub async fn run(
    root: PathBuf,
    mut jobs: mpsc::Receiver<HashJob>,
    out: mpsc::Sender<ServerMsg>,
) -> Result<()> {
    while let Some(job) = jobs.recv().await {
        scan(&root, &job, &out).await?;
    }
    Ok(())
}

async fn scan(root: &Path, job: &HashJob, out: &mpsc::Sender<ServerMsg>) -> Result<()> {
    let path = root.join(&job.file);

    let file = match File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(file = %job.file, seq_no = job.seq_no, "no current copy; requesting everything");
            return send(
                out,
                ServerMsg::HashEnd {
                    file: job.file.clone(),
                    seq_no: job.seq_no,
                },
            )
            .await;
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to open {}", path.display()));
        }
    };

    let mut reader = BufReader::new(file);
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = read_up_to(&mut reader, &mut buf)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        debug!(file = %job.file, seq_no = job.seq_no, len = n, "hashing chunk");
        send(
            out,
            ServerMsg::ChunkHash {
                file: job.file.clone(),
                seq_no: job.seq_no,
                length: n as u64,
                hash: md5::compute(&buf[..n]).0,
            },
        )
        .await?;
    }

    send(
        out,
        ServerMsg::HashEnd {
            file: job.file.clone(),
            seq_no: job.seq_no,
        },
    )
    .await
}

async fn send(out: &mpsc::Sender<ServerMsg>, msg: ServerMsg) -> Result<()> {
    out.send(msg)
        .await
        .map_err(|_| anyhow::anyhow!("network writer queue closed"))
}
