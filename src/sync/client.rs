//! Client orchestrator.
//!
//! Sole owner of the per-job [`FileSyncState`]. Translates watcher events
//! into change announcements and answers the server's hash stream with a
//! reuse/replace reply stream read from the authoritative copy.

use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info};

use crate::sync::channel::{self, WatchEvent, WatchKind, CHUNK_SIZE};
use crate::sync::protocol::{read_frame, write_frame, ClientMsg, ServerMsg};
use crate::sync::read_up_to;

/// The file currently being served, positioned by the chunk cursor.
///
/// `handle` is `None` when the file vanished between announcement and
/// hashing; every chunk then degrades to "no data" and the job still ends
/// with a well-formed `End` so the server can settle it.
struct FileSyncState {
    file: String,
    seq_no: u64,
    handle: Option<File>,
}

struct Client {
    root: PathBuf,
    state: Option<FileSyncState>,
}

impl Client {
    fn new(root: PathBuf) -> Self {
        Self { root, state: None }
    }

    /// Run the orchestrator until either input queue closes.
    async fn run(
        mut self,
        mut events: mpsc::Receiver<WatchEvent>,
        mut from_server: mpsc::Receiver<ServerMsg>,
        to_server: mpsc::Sender<ClientMsg>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.announce(event, &to_server).await?,
                    None => break,
                },
                msg = from_server.recv() => match msg {
                    Some(msg) => self.respond(msg, &to_server).await?,
                    None => break,
                },
            }
        }
        Ok(())
    }

    async fn announce(&self, event: WatchEvent, out: &mpsc::Sender<ClientMsg>) -> Result<()> {
        let msg = match event.kind {
            WatchKind::Updated => {
                info!(file = %event.name, "announcing update");
                ClientMsg::Updated { file: event.name }
            }
            WatchKind::Removed => {
                info!(file = %event.name, "announcing removal");
                ClientMsg::Removed { file: event.name }
            }
        };
        send(out, msg).await
    }

    async fn respond(&mut self, msg: ServerMsg, out: &mpsc::Sender<ClientMsg>) -> Result<()> {
        match msg {
            ServerMsg::ChunkHash {
                file,
                seq_no,
                length,
                hash,
            } => {
                self.rotate(&file, seq_no).await?;
                self.answer_chunk(&file, seq_no, length, hash, out).await
            }
            ServerMsg::HashEnd { file, seq_no } => {
                self.rotate(&file, seq_no).await?;
                self.finish(&file, seq_no, out).await
            }
        }
    }

    /// Point the sync state at `(seq_no, file)`, opening the authoritative
    /// copy from the start. A file that vanished since its announcement is
    /// served as empty; the open is not fatal.
    async fn rotate(&mut self, file: &str, seq_no: u64) -> Result<()> {
        if let Some(state) = &self.state {
            if state.file == file && state.seq_no == seq_no {
                return Ok(());
            }
        }

        let path = self.root.join(file);
        let handle = match File::open(&path).await {
            Ok(f) => Some(f),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(file, seq_no, "file vanished before hashing; serving empty");
                None
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to open {}", path.display()));
            }
        };

        self.state = Some(FileSyncState {
            file: file.to_string(),
            seq_no,
            handle,
        });
        Ok(())
    }

    /// Answer one hash chunk: reuse it if our bytes at the cursor match,
    /// replace it otherwise. At EOF nothing is sent at all.
    async fn answer_chunk(
        &mut self,
        file: &str,
        seq_no: u64,
        length: u64,
        hash: [u8; 16],
        out: &mpsc::Sender<ClientMsg>,
    ) -> Result<()> {
        if length as usize > CHUNK_SIZE {
            anyhow::bail!("chunk length {length} exceeds protocol chunk size");
        }
        if length == 0 {
            return Ok(());
        }
        let Some(handle) = self.state.as_mut().and_then(|s| s.handle.as_mut()) else {
            return Ok(());
        };

        let mut buf = vec![0u8; length as usize];
        let n = read_up_to(handle, &mut buf)
            .await
            .with_context(|| format!("failed to read {file}"))?;
        if n == 0 {
            return Ok(());
        }

        let msg = if n as u64 == length && md5::compute(&buf[..n]).0 == hash {
            debug!(file, seq_no, length, "reusing chunk");
            ClientMsg::ReuseData {
                file: file.to_string(),
                seq_no,
                length,
            }
        } else {
            debug!(file, seq_no, len = n, "replacing chunk");
            ClientMsg::NewData {
                file: file.to_string(),
                seq_no,
                skip: n as u64,
                data: Bytes::copy_from_slice(&buf[..n]),
            }
        };
        send(out, msg).await
    }

    /// The hash stream ran out: everything left in the file is bytes the
    /// server has no hash for. Drain it, then end the reply stream.
    async fn finish(
        &mut self,
        file: &str,
        seq_no: u64,
        out: &mpsc::Sender<ClientMsg>,
    ) -> Result<()> {
        let Some(mut state) = self.state.take() else {
            return Ok(());
        };

        if let Some(handle) = state.handle.as_mut() {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = read_up_to(handle, &mut buf)
                    .await
                    .with_context(|| format!("failed to read {file}"))?;
                if n == 0 {
                    break;
                }
                debug!(file, seq_no, len = n, "sending tail chunk");
                send(
                    out,
                    ClientMsg::NewData {
                        file: file.to_string(),
                        seq_no,
                        skip: n as u64,
                        data: Bytes::copy_from_slice(&buf[..n]),
                    },
                )
                .await?;
            }
        }

        info!(file, seq_no, "reply stream finished");
        send(
            out,
            ClientMsg::End {
                file: file.to_string(),
                seq_no,
            },
        )
        .await
    }
}

async fn send(out: &mpsc::Sender<ClientMsg>, msg: ClientMsg) -> Result<()> {
    out.send(msg)
        .await
        .map_err(|_| anyhow::anyhow!("network writer queue closed"))
}

/// Decode inbound frames into the orchestrator queue.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: mpsc::Sender<ServerMsg>,
) -> Result<()> {
    loop {
        let (msg_type, payload) = read_frame(&mut reader).await?;
        let msg = ServerMsg::decode(msg_type, payload)?;
        if tx.send(msg).await.is_err() {
            return Ok(());
        }
    }
}

/// Encode queued messages onto the transport, flushing whenever the queue
/// momentarily drains.
async fn write_loop<W: AsyncWrite + Unpin>(
    writer: W,
    mut rx: mpsc::Receiver<ClientMsg>,
) -> Result<()> {
    let mut writer = BufWriter::new(writer);
    loop {
        let msg = match rx.try_recv() {
            Ok(msg) => msg,
            Err(TryRecvError::Empty) => {
                writer.flush().await.context("failed to flush to server")?;
                match rx.recv().await {
                    Some(msg) => msg,
                    None => break,
                }
            }
            Err(TryRecvError::Disconnected) => break,
        };
        write_frame(&mut writer, &msg.encode()).await?;
    }
    writer.flush().await.context("failed to flush to server")?;
    Ok(())
}

/// Wire the client task set to a connected transport and run until the
/// first task stops. The connection is the only source of truth, so any
/// task ending (cleanly or not) ends the peer.
///
/// `events` is the watcher queue; tests inject events into it directly.
pub async fn run<R, W>(
    root: impl Into<PathBuf>,
    reader: R,
    writer: W,
    events: mpsc::Receiver<WatchEvent>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (in_tx, in_rx) = channel::server_msg_queue();
    let (out_tx, out_rx) = channel::client_msg_queue();

    let mut read_task = tokio::spawn(read_loop(reader, in_tx));
    let mut write_task = tokio::spawn(write_loop(writer, out_rx));
    let mut orchestrator = tokio::spawn(Client::new(root.into()).run(events, in_rx, out_tx));

    let result = tokio::select! {
        r = &mut read_task => r,
        r = &mut write_task => r,
        r = &mut orchestrator => r,
    };
    read_task.abort();
    write_task.abort();
    orchestrator.abort();
    result.context("client task panicked")?
}
