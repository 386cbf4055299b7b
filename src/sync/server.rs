//! Server orchestrator and in-progress receive.
//!
//! Sole owner of `next_seq`, `latest_file_seq` and the single
//! [`ReceiveState`]. Mints a sequence number per update announcement,
//! schedules hash scans, and assembles each reply stream into a
//! hidden-prefix temp sink that is published by atomic rename only if the
//! job is still the latest one for its path.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufWriter, SeekFrom};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info};

use crate::sync::channel::{self, HashJob, CHUNK_SIZE};
use crate::sync::protocol::{read_frame, validate_name, write_frame, ClientMsg, ServerMsg};
use crate::sync::{hasher, read_up_to};
use crate::temp_file::TempFileGuard;

/// One in-flight file reception: the old copy (if any) being read for
/// chunk reuse, and the temp sink the reply stream is assembled into.
struct ReceiveState {
    file: String,
    input: Option<File>,
    temp: File,
    temp_path: PathBuf,
    guard: TempFileGuard,
}

struct Server {
    root: PathBuf,
    next_seq: u64,
    latest_file_seq: HashMap<String, u64>,
    receiving: Option<ReceiveState>,
}

impl Server {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            next_seq: 0,
            latest_file_seq: HashMap::new(),
            receiving: None,
        }
    }

    /// Run the orchestrator until the inbound queue closes.
    async fn run(
        mut self,
        mut from_client: mpsc::Receiver<ClientMsg>,
        jobs: mpsc::Sender<HashJob>,
    ) -> Result<()> {
        while let Some(msg) = from_client.recv().await {
            self.handle(msg, &jobs).await?;
        }
        Ok(())
    }

    async fn handle(&mut self, msg: ClientMsg, jobs: &mpsc::Sender<HashJob>) -> Result<()> {
        match msg {
            ClientMsg::Updated { file } => self.handle_updated(file, jobs).await,
            ClientMsg::Removed { file } => self.handle_removed(file).await,
            ClientMsg::ReuseData {
                file,
                seq_no,
                length,
            } => self.handle_reuse(&file, seq_no, length).await,
            ClientMsg::NewData {
                file,
                seq_no,
                skip,
                data,
            } => self.handle_new_data(&file, seq_no, skip, data).await,
            ClientMsg::End { file, seq_no } => self.handle_end(&file, seq_no).await,
        }
    }

    async fn handle_updated(&mut self, file: String, jobs: &mpsc::Sender<HashJob>) -> Result<()> {
        validate_name(&file)?;
        self.next_seq += 1;
        let seq_no = self.next_seq;
        self.latest_file_seq.insert(file.clone(), seq_no);
        info!(file = %file, seq_no, "update announced; scheduling hash scan");
        jobs.send(HashJob { file, seq_no })
            .await
            .map_err(|_| anyhow::anyhow!("hash scanner queue closed"))
    }

    async fn handle_removed(&mut self, file: String) -> Result<()> {
        validate_name(&file)?;
        self.latest_file_seq.remove(&file);

        let path = self.root.join(&file);
        match fs::remove_file(&path).await {
            Ok(()) => info!(file = %file, "file removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(file = %file, "removal of absent file; nothing to do");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to remove {}", path.display()));
            }
        }
        Ok(())
    }

    /// Open the old copy and the temp sink on the first message of a reply
    /// stream. The temp sink lives in the synchronized directory itself so
    /// the final rename stays within one filesystem and is atomic.
    async fn begin_receive(&mut self, file: &str, seq_no: u64) -> Result<()> {
        validate_name(file)?;

        let input = match File::open(self.root.join(file)).await {
            Ok(f) => Some(f),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("failed to open old copy of {file}"));
            }
        };

        // Sequence numbers make the name unique per job; truncating lets a
        // restart reuse a name left behind by a crashed predecessor.
        let temp_path = self.root.join(format!(".tmp.{seq_no}"));
        let guard = TempFileGuard::new(&temp_path);
        let temp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("failed to create temp sink {}", temp_path.display()))?;

        debug!(file, seq_no, had_copy = input.is_some(), "receiving file");
        self.receiving = Some(ReceiveState {
            file: file.to_string(),
            input,
            temp,
            temp_path,
            guard,
        });
        Ok(())
    }

    /// The receive state for a chunk message, created on the stream's
    /// first message. Reply streams are well-grouped per job, so a chunk
    /// for a different file mid-stream is a broken peer.
    async fn receive_state(&mut self, file: &str, seq_no: u64) -> Result<&mut ReceiveState> {
        if self.receiving.is_none() {
            self.begin_receive(file, seq_no).await?;
        }
        let state = self.receiving.as_mut().context("receive state missing")?;
        if state.file != file {
            anyhow::bail!(
                "chunk for {file:?} interleaved into the reply stream of {:?}",
                state.file
            );
        }
        Ok(state)
    }

    /// The client's bytes at the cursor match ours: copy `length` bytes of
    /// the old copy into the temp sink instead of receiving them.
    async fn handle_reuse(&mut self, file: &str, seq_no: u64, length: u64) -> Result<()> {
        if length as usize > CHUNK_SIZE {
            anyhow::bail!("reuse length {length} exceeds protocol chunk size");
        }
        let state = self.receive_state(file, seq_no).await?;

        // The hash stream is only ever produced from an existing copy, so
        // reuse cannot arrive without one; tolerate it as empty.
        let Some(input) = state.input.as_mut() else {
            return Ok(());
        };

        let mut buf = vec![0u8; length as usize];
        let n = read_up_to(input, &mut buf)
            .await
            .with_context(|| format!("failed to read old copy of {file}"))?;
        state
            .temp
            .write_all(&buf[..n])
            .await
            .context("failed to write temp sink")?;
        debug!(file, seq_no, reused = n, "reused chunk");
        Ok(())
    }

    /// Fresh bytes from the client. The old copy's cursor is advanced past
    /// the superseded region so later reuses stay aligned; `data.len()` is
    /// the authoritative write length.
    async fn handle_new_data(
        &mut self,
        file: &str,
        seq_no: u64,
        skip: u64,
        data: Bytes,
    ) -> Result<()> {
        let state = self.receive_state(file, seq_no).await?;

        if let Some(input) = state.input.as_mut() {
            input
                .seek(SeekFrom::Current(skip as i64))
                .await
                .context("failed to skip stale chunk in old copy")?;
        }

        state
            .temp
            .write_all(&data)
            .await
            .context("failed to write temp sink")?;
        debug!(file, seq_no, len = data.len(), "wrote replacement chunk");
        Ok(())
    }

    /// End of the reply stream: publish or discard. The temp file is
    /// renamed over the target only if this job is still the latest for
    /// the path; a newer announcement mid-transfer silently turned this
    /// one into a discard.
    async fn handle_end(&mut self, file: &str, seq_no: u64) -> Result<()> {
        // An End with no preceding chunks still opens (and settles) an
        // empty sink: the client had nothing to send.
        self.receive_state(file, seq_no).await?;
        let state = self.receiving.take().context("receive state missing")?;

        let ReceiveState {
            file: _,
            input,
            mut temp,
            temp_path,
            guard,
        } = state;
        drop(input);

        temp.flush().await.context("failed to flush temp sink")?;
        temp.sync_all().await.context("failed to sync temp sink")?;
        drop(temp);

        if self.latest_file_seq.get(file) == Some(&seq_no) {
            let target = self.root.join(file);
            fs::rename(&temp_path, &target)
                .await
                .with_context(|| format!("failed to publish {}", target.display()))?;
            guard.defuse();
            info!(file, seq_no, "published file");
        } else {
            fs::remove_file(&temp_path)
                .await
                .context("failed to discard superseded temp sink")?;
            guard.defuse();
            info!(file, seq_no, "discarded superseded transfer");
        }
        Ok(())
    }
}

/// Decode inbound frames into the orchestrator queue.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: mpsc::Sender<ClientMsg>,
) -> Result<()> {
    loop {
        let (msg_type, payload) = read_frame(&mut reader).await?;
        let msg = ClientMsg::decode(msg_type, payload)?;
        if tx.send(msg).await.is_err() {
            return Ok(());
        }
    }
}

/// Encode queued messages onto the transport, flushing whenever the queue
/// momentarily drains.
async fn write_loop<W: AsyncWrite + Unpin>(
    writer: W,
    mut rx: mpsc::Receiver<ServerMsg>,
) -> Result<()> {
    let mut writer = BufWriter::new(writer);
    loop {
        let msg = match rx.try_recv() {
            Ok(msg) => msg,
            Err(TryRecvError::Empty) => {
                writer.flush().await.context("failed to flush to client")?;
                match rx.recv().await {
                    Some(msg) => msg,
                    None => break,
                }
            }
            Err(TryRecvError::Disconnected) => break,
        };
        write_frame(&mut writer, &msg.encode()).await?;
    }
    writer.flush().await.context("failed to flush to client")?;
    Ok(())
}

/// Wire the server task set to a connected transport and run until the
/// first task stops. Any task ending (cleanly or not) ends the peer.
pub async fn run<R, W>(root: impl Into<PathBuf>, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let root = root.into();
    let (in_tx, in_rx) = channel::client_msg_queue();
    let (out_tx, out_rx) = channel::server_msg_queue();
    let (job_tx, job_rx) = channel::job_queue();

    let mut read_task = tokio::spawn(read_loop(reader, in_tx));
    let mut write_task = tokio::spawn(write_loop(writer, out_rx));
    let mut hash_task = tokio::spawn(hasher::run(root.clone(), job_rx, out_tx));
    let mut orchestrator = tokio::spawn(Server::new(root).run(in_rx, job_tx));

    let result = tokio::select! {
        r = &mut read_task => r,
        r = &mut write_task => r,
        r = &mut hash_task => r,
        r = &mut orchestrator => r,
    };
    read_task.abort();
    write_task.abort();
    hash_task.abort();
    orchestrator.abort();
    result.context("server task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as std_fs;
    use tempfile::TempDir;

    fn harness(tmp: &TempDir) -> (Server, mpsc::Sender<HashJob>, mpsc::Receiver<HashJob>) {
        let server = Server::new(tmp.path().to_path_buf());
        let (job_tx, job_rx) = channel::job_queue();
        (server, job_tx, job_rx)
    }

    fn no_temp_residue(tmp: &TempDir) {
        for entry in std_fs::read_dir(tmp.path()).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(
                !name.to_string_lossy().starts_with(".tmp."),
                "stale temp file left behind: {name:?}"
            );
        }
    }

    #[tokio::test]
    async fn updates_mint_increasing_seq_nos() {
        let tmp = TempDir::new().unwrap();
        let (mut server, job_tx, mut job_rx) = harness(&tmp);

        server
            .handle(
                ClientMsg::Updated {
                    file: "a.txt".to_string(),
                },
                &job_tx,
            )
            .await
            .unwrap();
        server
            .handle(
                ClientMsg::Updated {
                    file: "b.txt".to_string(),
                },
                &job_tx,
            )
            .await
            .unwrap();

        assert_eq!(
            job_rx.recv().await.unwrap(),
            HashJob {
                file: "a.txt".to_string(),
                seq_no: 1,
            }
        );
        assert_eq!(
            job_rx.recv().await.unwrap(),
            HashJob {
                file: "b.txt".to_string(),
                seq_no: 2,
            }
        );
        assert_eq!(server.latest_file_seq.get("a.txt"), Some(&1));
        assert_eq!(server.latest_file_seq.get("b.txt"), Some(&2));
    }

    #[tokio::test]
    async fn removal_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        std_fs::write(tmp.path().join("real.txt"), b"bytes").unwrap();
        let (mut server, job_tx, _job_rx) = harness(&tmp);

        server
            .handle(
                ClientMsg::Removed {
                    file: "real.txt".to_string(),
                },
                &job_tx,
            )
            .await
            .unwrap();
        assert!(!tmp.path().join("real.txt").exists());

        // Absent file: still fine.
        server
            .handle(
                ClientMsg::Removed {
                    file: "real.txt".to_string(),
                },
                &job_tx,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reply_stream_builds_a_new_file() {
        let tmp = TempDir::new().unwrap();
        let (mut server, job_tx, mut job_rx) = harness(&tmp);

        server
            .handle(
                ClientMsg::Updated {
                    file: "fresh.txt".to_string(),
                },
                &job_tx,
            )
            .await
            .unwrap();
        let job = job_rx.recv().await.unwrap();

        server
            .handle(
                ClientMsg::NewData {
                    file: "fresh.txt".to_string(),
                    seq_no: job.seq_no,
                    skip: 5,
                    data: Bytes::from_static(b"hello"),
                },
                &job_tx,
            )
            .await
            .unwrap();
        server
            .handle(
                ClientMsg::End {
                    file: "fresh.txt".to_string(),
                    seq_no: job.seq_no,
                },
                &job_tx,
            )
            .await
            .unwrap();

        assert_eq!(
            std_fs::read(tmp.path().join("fresh.txt")).unwrap(),
            b"hello"
        );
        no_temp_residue(&tmp);
    }

    #[tokio::test]
    async fn reuse_copies_from_the_old_copy() {
        let tmp = TempDir::new().unwrap();
        let mut old = vec![0x0Fu8; CHUNK_SIZE];
        old.extend_from_slice(&[0xF0u8; CHUNK_SIZE]);
        std_fs::write(tmp.path().join("mix.bin"), &old).unwrap();

        let (mut server, job_tx, mut job_rx) = harness(&tmp);
        server
            .handle(
                ClientMsg::Updated {
                    file: "mix.bin".to_string(),
                },
                &job_tx,
            )
            .await
            .unwrap();
        let job = job_rx.recv().await.unwrap();

        // First chunk reused, second replaced.
        let replacement = vec![0xABu8; CHUNK_SIZE];
        server
            .handle(
                ClientMsg::ReuseData {
                    file: "mix.bin".to_string(),
                    seq_no: job.seq_no,
                    length: CHUNK_SIZE as u64,
                },
                &job_tx,
            )
            .await
            .unwrap();
        server
            .handle(
                ClientMsg::NewData {
                    file: "mix.bin".to_string(),
                    seq_no: job.seq_no,
                    skip: CHUNK_SIZE as u64,
                    data: Bytes::copy_from_slice(&replacement),
                },
                &job_tx,
            )
            .await
            .unwrap();
        server
            .handle(
                ClientMsg::End {
                    file: "mix.bin".to_string(),
                    seq_no: job.seq_no,
                },
                &job_tx,
            )
            .await
            .unwrap();

        let mut expected = old[..CHUNK_SIZE].to_vec();
        expected.extend_from_slice(&replacement);
        assert_eq!(std_fs::read(tmp.path().join("mix.bin")).unwrap(), expected);
        no_temp_residue(&tmp);
    }

    #[tokio::test]
    async fn superseded_job_is_discarded_at_commit() {
        let tmp = TempDir::new().unwrap();
        let (mut server, job_tx, mut job_rx) = harness(&tmp);

        for _ in 0..2 {
            server
                .handle(
                    ClientMsg::Updated {
                        file: "d.txt".to_string(),
                    },
                    &job_tx,
                )
                .await
                .unwrap();
        }
        let first = job_rx.recv().await.unwrap();
        let second = job_rx.recv().await.unwrap();
        assert!(first.seq_no < second.seq_no);

        // The older job completes first and must be discarded.
        server
            .handle(
                ClientMsg::NewData {
                    file: "d.txt".to_string(),
                    seq_no: first.seq_no,
                    skip: 2,
                    data: Bytes::from_static(b"v1"),
                },
                &job_tx,
            )
            .await
            .unwrap();
        server
            .handle(
                ClientMsg::End {
                    file: "d.txt".to_string(),
                    seq_no: first.seq_no,
                },
                &job_tx,
            )
            .await
            .unwrap();
        assert!(!tmp.path().join("d.txt").exists());

        server
            .handle(
                ClientMsg::NewData {
                    file: "d.txt".to_string(),
                    seq_no: second.seq_no,
                    skip: 2,
                    data: Bytes::from_static(b"v2"),
                },
                &job_tx,
            )
            .await
            .unwrap();
        server
            .handle(
                ClientMsg::End {
                    file: "d.txt".to_string(),
                    seq_no: second.seq_no,
                },
                &job_tx,
            )
            .await
            .unwrap();

        assert_eq!(std_fs::read(tmp.path().join("d.txt")).unwrap(), b"v2");
        no_temp_residue(&tmp);
    }

    #[tokio::test]
    async fn bare_end_commits_an_empty_file() {
        let tmp = TempDir::new().unwrap();
        let (mut server, job_tx, mut job_rx) = harness(&tmp);

        server
            .handle(
                ClientMsg::Updated {
                    file: "ghost".to_string(),
                },
                &job_tx,
            )
            .await
            .unwrap();
        let job = job_rx.recv().await.unwrap();

        // The client's file vanished: the reply stream is a bare End.
        server
            .handle(
                ClientMsg::End {
                    file: "ghost".to_string(),
                    seq_no: job.seq_no,
                },
                &job_tx,
            )
            .await
            .unwrap();

        assert_eq!(std_fs::read(tmp.path().join("ghost")).unwrap(), b"");
        no_temp_residue(&tmp);
    }

    #[tokio::test]
    async fn removal_mid_transfer_discards_the_job() {
        let tmp = TempDir::new().unwrap();
        let (mut server, job_tx, mut job_rx) = harness(&tmp);

        server
            .handle(
                ClientMsg::Updated {
                    file: "e.txt".to_string(),
                },
                &job_tx,
            )
            .await
            .unwrap();
        let job = job_rx.recv().await.unwrap();

        server
            .handle(
                ClientMsg::Removed {
                    file: "e.txt".to_string(),
                },
                &job_tx,
            )
            .await
            .unwrap();

        server
            .handle(
                ClientMsg::NewData {
                    file: "e.txt".to_string(),
                    seq_no: job.seq_no,
                    skip: 4,
                    data: Bytes::from_static(b"late"),
                },
                &job_tx,
            )
            .await
            .unwrap();
        server
            .handle(
                ClientMsg::End {
                    file: "e.txt".to_string(),
                    seq_no: job.seq_no,
                },
                &job_tx,
            )
            .await
            .unwrap();

        assert!(!tmp.path().join("e.txt").exists());
        no_temp_residue(&tmp);
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let (mut server, job_tx, _job_rx) = harness(&tmp);

        for bad in ["../escape", ".tmp.9", "", "a/b"] {
            assert!(
                server
                    .handle(
                        ClientMsg::Updated {
                            file: bad.to_string(),
                        },
                        &job_tx,
                    )
                    .await
                    .is_err(),
                "name {bad:?} should be rejected"
            );
        }
    }
}
