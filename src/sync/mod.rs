//! The delta-sync core: the wire protocol plus the two paired state
//! machines that drive it.
//!
//! # Architecture
//!
//! ```text
//! client                                        server
//! +---------+   events   +--------------+       +--------------+   jobs   +--------+
//! | watcher | ---------> | orchestrator | --+-> | orchestrator | -------> | hasher |
//! +---------+            +--------------+   |   +--------------+          +--------+
//!                               ^           |          |  temp sink + atomic rename
//!                               |           |          v
//!                           hash stream   reply     root/<file>
//!                        (ChunkHash*,    stream
//!                          HashEnd)   ((New|Reuse)*, End)
//! ```
//!
//! The server answers every `Updated` announcement with a hash stream of
//! its current copy; the client answers every hash stream with a reply
//! stream of reused and replaced chunks. Sequence numbers minted by the
//! server decide at commit time whether a finished transfer is still the
//! latest one for its path.

pub mod channel;
pub mod client;
pub mod hasher;
pub mod protocol;
pub mod server;

pub use channel::{HashJob, WatchEvent, WatchKind, CHUNK_SIZE};
pub use protocol::{ClientMsg, MessageType, ServerMsg};

use tokio::io::{AsyncRead, AsyncReadExt};

/// Read until `buf` is full or EOF; returns the number of bytes read.
/// A plain `read` may return short on a perfectly healthy file.
pub(crate) async fn read_up_to<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
