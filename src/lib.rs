//! Continuous, one-way, delta-based synchronization of a flat directory
//! from a client host to a server host over a single TCP connection.
//!
//! The client watches a directory; every create, modify and remove is
//! announced to the server, which replies with a stream of chunk hashes of
//! its current copy. The client answers with a reply stream that reuses
//! matching chunks and resends the rest, and the server assembles the
//! result in a temp file that is published by atomic rename, but only if
//! no newer update for the same path was announced in the meantime.

pub mod sync;
pub mod temp_file;
pub mod transport;
pub mod watcher;
