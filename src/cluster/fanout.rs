//! Copies one inbound data stream to many outbound dispatches.
//!
//! Each subscriber gets its own unbounded queue so a slow or stuck target
//! never stalls the others. Dropping the [`Fanout`] closes every queue,
//! which subscribers translate into the end-of-stream marker.

use crate::config::types::Result;
use crate::wire::channel::Client;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io::{Read, Write};
use std::sync::Arc;

pub type Chunk = Arc<[u8]>;

#[derive(Default)]
pub struct Fanout {
    outputs: Vec<Sender<Chunk>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<Chunk> {
        let (tx, rx) = unbounded();
        self.outputs.push(tx);
        rx
    }

    /// Queue `bytes` for every live subscriber; returns how many remain.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        if bytes.is_empty() {
            return self.outputs.len();
        }
        let chunk: Chunk = Arc::from(bytes);
        self.outputs.retain(|tx| tx.send(chunk.clone()).is_ok());
        self.outputs.len()
    }

    pub fn close(self) {}
}

/// Write every queued chunk to `client`, then the end-of-stream marker.
pub fn forward<R: Read, W: Write>(chunks: &Receiver<Chunk>, client: &mut Client<R, W>) -> Result<u64> {
    let mut total = 0u64;
    for chunk in chunks.iter() {
        client.write_chunk(&chunk)?;
        total += chunk.len() as u64;
    }
    client.finish()?;
    Ok(total)
}
