//! Outbound half of a connection.
//!
//! A [`Messenger`] is a cheap clonable handle: the session, its file
//! uploader and the server's publisher all hold one. Encoded frames go
//! through a bounded channel to a single writer task, so frames from
//! different holders never interleave mid-line.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use filesync_core::codec::{self, Envelope, Message};

use crate::error::DaemonError;
use crate::framing::write_frames;

const OUTBOUND_QUEUE: usize = 64;

/// Per-connection counters.
#[derive(Debug, Default)]
pub struct Stats {
    bytes_sent: AtomicU64,
    client_errors: AtomicU32,
    server_errors: AtomicU32,
}

impl Stats {
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn client_errors(&self) -> u32 {
        self.client_errors.load(Ordering::Relaxed)
    }

    pub fn server_errors(&self) -> u32 {
        self.server_errors.load(Ordering::Relaxed)
    }

    /// Count one error caused by the peer; returns the new total.
    pub fn client_error(&self) -> u32 {
        self.client_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count one local failure; returns the new total.
    pub fn server_error(&self) -> u32 {
        self.server_errors.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Clone)]
pub struct Messenger {
    frames: mpsc::Sender<String>,
    token: Arc<Mutex<String>>,
    stats: Arc<Stats>,
}

impl Messenger {
    /// Spawn the writer task for `writer`. The task ends once every clone of
    /// the returned messenger is dropped.
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<Result<(), DaemonError>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let handle = tokio::spawn(write_frames(writer, rx));
        (Self::from_channel(tx), handle)
    }

    /// A messenger whose frames land in `frames` instead of a stream.
    pub fn from_channel(frames: mpsc::Sender<String>) -> Self {
        Self {
            frames,
            token: Arc::new(Mutex::new(String::new())),
            stats: Arc::new(Stats::default()),
        }
    }

    /// Token stamped on every following envelope.
    pub fn set_token(&self, token: &str) {
        let mut guard = self.token.lock().unwrap_or_else(|e| e.into_inner());
        *guard = token.to_string();
    }

    pub fn token(&self) -> String {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub async fn send(&self, message: Message) -> Result<(), DaemonError> {
        let frame = codec::encode(&Envelope::new(self.token(), message))?;
        let len = frame.len() as u64 + 1;
        self.frames
            .send(frame)
            .await
            .map_err(|_| DaemonError::ChannelClosed("outbound frames"))?;
        self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Report `err` to the peer with its wire code and safe explanation.
    pub async fn send_error(&self, err: &DaemonError) -> Result<(), DaemonError> {
        self.send(Message::error(err.code(), err.explained())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filesync_core::codec::decode;

    #[tokio::test]
    async fn envelopes_carry_the_current_token() {
        let (tx, mut rx) = mpsc::channel(4);
        let messenger = Messenger::from_channel(tx);

        messenger.send(Message::EndSync).await.expect("send");
        messenger.set_token("T0k3n");
        messenger.clone().send(Message::EndSync).await.expect("send");

        let first = decode(&rx.recv().await.expect("frame")).expect("decode");
        let second = decode(&rx.recv().await.expect("frame")).expect("decode");
        assert_eq!(first.auth_token, "");
        assert_eq!(second.auth_token, "T0k3n");
    }

    #[tokio::test]
    async fn clones_share_counters() {
        let (tx, mut rx) = mpsc::channel(4);
        let messenger = Messenger::from_channel(tx);
        let other = messenger.clone();

        other.send(Message::CloseConnection).await.expect("send");
        let frame = rx.recv().await.expect("frame");
        assert_eq!(messenger.stats().bytes_sent(), frame.len() as u64 + 1);

        assert_eq!(other.stats().client_error(), 1);
        assert_eq!(messenger.stats().client_error(), 2);
        assert_eq!(messenger.stats().server_errors(), 0);
    }

    #[tokio::test]
    async fn send_fails_once_the_writer_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = Messenger::from_channel(tx)
            .send(Message::EndSync)
            .await
            .unwrap_err();
        assert!(err.ends_connection());
    }
}
