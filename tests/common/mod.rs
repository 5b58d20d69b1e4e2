#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;

use voicelink::net::{Socket, SocketEvent, SocketFactory};

/// One scripted connection handed to the transport. The test side plays the
/// server: feed events in, observe frames out.
pub struct FakeConnection {
    pub uri: String,
    events: mpsc::Sender<SocketEvent>,
    written: mpsc::UnboundedReceiver<String>,
}

impl FakeConnection {
    pub async fn open(&self) {
        let _ = self.events.send(SocketEvent::Opened).await;
    }

    pub async fn message(&self, frame: &str) {
        let _ = self
            .events
            .send(SocketEvent::Message(frame.to_string()))
            .await;
    }

    pub async fn error(&self, reason: &str) {
        let _ = self
            .events
            .send(SocketEvent::Error(reason.to_string()))
            .await;
    }

    pub async fn close(&self, code: u16) {
        let _ = self
            .events
            .send(SocketEvent::Closed {
                code,
                reason: String::new(),
            })
            .await;
    }

    /// Waits for the next frame the transport wrote to this socket.
    pub async fn expect_frame(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(60), self.written.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket dropped")
    }

    pub fn try_frame(&mut self) -> Option<String> {
        self.written.try_recv().ok()
    }
}

struct FakeSocket {
    written: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
}

#[async_trait]
impl Socket for FakeSocket {
    async fn send(&self, frame: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("socket is closed");
        }
        self.written
            .send(frame.to_string())
            .map_err(|_| anyhow::anyhow!("test side dropped the socket"))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Deterministic in-memory socket factory. Every connection attempt shows
/// up on the receiver returned by [`FakeSocketFactory::new`].
pub struct FakeSocketFactory {
    accepted: mpsc::UnboundedSender<FakeConnection>,
    refuse: AtomicBool,
}

impl FakeSocketFactory {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeConnection>) {
        let (accepted, attempts) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                accepted,
                refuse: AtomicBool::new(false),
            }),
            attempts,
        )
    }

    /// Makes every following `connect` call fail outright, as a malformed
    /// URI would.
    pub fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SocketFactory for FakeSocketFactory {
    async fn connect(&self, uri: &str) -> Result<(Arc<dyn Socket>, mpsc::Receiver<SocketEvent>)> {
        if self.refuse.load(Ordering::SeqCst) {
            bail!("refused: {uri}");
        }
        let (events_tx, events_rx) = mpsc::channel(32);
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let _ = self.accepted.send(FakeConnection {
            uri: uri.to_string(),
            events: events_tx,
            written: written_rx,
        });
        Ok((
            Arc::new(FakeSocket {
                written: written_tx,
                closed: AtomicBool::new(false),
            }),
            events_rx,
        ))
    }
}

/// Waits for the next connection attempt. Under the paused clock this
/// auto-advances time up to the pending backoff deadline.
pub async fn next_connection(
    attempts: &mut mpsc::UnboundedReceiver<FakeConnection>,
) -> FakeConnection {
    tokio::time::timeout(Duration::from_secs(600), attempts.recv())
        .await
        .expect("timed out waiting for a connection attempt")
        .expect("factory dropped")
}

/// Lets every queued task and message hop run without moving the clock.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}
