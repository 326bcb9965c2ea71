pub mod ws;

use crate::protocol::{parse_frame, OutboundMessage, Reply};
use crate::state::AppEvent;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub const MAX_RETRIES: u32 = 3;
pub const RETRY_BACKOFF_MS: u64 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retry budget exhausted; nothing more will be attempted.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            backoff: Duration::from_millis(RETRY_BACKOFF_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

/// Retry bookkeeping, kept free of I/O so it can be stepped directly.
#[derive(Debug)]
pub struct Reconnector {
    policy: RetryPolicy,
    retry_count: u32,
}

impl Reconnector {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_count: 0,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn on_open(&mut self) {
        self.retry_count = 0;
    }

    pub fn on_close(&mut self) -> CloseDecision {
        if self.retry_count < self.policy.max_retries {
            self.retry_count += 1;
            CloseDecision::Retry {
                attempt: self.retry_count,
                delay: self.policy.backoff,
            }
        } else {
            CloseDecision::GiveUp
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    Closed,
    Reconnecting { attempt: u32, max: u32, delay: Duration },
    GaveUp,
    Message(Reply),
    Malformed(String),
}

/// A live duplex channel. The connection is gone once `incoming` yields `None`.
pub struct Link {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<Result<String, String>>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Link, String>;
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("not connected to the server")]
    NotConnected,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection task has stopped")]
    ChannelClosed,
}

pub trait MessageSender: Send + Sync {
    fn send(&self, message: &OutboundMessage) -> Result<(), SendError>;
    fn is_connected(&self) -> bool;
}

#[derive(Clone)]
pub struct ConnectionHandle {
    state: watch::Receiver<SessionState>,
    outbound: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

impl MessageSender for ConnectionHandle {
    /// Messages are dropped, not queued, while the connection is down.
    fn send(&self, message: &OutboundMessage) -> Result<(), SendError> {
        if self.state() != SessionState::Connected {
            return Err(SendError::NotConnected);
        }
        let frame = message.to_frame()?;
        self.outbound
            .send(frame)
            .map_err(|_| SendError::ChannelClosed)
    }

    fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }
}

pub struct ConnectionManager {
    url: String,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    state_tx: watch::Sender<SessionState>,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<AppEvent>,
}

impl ConnectionManager {
    pub fn new(
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        events: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            url: url.into(),
            transport,
            policy,
            state_tx,
            outbound_tx,
            outbound_rx,
            events,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            state: self.state_tx.subscribe(),
            outbound: self.outbound_tx.clone(),
        }
    }

    /// Connects and keeps reconnecting until the retry budget runs out.
    pub async fn run(mut self) {
        let mut reconnector = Reconnector::new(self.policy);
        loop {
            self.set_state(SessionState::Connecting);
            log::info!("[connection] connecting to {}", self.url);

            match self.transport.connect(&self.url).await {
                Ok(link) => {
                    reconnector.on_open();
                    self.discard_stale_outbound();
                    self.set_state(SessionState::Connected);
                    log::info!("[connection] connected");
                    self.emit(ConnectionEvent::Opened);
                    self.pump(link).await;
                    log::info!("[connection] connection closed");
                }
                Err(e) => {
                    log::warn!("[connection] connect failed: {}", e);
                }
            }

            self.set_state(SessionState::Disconnected);
            self.emit(ConnectionEvent::Closed);

            match reconnector.on_close() {
                CloseDecision::Retry { attempt, delay } => {
                    log::info!(
                        "[connection] reconnecting in {}ms (attempt {}/{})",
                        delay.as_millis(),
                        attempt,
                        self.policy.max_retries
                    );
                    self.emit(ConnectionEvent::Reconnecting {
                        attempt,
                        max: self.policy.max_retries,
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                }
                CloseDecision::GiveUp => {
                    log::error!(
                        "[connection] giving up after {} retries",
                        self.policy.max_retries
                    );
                    self.set_state(SessionState::Closed);
                    self.emit(ConnectionEvent::GaveUp);
                    return;
                }
            }
        }
    }

    async fn pump(&mut self, link: Link) {
        let Link {
            outgoing,
            mut incoming,
        } = link;
        loop {
            tokio::select! {
                frame = incoming.recv() => match frame {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(e)) => {
                        log::warn!("[connection] socket error: {}", e);
                        break;
                    }
                    None => break,
                },
                out = self.outbound_rx.recv() => {
                    let Some(text) = out else { break };
                    if outgoing.send(text).await.is_err() {
                        log::warn!("[connection] send failed; socket writer is gone");
                        break;
                    }
                }
            }
        }
    }

    fn dispatch(&self, frame: &str) {
        match parse_frame(frame) {
            Ok(reply) => self.emit(ConnectionEvent::Message(reply)),
            Err(e) => {
                log::warn!("[connection] dropping frame: {}", e);
                self.emit(ConnectionEvent::Malformed(e.to_string()));
            }
        }
    }

    fn discard_stale_outbound(&mut self) {
        let mut dropped = 0usize;
        while self.outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::warn!(
                "[connection] discarded {} message(s) queued while disconnected",
                dropped
            );
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(AppEvent::Connection(event));
    }
}
