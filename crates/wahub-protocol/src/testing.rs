//! Scripted in-memory protocol driver for tests.
//!
//! Tests connect through a [`ScriptedConnector`], then drive each
//! [`ScriptedSession`] by emitting [`ProtocolEvent`]s in the order the real
//! driver would.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use wahub_core::PhoneNumber;

use crate::error::{ProtocolError, ProtocolResult};
use crate::event::ProtocolEvent;
use crate::session::{ConnectOptions, EventStream, ProtocolConnector, ProtocolSession};

/// Event channel capacity for scripted sessions.
const CHANNEL_CAPACITY: usize = 256;

/// A scripted session socket.
pub struct ScriptedSession {
    options: ConnectOptions,
    tx: mpsc::Sender<ProtocolEvent>,
    open: AtomicBool,
    logged_out: AtomicBool,
    send_counter: AtomicU64,
    sent: Mutex<Vec<(PhoneNumber, Value)>>,
    next_send_error: Mutex<Option<ProtocolError>>,
}

impl ScriptedSession {
    fn new(options: ConnectOptions, tx: mpsc::Sender<ProtocolEvent>) -> Self {
        Self {
            options,
            tx,
            open: AtomicBool::new(false),
            logged_out: AtomicBool::new(false),
            send_counter: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
            next_send_error: Mutex::new(None),
        }
    }

    /// The options this session was connected with.
    #[must_use]
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Emit an event into the session's stream, updating the open flag for
    /// `Opened`/`Closed`. Returns `false` if the consumer went away.
    pub async fn emit(&self, event: ProtocolEvent) -> bool {
        match &event {
            ProtocolEvent::Opened => self.open.store(true, Ordering::SeqCst),
            ProtocolEvent::Closed { .. } => self.open.store(false, Ordering::SeqCst),
            _ => {}
        }
        self.tx.send(event).await.is_ok()
    }

    /// Messages sent through this session so far.
    pub async fn sent(&self) -> Vec<(PhoneNumber, Value)> {
        self.sent.lock().await.clone()
    }

    /// Make the next `send` fail with the given error.
    pub async fn fail_next_send(&self, error: ProtocolError) {
        *self.next_send_error.lock().await = Some(error);
    }

    /// Whether `logout` was called.
    #[must_use]
    pub fn logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    /// Force the open flag (for scripting edge cases).
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProtocolSession for ScriptedSession {
    async fn send(&self, to: &PhoneNumber, content: &Value) -> ProtocolResult<String> {
        if let Some(error) = self.next_send_error.lock().await.take() {
            return Err(error);
        }
        if !self.is_open() {
            return Err(ProtocolError::NotConnected);
        }
        let n = self.send_counter.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().await.push((to.clone(), content.clone()));
        Ok(format!("3EB0SCRIPTED{n:04}"))
    }

    async fn logout(&self) -> ProtocolResult<()> {
        self.logged_out.store(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> ProtocolResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// A connector handing out [`ScriptedSession`]s.
pub struct ScriptedConnector {
    auto_open: bool,
    connect_count: AtomicUsize,
    connect_faults: Mutex<Vec<ProtocolError>>,
    sessions: Mutex<Vec<Arc<ScriptedSession>>>,
}

impl ScriptedConnector {
    /// A connector whose sessions emit `Opened` immediately on connect.
    #[must_use]
    pub fn auto_opening() -> Self {
        Self {
            auto_open: true,
            connect_count: AtomicUsize::new(0),
            connect_faults: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// A connector whose sessions stay silent until the test emits events.
    #[must_use]
    pub fn manual() -> Self {
        Self {
            auto_open: false,
            connect_count: AtomicUsize::new(0),
            connect_faults: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Queue a failure for an upcoming `connect`; faults are consumed in
    /// order before any session is handed out.
    pub async fn fail_next_connect(&self, error: ProtocolError) {
        self.connect_faults.lock().await.push(error);
    }

    /// Number of successful connects so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// The `i`-th session connected (0-based).
    pub async fn session(&self, i: usize) -> Option<Arc<ScriptedSession>> {
        self.sessions.lock().await.get(i).cloned()
    }

    /// The most recently connected session.
    pub async fn last_session(&self) -> Option<Arc<ScriptedSession>> {
        self.sessions.lock().await.last().cloned()
    }
}

#[async_trait]
impl ProtocolConnector for ScriptedConnector {
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> ProtocolResult<(Arc<dyn ProtocolSession>, EventStream)> {
        {
            let mut faults = self.connect_faults.lock().await;
            if !faults.is_empty() {
                return Err(faults.remove(0));
            }
        }
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let session = Arc::new(ScriptedSession::new(options, tx));
        if self.auto_open {
            session.emit(ProtocolEvent::Opened).await;
        }
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().await.push(Arc::clone(&session));
        Ok((session, rx))
    }
}
