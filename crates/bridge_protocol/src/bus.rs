//! The bus facade used on both sides of the channel.
//!
//! ### Outbound
//! [`Bus::post_async`] mints a correlation id, parks a completion handler in
//! the [`CorrelationTable`], writes a `call` frame and awaits the answer.
//! There is no retry, and no timeout unless [`BusConfig::call_timeout`] is set.
//!
//! ### Inbound
//! [`Bus::serve`] reads frames until the channel closes:
//! * `call` → the side's [`CallHandler`] runs in its own task, its outcome goes
//!   back as `ok` / `error` with the same id (calls may finish out of order)
//! * `ok` / `error` → the matching pending call completes; unknown ids are ignored
//! * anything else → every listener registered for that status
//! * undecodable frames are dropped

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::codec;
use crate::correlation::CorrelationTable;
use crate::error::BusError;
use crate::listeners::EventListeners;
use crate::message::{Envelope, Message};
use crate::request::Request;
use crate::transport::FrameSender;

pub const ROUTE_NOT_FOUND: &str = "route not found";
pub const HANDLER_PANICKED: &str = "handler panicked";

/// Answers the `call` frames arriving on one side.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    async fn handle(&self, target: &str, args: Vec<Value>) -> anyhow::Result<Value>;
}

/// A side that exposes nothing: every call fails with [`ROUTE_NOT_FOUND`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRoutes;

#[async_trait]
impl CallHandler for NoRoutes {
    async fn handle(&self, _target: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
        Err(anyhow::anyhow!(ROUTE_NOT_FOUND))
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Shows up in log lines, e.g. `ui` or `worker`.
    pub label: String,
    /// `None`: an unanswered call never completes.
    pub call_timeout: Option<Duration>,
}

impl BusConfig {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), call_timeout: None }
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new("bus")
    }
}

struct Shared {
    config: BusConfig,
    sender: FrameSender,
    pending: CorrelationTable,
    listeners: EventListeners,
}

#[derive(Clone)]
pub struct Bus {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("label", &self.shared.config.label)
            .field("pending", &self.shared.pending.pending_count())
            .field("listeners", &self.shared.listeners)
            .finish()
    }
}

impl Bus {
    pub fn new(sender: FrameSender, config: BusConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                sender,
                pending: CorrelationTable::new(),
                listeners: EventListeners::new(),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.shared.config.label
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.pending_count()
    }

    // ---------------------------------------------------------------------
    // Outbound calls
    // ---------------------------------------------------------------------

    /// Call handler group `target` on the other side with positional `args`.
    pub async fn post_async(
        &self,
        target: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<Value, BusError> {
        let target = target.into();
        let pending = &self.shared.pending;
        let (id, rx) = pending.open();

        let sent = codec::encode(&Message::call(id.clone(), target.clone(), args))
            .and_then(|frame| self.shared.sender.send(frame));
        if let Err(err) = sent {
            pending.cancel(&id);
            return Err(err);
        }
        trace!(bus = %self.label(), %id, %target, "call sent");

        let completion = match self.shared.config.call_timeout {
            None => rx.await,
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(completion) => completion,
                Err(_) => {
                    pending.cancel(&id);
                    warn!(bus = %self.label(), %id, %target, "call timed out");
                    return Err(BusError::Timeout(limit.as_millis() as u64));
                }
            },
        };

        match completion {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(BusError::Remote(message)),
            Err(_) => Err(BusError::Dropped),
        }
    }

    /// Typed variant of [`post_async`](Self::post_async).
    pub async fn call(&self, request: Request) -> Result<Value, BusError> {
        let (group, args) = request.into_parts();
        self.post_async(group.as_ref(), args).await
    }

    // ---------------------------------------------------------------------
    // One-way events
    // ---------------------------------------------------------------------

    /// Write an uncorrelated frame. Never blocks; a failed write is logged and
    /// reported as `false`, it is not an error for the emitter.
    pub fn emit(&self, message: Message) -> bool {
        let status = message.status.clone();
        match codec::encode(&message).and_then(|frame| self.shared.sender.send(frame)) {
            Ok(()) => true,
            Err(err) => {
                warn!(bus = %self.label(), %status, error = %err, "event not forwarded");
                false
            }
        }
    }

    pub fn emit_event(&self, category: impl AsRef<str>, value: Value) -> bool {
        self.emit(Message::event(category, value))
    }

    pub fn emit_signal(&self, category: impl AsRef<str>) -> bool {
        self.emit(Message::signal(category))
    }

    pub fn add_listener<F>(&self, category: impl Into<String>, listener: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.listeners.add(category, Arc::new(listener));
    }

    pub fn subscribe(&self, category: impl Into<String>) -> mpsc::UnboundedReceiver<Value> {
        self.shared.listeners.subscribe(category)
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    /// Receive loop. Returns when the inbound channel closes.
    pub async fn serve(
        &self,
        mut receiver: mpsc::UnboundedReceiver<String>,
        handler: Arc<dyn CallHandler>,
    ) {
        while let Some(frame) = receiver.recv().await {
            self.receive(&frame, &handler);
        }
        info!(bus = %self.label(), pending = self.pending_count(), "channel closed");
    }

    /// Process a single inbound frame.
    pub fn receive(&self, frame: &str, handler: &Arc<dyn CallHandler>) {
        let message = match codec::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                debug!(bus = %self.label(), error = %err, "dropping undecodable frame");
                return;
            }
        };

        match message.classify() {
            Some(Envelope::Call { id, target, args }) => self.answer(id, target, args, handler.clone()),
            Some(Envelope::Ok { id, value }) => {
                self.shared.pending.resolve(&id, value);
            }
            Some(Envelope::Error { id, message }) => {
                self.shared.pending.reject(&id, message);
            }
            Some(Envelope::Event { category, value }) => {
                let delivered = self.shared.listeners.dispatch(&category, &value);
                trace!(bus = %self.label(), %category, delivered, "event");
            }
            None => debug!(bus = %self.label(), "dropping unclassifiable frame"),
        }
    }

    fn answer(&self, id: String, target: String, args: Vec<Value>, handler: Arc<dyn CallHandler>) {
        let bus = self.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler.handle(&target, args))
                .catch_unwind()
                .await;
            let reply = match outcome {
                Ok(Ok(value)) => Message::ok(id, value),
                Ok(Err(err)) => {
                    debug!(bus = %bus.label(), %target, error = %err, "call failed");
                    Message::error(id, err.to_string())
                }
                Err(_) => {
                    error!(bus = %bus.label(), %target, "call handler panicked");
                    Message::error(id, HANDLER_PANICKED)
                }
            };
            if let Err(err) = codec::encode(&reply).and_then(|frame| bus.shared.sender.send(frame)) {
                warn!(bus = %bus.label(), %target, error = %err, "reply not sent");
            }
        });
    }
}
