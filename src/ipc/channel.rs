//! IPC channel - ordered, bidirectional message transport to one peer
//!
//! Outgoing frames go through a single queue drained by one writer task, so
//! submission order is wire order. Responses are matched to waiting
//! commands by conversation id; everything else is forwarded to the owner's
//! inbound queue. A broken stream closes the channel and fails every
//! pending command; nothing is retried here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::codec::{AsyncStream, FrameReader, write_frame};
use super::{Message, MessageKind, Payload, Target};
use crate::core::{Error, Result};

/// A command or event received on a channel
#[derive(Debug, Clone)]
pub struct Inbound {
    pub channel: Channel,
    pub message: Message,
}

#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

enum Outgoing {
    Frame(Message),
    /// Answered once every frame queued before it is written
    Flush(oneshot::Sender<()>),
}

struct Inner {
    label: String,
    outbound: flume::Sender<Outgoing>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Message>>>,
    closed: watch::Sender<bool>,
    reason: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.inner.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel {
    /// Start the reader and writer tasks over `stream`.
    pub fn spawn<S: AsyncStream>(
        label: impl Into<String>,
        stream: S,
        inbound: flume::Sender<Inbound>,
    ) -> Channel {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = flume::unbounded::<Outgoing>();
        let (closed, _) = watch::channel(false);

        let channel = Channel {
            inner: Arc::new(Inner {
                label: label.into(),
                outbound: out_tx,
                pending: Mutex::new(HashMap::new()),
                closed,
                reason: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let writer = {
            let channel = channel.clone();
            let mut closed_rx = channel.inner.closed.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = out_rx.recv_async() => {
                            match msg {
                                Ok(Outgoing::Frame(msg)) => {
                                    if let Err(e) = write_frame(&mut write_half, &msg).await {
                                        channel.close(format!("write failed: {e}"));
                                        break;
                                    }
                                }
                                Ok(Outgoing::Flush(done)) => {
                                    let _ = done.send(());
                                }
                                Err(_) => break,
                            }
                        }
                        // the watch::Ref is !Send; drop it inside the branch
                        _ = async { closed_rx.wait_for(|c| *c).await.is_ok() } => break,
                    }
                }
            })
        };

        let reader = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let mut frames = FrameReader::new(read_half);
                loop {
                    match frames.next().await {
                        Ok(Some(message)) => {
                            if message.kind == MessageKind::Response {
                                channel.complete(message);
                            } else if inbound
                                .send_async(Inbound {
                                    channel: channel.clone(),
                                    message,
                                })
                                .await
                                .is_err()
                            {
                                channel.close("inbound queue dropped");
                                break;
                            }
                        }
                        Ok(None) => {
                            channel.close("peer closed the stream");
                            break;
                        }
                        Err(e) => {
                            channel.close(e.to_string());
                            break;
                        }
                    }
                }
            })
        };

        channel.inner.tasks.lock().extend([writer, reader]);
        channel
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    pub fn closed_reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    /// Commands waiting for a response
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Queue a raw message.
    pub fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        debug!(
            channel = %self.inner.label,
            op = message.payload.name(),
            "send {:?}",
            message.kind
        );
        self.inner
            .outbound
            .send(Outgoing::Frame(message))
            .map_err(|_| self.closed_error())
    }

    /// Wait until everything queued so far has been written.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .outbound
            .send(Outgoing::Flush(tx))
            .map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| self.closed_error())
    }

    /// Fire-and-forget event with a fresh conversation id.
    pub fn notify(&self, target: Target, payload: Payload) -> Result<()> {
        self.send(Message::event(target, payload))
    }

    /// Answer `command` on this channel.
    pub fn respond(&self, command: &Message, target: Target, payload: Payload) -> Result<()> {
        self.send(Message::response(command, target, payload))
    }

    /// Send a command and wait for its response.
    ///
    /// A `Failed` response is turned back into the remote error. A closed
    /// channel yields `Transport`, no answer within `timeout` yields
    /// `Timeout`.
    pub async fn request(&self, target: Target, payload: Payload, timeout: Duration) -> Result<Payload> {
        let op = payload.name();
        let message = Message::command(target, payload);
        let conversation = message.conversation;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(conversation, tx);
        // close() drains pending after flagging, so re-check once registered
        if self.is_closed() {
            self.inner.pending.lock().remove(&conversation);
            return Err(self.closed_error());
        }
        if let Err(e) = self.send(message) {
            self.inner.pending.lock().remove(&conversation);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => match response.payload {
                Payload::Failed { error } => Err(Error::from_remote(error)),
                payload => Ok(payload),
            },
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                self.inner.pending.lock().remove(&conversation);
                Err(Error::timeout(format!("{op} on {}", self.inner.label), timeout))
            }
        }
    }

    /// Close the channel and fail every pending command.
    pub fn close(&self, reason: impl Into<String>) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        let reason = reason.into();
        debug!(channel = %self.inner.label, "closed: {}", reason);
        *self.inner.reason.lock() = Some(reason);
        self.inner.pending.lock().clear();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn complete(&self, response: Message) {
        let waiter = self.inner.pending.lock().remove(&response.conversation);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => warn!(
                channel = %self.inner.label,
                "dropping late {} response {}",
                response.payload.name(),
                response.conversation
            ),
        }
    }

    fn closed_error(&self) -> Error {
        let reason = self.closed_reason().unwrap_or_else(|| "closed".into());
        Error::Transport(format!("channel {}: {}", self.inner.label, reason))
    }
}
