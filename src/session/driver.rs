// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Session driver
//!
//! A single task owns the transport and the [`SessionMachine`]. Callers talk
//! to it through a cloneable [`SessionHandle`] (commands with oneshot
//! replies) and read lifecycle notifications from [`SessionEvents`]. Inbound
//! messages are handed to the [`MessageHandler`] registered for the matching
//! subscription, each on its own task.

use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::state::{Effect, PublishWaiter, SessionMachine, SessionNotification, SessionState};
use super::topic;
use super::transport::{InboundMessage, QoS, Transport, TransportEvent};
use crate::config::{MqttConfig, ReconnectPolicy};
use crate::error::{SessionError, TransportError};

/// Receives messages for a subscription
///
/// Invoked concurrently from the session's dispatch tasks.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: InboundMessage);
}

/// Tunables for the session driver
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub reconnect: ReconnectPolicy,
    /// Upper bound on waiting for in-flight acknowledgments at disconnect
    pub disconnect_timeout: Duration,
    pub command_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            disconnect_timeout: Duration::from_secs(10),
            command_capacity: 100,
        }
    }
}

impl From<&MqttConfig> for SessionOptions {
    fn from(config: &MqttConfig) -> Self {
        Self {
            reconnect: config.reconnect.clone(),
            disconnect_timeout: config.disconnect_timeout(),
            command_capacity: config.request_capacity,
        }
    }
}

enum Command {
    Connect {
        waiter: oneshot::Sender<Result<bool, SessionError>>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
        waiter: oneshot::Sender<Result<QoS, SessionError>>,
    },
    Publish {
        topic: String,
        qos: QoS,
        payload: Bytes,
        waiter: PublishWaiter,
    },
    Disconnect {
        waiter: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// Entry point for starting a session over a transport
pub struct Session;

impl Session {
    /// Spawn the driver task; nothing is sent until [`SessionHandle::connect`]
    pub fn start<T>(transport: T, options: SessionOptions) -> (SessionHandle, SessionEvents)
    where
        T: Transport + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(options.command_capacity.max(1));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);

        let driver = Driver {
            transport,
            machine: SessionMachine::new(),
            options,
            commands: command_rx,
            commands_open: true,
            notifications: notify_tx,
            state: state_tx,
            routes: Vec::new(),
            connect_waiter: None,
            disconnect_waiters: Vec::new(),
            disconnect_sent: false,
            deadline: None,
            backoff: None,
            retry_at: None,
        };
        tokio::spawn(driver.run());

        (
            SessionHandle {
                commands: command_tx,
                state: state_rx,
            },
            SessionEvents { rx: notify_rx },
        )
    }
}

/// Cloneable handle for issuing session requests
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Connect and wait for the broker's acknowledgment
    ///
    /// Returns whether the broker resumed a prior session.
    pub async fn connect(&self) -> Result<bool, SessionError> {
        self.request(|waiter| Command::Connect { waiter }).await
    }

    /// Subscribe and wait for the granted QoS
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<QoS, SessionError> {
        self.request(|waiter| Command::Subscribe {
            filter: filter.to_string(),
            qos,
            handler,
            waiter,
        })
        .await
    }

    /// Queue a publish; the returned future completes on acknowledgment
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        payload: Bytes,
    ) -> Result<PublishAck, SessionError> {
        let (waiter, rx) = oneshot::channel();
        self.commands
            .send(Command::Publish {
                topic: topic.to_string(),
                qos,
                payload,
                waiter,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(PublishAck { rx })
    }

    /// Disconnect once in-flight publishes settle (bounded by the timeout)
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|waiter| Command::Disconnect { waiter }).await
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<R, SessionError>>) -> Command,
    ) -> Result<R, SessionError> {
        let (waiter, rx) = oneshot::channel();
        self.commands
            .send(command(waiter))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

/// Completes when the broker acknowledges a publish
#[must_use = "dropping the ack does not cancel the publish"]
pub struct PublishAck {
    rx: oneshot::Receiver<Result<(), SessionError>>,
}

impl Future for PublishAck {
    type Output = Result<(), SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(SessionError::Closed)))
    }
}

/// Lifecycle notifications from the driver
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionNotification>,
}

impl SessionEvents {
    pub async fn next(&mut self) -> Option<SessionNotification> {
        self.rx.recv().await
    }

    /// Wait for the first connect acknowledgment
    pub async fn wait_connected(&mut self) -> Result<bool, SessionError> {
        while let Some(notification) = self.rx.recv().await {
            match notification {
                SessionNotification::Connected { session_present } => return Ok(session_present),
                SessionNotification::Fatal(error) => return Err(error),
                _ => {}
            }
        }
        Err(SessionError::Closed)
    }

    /// Wait for a fatal error; `None` once the session ended without one
    pub async fn fatal(&mut self) -> Option<SessionError> {
        while let Some(notification) = self.rx.recv().await {
            if let SessionNotification::Fatal(error) = notification {
                return Some(error);
            }
        }
        None
    }
}

enum Wake {
    Command(Option<Command>),
    Deadline,
    Retry,
    Transport(Result<TransportEvent, TransportError>),
}

struct Driver<T> {
    transport: T,
    machine: SessionMachine,
    options: SessionOptions,
    commands: mpsc::Receiver<Command>,
    commands_open: bool,
    notifications: mpsc::UnboundedSender<SessionNotification>,
    state: watch::Sender<SessionState>,
    routes: Vec<(String, Arc<dyn MessageHandler>)>,
    connect_waiter: Option<oneshot::Sender<Result<bool, SessionError>>>,
    disconnect_waiters: Vec<oneshot::Sender<Result<(), SessionError>>>,
    disconnect_sent: bool,
    /// Drain deadline while disconnecting
    deadline: Option<Instant>,
    backoff: Option<Duration>,
    retry_at: Option<Instant>,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self) {
        loop {
            let polling = self.machine.state() != SessionState::Disconnected
                && self.retry_at.is_none();

            let wake = tokio::select! {
                biased;
                command = self.commands.recv(), if self.commands_open => Wake::Command(command),
                _ = sleep_until(self.deadline.unwrap_or_else(Instant::now)), if self.deadline.is_some() => Wake::Deadline,
                _ = sleep_until(self.retry_at.unwrap_or_else(Instant::now)), if self.retry_at.is_some() => Wake::Retry,
                event = self.transport.poll(), if polling => Wake::Transport(event),
                else => break,
            };

            let flow = match wake {
                Wake::Command(Some(command)) => self.on_command(command),
                Wake::Command(None) => self.on_handles_dropped(),
                Wake::Deadline => self.on_deadline(),
                Wake::Retry => {
                    self.retry_at = None;
                    ControlFlow::Continue(())
                }
                Wake::Transport(Ok(event)) => self.on_event(event),
                Wake::Transport(Err(error)) => self.on_connection_error(error),
            };

            let flow = match flow {
                ControlFlow::Continue(()) => self.maybe_finish_drain(),
                stop => stop,
            };

            self.state.send_replace(self.machine.state());
            if flow.is_break() {
                break;
            }
        }
        debug!("session driver stopped");
    }

    fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect { waiter } => match self.machine.begin_connect() {
                Ok(()) => {
                    info!("connecting");
                    self.connect_waiter = Some(waiter);
                }
                Err(e) => {
                    let _ = waiter.send(Err(e));
                }
            },
            Command::Subscribe {
                filter,
                qos,
                handler,
                waiter,
            } => {
                if let Err(e) = self.check_request(&filter, topic::is_valid_filter(&filter)) {
                    let _ = waiter.send(Err(e));
                    return ControlFlow::Continue(());
                }
                let filters = vec![(filter.clone(), qos)];
                match self.transport.subscribe(&filters) {
                    Ok(()) => {
                        debug!(filter = %filter, ?qos, "subscribe queued");
                        self.routes.retain(|(existing, _)| existing != &filter);
                        self.routes.push((filter, handler));
                        self.machine.track_subscribe(filters, waiter);
                    }
                    Err(e) => {
                        let _ = waiter.send(Err(SessionError::Request(e.to_string())));
                    }
                }
            }
            Command::Publish {
                topic,
                qos,
                payload,
                waiter,
            } => {
                if let Err(e) = self.check_request(&topic, topic::is_valid_topic_name(&topic)) {
                    let _ = waiter.send(Err(e));
                    return ControlFlow::Continue(());
                }
                match self.transport.publish(&topic, qos, payload) {
                    Ok(()) => self.machine.track_publish(qos, Some(waiter)),
                    Err(e) => {
                        let _ = waiter.send(Err(SessionError::Request(e.to_string())));
                    }
                }
            }
            Command::Disconnect { waiter } => match self.machine.state() {
                SessionState::Disconnecting => self.disconnect_waiters.push(waiter),
                _ => match self.machine.begin_disconnect() {
                    Ok(()) => {
                        info!(
                            pending = self.machine.pending_publishes(),
                            "disconnecting"
                        );
                        self.disconnect_waiters.push(waiter);
                        self.deadline = Some(Instant::now() + self.options.disconnect_timeout);
                    }
                    Err(e) => {
                        let _ = waiter.send(Err(e));
                    }
                },
            },
        }
        ControlFlow::Continue(())
    }

    fn check_request(&self, topic: &str, valid: bool) -> Result<(), SessionError> {
        if !self.machine.accepts_requests() {
            return Err(SessionError::InvalidState(format!(
                "request for '{}' while {:?}",
                topic,
                self.machine.state()
            )));
        }
        if !valid {
            return Err(SessionError::Request(format!("invalid topic '{}'", topic)));
        }
        Ok(())
    }

    fn on_handles_dropped(&mut self) -> ControlFlow<()> {
        self.commands_open = false;
        match self.machine.state() {
            SessionState::Disconnected => ControlFlow::Break(()),
            SessionState::Disconnecting => ControlFlow::Continue(()),
            _ => {
                debug!("all session handles dropped, disconnecting");
                if self.machine.begin_disconnect().is_ok() {
                    self.deadline = Some(Instant::now() + self.options.disconnect_timeout);
                }
                ControlFlow::Continue(())
            }
        }
    }

    fn on_deadline(&mut self) -> ControlFlow<()> {
        if self.disconnect_sent {
            warn!("broker never confirmed disconnect, closing");
            self.notify(SessionNotification::Closed);
            return self.close();
        }
        warn!(
            pending = self.machine.pending_publishes(),
            "disconnect timeout with unacknowledged publishes"
        );
        self.send_disconnect()
    }

    fn maybe_finish_drain(&mut self) -> ControlFlow<()> {
        if self.machine.state() == SessionState::Disconnecting
            && !self.disconnect_sent
            && self.machine.pending_publishes() == 0
        {
            return self.send_disconnect();
        }
        ControlFlow::Continue(())
    }

    fn send_disconnect(&mut self) -> ControlFlow<()> {
        self.disconnect_sent = true;
        match self.transport.disconnect() {
            Ok(()) => {
                self.deadline = Some(Instant::now() + self.options.disconnect_timeout);
                ControlFlow::Continue(())
            }
            Err(e) => {
                warn!("disconnect request failed: {}", e);
                self.notify(SessionNotification::Closed);
                self.close()
            }
        }
    }

    fn on_event(&mut self, event: TransportEvent) -> ControlFlow<()> {
        match self.machine.on_event(event) {
            Ok(effects) => self.apply(effects),
            Err(fatal) => self.fail(fatal),
        }
    }

    fn on_connection_error(&mut self, error: TransportError) -> ControlFlow<()> {
        match self.machine.on_connection_error(&error) {
            Ok(effects) => {
                let delay = self.next_backoff();
                debug!(?delay, "reconnect scheduled");
                self.retry_at = Some(Instant::now() + delay);
                self.apply(effects)
            }
            Err(fatal) => self.fail(fatal),
        }
    }

    fn next_backoff(&mut self) -> Duration {
        let delay = self
            .backoff
            .unwrap_or_else(|| self.options.reconnect.initial_delay());
        self.backoff = Some((delay * 2).min(self.options.reconnect.max_delay()));
        delay
    }

    fn apply(&mut self, effects: Vec<Effect>) -> ControlFlow<()> {
        for effect in effects {
            match effect {
                Effect::Notify(notification) => self.notify(notification),
                Effect::Resubscribe(topics) => {
                    info!(count = topics.len(), "session lost, resubscribing");
                    if let Err(e) = self.transport.subscribe(&topics) {
                        return self.fail(SessionError::Request(format!(
                            "resubscribe failed: {}",
                            e
                        )));
                    }
                    self.machine.track_resubscribe(topics);
                }
                Effect::Deliver(message) => self.dispatch(message),
                Effect::Closed => return self.close(),
            }
        }
        ControlFlow::Continue(())
    }

    fn notify(&mut self, notification: SessionNotification) {
        match &notification {
            SessionNotification::Connected { session_present } => {
                info!(session_present, "connected");
                self.backoff = None;
                if let Some(waiter) = self.connect_waiter.take() {
                    let _ = waiter.send(Ok(*session_present));
                }
            }
            SessionNotification::Interrupted { cause } => {
                warn!("connection interrupted: {}", cause);
            }
            SessionNotification::Resumed { session_present } => {
                info!(session_present, "connection resumed");
                self.backoff = None;
            }
            SessionNotification::Resubscribed { topics } => {
                info!(?topics, "resubscribed");
            }
            SessionNotification::Fatal(e) => error!("fatal session error: {}", e),
            SessionNotification::Closed => info!("disconnected"),
        }
        // Nobody listening is fine
        let _ = self.notifications.send(notification);
    }

    fn dispatch(&self, message: InboundMessage) {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .routes
            .iter()
            .filter(|(filter, _)| topic::matches(filter, &message.topic))
            .map(|(_, handler)| handler.clone())
            .collect();

        if handlers.is_empty() {
            debug!(topic = %message.topic, "no handler for message");
            return;
        }

        for handler in handlers {
            let message = message.clone();
            tokio::spawn(async move {
                handler.on_message(message).await;
            });
        }
    }

    fn fail(&mut self, error: SessionError) -> ControlFlow<()> {
        self.machine.abort(&error);
        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Err(error.clone()));
        }
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        self.notify(SessionNotification::Fatal(error));
        ControlFlow::Break(())
    }

    fn close(&mut self) -> ControlFlow<()> {
        if self.machine.state() != SessionState::Disconnected {
            self.machine.abort(&SessionError::Closed);
        }
        self.deadline = None;
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        ControlFlow::Break(())
    }
}
