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

//! Session state machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Interrupted -> Resubscribing -> Connected
//!                                   \______________________________________/
//!                                              -> Disconnecting -> Disconnected
//! ```
//!
//! The machine performs no I/O. It is fed transport events and caller
//! requests and answers with [`Effect`]s for the driver to carry out.
//! Acknowledgment waiters are resolved here, as soon as the matching
//! packet is seen.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::transport::{InboundMessage, QoS, TransportEvent};
use crate::error::{SessionError, TransportError};

/// Resolved with the granted QoS once the broker acknowledges a subscribe
pub type SubscribeWaiter = oneshot::Sender<Result<QoS, SessionError>>;
/// Resolved once a publish is acknowledged (or written, for QoS 0)
pub type PublishWaiter = oneshot::Sender<Result<(), SessionError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Interrupted,
    Resubscribing,
    /// Disconnect requested; waiting for in-flight publishes to settle
    Disconnecting,
}

/// Lifecycle notifications delivered to the main control flow
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotification {
    Connected { session_present: bool },
    Interrupted { cause: String },
    Resumed { session_present: bool },
    Resubscribed { topics: Vec<(String, QoS)> },
    Fatal(SessionError),
    Closed,
}

/// Work the driver must carry out on behalf of the machine
#[derive(Debug, PartialEq)]
pub enum Effect {
    Notify(SessionNotification),
    /// Re-issue these subscriptions; the broker dropped the session
    Resubscribe(Vec<(String, QoS)>),
    Deliver(InboundMessage),
    Closed,
}

enum SubscribeOrigin {
    Caller(SubscribeWaiter),
    Resubscribe,
}

struct PendingSubscribe {
    filters: Vec<(String, QoS)>,
    origin: SubscribeOrigin,
}

struct PendingPublish {
    qos: QoS,
    waiter: Option<PublishWaiter>,
}

impl PendingPublish {
    fn resolve(self, result: Result<(), SessionError>) {
        if let Some(waiter) = self.waiter {
            // The caller may have dropped its ack future
            let _ = waiter.send(result);
        }
    }
}

pub struct SessionMachine {
    state: SessionState,
    /// Subscriptions the broker has granted, replayed after session loss
    active: BTreeMap<String, QoS>,
    /// Requests handed to the transport, waiting for their packet id
    unsent_subscribes: VecDeque<PendingSubscribe>,
    inflight_subscribes: HashMap<u16, PendingSubscribe>,
    unsent_publishes: VecDeque<PendingPublish>,
    inflight_publishes: HashMap<u16, PendingPublish>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            active: BTreeMap::new(),
            unsent_subscribes: VecDeque::new(),
            inflight_subscribes: HashMap::new(),
            unsent_publishes: VecDeque::new(),
            inflight_publishes: HashMap::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Subscriptions granted so far, in filter order
    pub fn active_topics(&self) -> Vec<(String, QoS)> {
        self.active
            .iter()
            .map(|(topic, qos)| (topic.clone(), *qos))
            .collect()
    }

    /// Publishes not yet acknowledged
    pub fn pending_publishes(&self) -> usize {
        self.unsent_publishes.len() + self.inflight_publishes.len()
    }

    pub fn begin_connect(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Disconnected => {
                self.state = SessionState::Connecting;
                Ok(())
            }
            other => Err(SessionError::InvalidState(format!(
                "connect requested while {:?}",
                other
            ))),
        }
    }

    /// Whether new subscribe/publish requests are accepted
    pub fn accepts_requests(&self) -> bool {
        !matches!(
            self.state,
            SessionState::Disconnected | SessionState::Disconnecting
        )
    }

    /// Record a caller subscribe the transport has accepted
    pub fn track_subscribe(&mut self, filters: Vec<(String, QoS)>, waiter: SubscribeWaiter) {
        self.unsent_subscribes.push_back(PendingSubscribe {
            filters,
            origin: SubscribeOrigin::Caller(waiter),
        });
    }

    /// Record a resubscribe the transport has accepted
    pub fn track_resubscribe(&mut self, filters: Vec<(String, QoS)>) {
        self.unsent_subscribes.push_back(PendingSubscribe {
            filters,
            origin: SubscribeOrigin::Resubscribe,
        });
    }

    /// Record a publish the transport has accepted
    pub fn track_publish(&mut self, qos: QoS, waiter: Option<PublishWaiter>) {
        self.unsent_publishes
            .push_back(PendingPublish { qos, waiter });
    }

    pub fn begin_disconnect(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Disconnected => Err(SessionError::Closed),
            SessionState::Disconnecting => Err(SessionError::InvalidState(
                "disconnect already in progress".to_string(),
            )),
            _ => {
                self.state = SessionState::Disconnecting;
                Ok(())
            }
        }
    }

    /// Feed one transport event through the machine
    ///
    /// An `Err` is fatal: the machine has moved to `Disconnected` and every
    /// waiter has been failed.
    pub fn on_event(&mut self, event: TransportEvent) -> Result<Vec<Effect>, SessionError> {
        match event {
            TransportEvent::ConnAck { session_present } => Ok(self.on_connack(session_present)),
            TransportEvent::SubscribeSent { pkid } => {
                match self.unsent_subscribes.pop_front() {
                    Some(pending) => {
                        self.inflight_subscribes.insert(pkid, pending);
                    }
                    None => warn!(pkid, "subscribe sent with no tracked request"),
                }
                Ok(Vec::new())
            }
            TransportEvent::SubAck { pkid, granted } => self.on_suback(pkid, granted),
            TransportEvent::PublishSent { pkid } => {
                self.on_publish_sent(pkid);
                Ok(Vec::new())
            }
            TransportEvent::PubAck { pkid } => {
                match self.inflight_publishes.remove(&pkid) {
                    Some(pending) => pending.resolve(Ok(())),
                    None => debug!(pkid, "puback for untracked packet"),
                }
                Ok(Vec::new())
            }
            TransportEvent::Message(message) => Ok(vec![Effect::Deliver(message)]),
            TransportEvent::DisconnectSent => {
                if self.state != SessionState::Disconnecting {
                    warn!(state = ?self.state, "disconnect sent outside of shutdown");
                }
                self.state = SessionState::Disconnected;
                self.fail_all(&SessionError::Closed);
                Ok(vec![
                    Effect::Notify(SessionNotification::Closed),
                    Effect::Closed,
                ])
            }
        }
    }

    /// Feed a transport failure through the machine
    ///
    /// Failing while connecting is fatal; failing later is an interruption
    /// the transport recovers from by reconnecting.
    pub fn on_connection_error(
        &mut self,
        error: &TransportError,
    ) -> Result<Vec<Effect>, SessionError> {
        match self.state {
            SessionState::Connecting => {
                let fatal = SessionError::Connect(error.to_string());
                self.abort(&fatal);
                Err(fatal)
            }
            SessionState::Connected | SessionState::Resubscribing => {
                let cause = error.to_string();
                self.state = SessionState::Interrupted;
                self.fail_subscribes(&SessionError::Interrupted(cause.clone()));
                Ok(vec![Effect::Notify(SessionNotification::Interrupted {
                    cause,
                })])
            }
            SessionState::Disconnecting => {
                let cause = error.to_string();
                self.fail_subscribes(&SessionError::Interrupted(cause.clone()));
                Ok(vec![Effect::Notify(SessionNotification::Interrupted {
                    cause,
                })])
            }
            // A reconnect attempt failed; keep waiting
            SessionState::Interrupted => Ok(Vec::new()),
            SessionState::Disconnected => Err(SessionError::Closed),
        }
    }

    /// Move to `Disconnected`, failing every outstanding waiter with `error`
    pub fn abort(&mut self, error: &SessionError) {
        self.state = SessionState::Disconnected;
        self.fail_all(error);
    }

    fn on_connack(&mut self, session_present: bool) -> Vec<Effect> {
        match self.state {
            SessionState::Connecting => {
                self.state = SessionState::Connected;
                vec![Effect::Notify(SessionNotification::Connected {
                    session_present,
                })]
            }
            SessionState::Interrupted => {
                let mut effects = vec![Effect::Notify(SessionNotification::Resumed {
                    session_present,
                })];
                if !session_present && !self.active.is_empty() {
                    self.state = SessionState::Resubscribing;
                    effects.push(Effect::Resubscribe(self.active_topics()));
                } else {
                    self.state = SessionState::Connected;
                }
                effects
            }
            // Reconnected while draining for shutdown; nothing to restore
            SessionState::Disconnecting => Vec::new(),
            other => {
                warn!(state = ?other, "unexpected connack");
                Vec::new()
            }
        }
    }

    fn on_suback(
        &mut self,
        pkid: u16,
        granted: Vec<Option<QoS>>,
    ) -> Result<Vec<Effect>, SessionError> {
        let Some(pending) = self.inflight_subscribes.remove(&pkid) else {
            warn!(pkid, "suback for untracked packet");
            return Ok(Vec::new());
        };

        // A missing return code counts as a refusal
        let rejected = pending
            .filters
            .iter()
            .enumerate()
            .find(|(i, _)| granted.get(*i).copied().flatten().is_none())
            .map(|(_, (topic, _))| topic.clone());

        match (pending.origin, rejected) {
            (SubscribeOrigin::Caller(waiter), Some(topic)) => {
                let _ = waiter.send(Err(SessionError::SubscribeRejected { topic }));
                Ok(Vec::new())
            }
            (SubscribeOrigin::Caller(waiter), None) => {
                let mut first = None;
                for ((topic, _), qos) in pending.filters.into_iter().zip(granted.into_iter().flatten()) {
                    first.get_or_insert(qos);
                    self.active.insert(topic, qos);
                }
                let _ = waiter.send(first.ok_or_else(|| SessionError::SubscribeRejected {
                    topic: String::new(),
                }));
                Ok(Vec::new())
            }
            (SubscribeOrigin::Resubscribe, Some(topic)) => {
                let fatal = SessionError::SubscribeRejected { topic };
                self.abort(&fatal);
                Err(fatal)
            }
            (SubscribeOrigin::Resubscribe, None) => {
                let mut topics = Vec::with_capacity(pending.filters.len());
                for ((topic, _), qos) in pending.filters.into_iter().zip(granted.into_iter().flatten()) {
                    self.active.insert(topic.clone(), qos);
                    topics.push((topic, qos));
                }
                if self.state == SessionState::Resubscribing {
                    self.state = SessionState::Connected;
                }
                Ok(vec![Effect::Notify(SessionNotification::Resubscribed {
                    topics,
                })])
            }
        }
    }

    fn on_publish_sent(&mut self, pkid: u16) {
        // Retransmissions after a reconnect reuse their packet id
        if pkid != 0 && self.inflight_publishes.contains_key(&pkid) {
            debug!(pkid, "publish retransmitted");
            return;
        }

        match self.unsent_publishes.pop_front() {
            Some(pending) if pending.qos == QoS::AtMostOnce => pending.resolve(Ok(())),
            Some(pending) => {
                self.inflight_publishes.insert(pkid, pending);
            }
            None => warn!(pkid, "publish sent with no tracked request"),
        }
    }

    fn fail_subscribes(&mut self, error: &SessionError) {
        let pending = self
            .unsent_subscribes
            .drain(..)
            .chain(self.inflight_subscribes.drain().map(|(_, p)| p));
        for subscribe in pending {
            if let SubscribeOrigin::Caller(waiter) = subscribe.origin {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    fn fail_all(&mut self, error: &SessionError) {
        self.fail_subscribes(error);
        let pending = self
            .unsent_publishes
            .drain(..)
            .chain(self.inflight_publishes.drain().map(|(_, p)| p));
        for publish in pending {
            publish.resolve(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "sensors/env";

    fn connected() -> SessionMachine {
        let mut machine = SessionMachine::new();
        machine.begin_connect().unwrap();
        machine
            .on_event(TransportEvent::ConnAck {
                session_present: false,
            })
            .unwrap();
        machine
    }

    fn subscribed() -> SessionMachine {
        let mut machine = connected();
        let (tx, mut rx) = oneshot::channel();
        machine.track_subscribe(vec![(TOPIC.to_string(), QoS::AtLeastOnce)], tx);
        machine.on_event(TransportEvent::SubscribeSent { pkid: 1 }).unwrap();
        machine
            .on_event(TransportEvent::SubAck {
                pkid: 1,
                granted: vec![Some(QoS::AtLeastOnce)],
            })
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), Ok(QoS::AtLeastOnce));
        machine
    }

    fn interrupt(machine: &mut SessionMachine) {
        let effects = machine
            .on_connection_error(&TransportError::Connection("reset by peer".into()))
            .unwrap();
        assert!(matches!(
            effects.as_slice(),
            [Effect::Notify(SessionNotification::Interrupted { .. })]
        ));
        assert_eq!(machine.state(), SessionState::Interrupted);
    }

    #[test]
    fn test_connect_notifies_session_flag() {
        let mut machine = SessionMachine::new();
        machine.begin_connect().unwrap();
        assert_eq!(machine.state(), SessionState::Connecting);

        let effects = machine
            .on_event(TransportEvent::ConnAck {
                session_present: true,
            })
            .unwrap();
        assert_eq!(
            effects,
            vec![Effect::Notify(SessionNotification::Connected {
                session_present: true
            })]
        );
        assert_eq!(machine.state(), SessionState::Connected);
    }

    #[test]
    fn test_connect_failure_is_fatal() {
        let mut machine = SessionMachine::new();
        machine.begin_connect().unwrap();

        let err = machine
            .on_connection_error(&TransportError::Refused("NotAuthorized".into()))
            .unwrap_err();
        assert!(matches!(err, SessionError::Connect(_)));
        assert_eq!(machine.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_connect_twice_rejected() {
        let mut machine = connected();
        assert!(machine.begin_connect().is_err());
    }

    #[test]
    fn test_interruption_keeps_subscriptions() {
        let mut machine = subscribed();
        interrupt(&mut machine);
        assert_eq!(
            machine.active_topics(),
            vec![(TOPIC.to_string(), QoS::AtLeastOnce)]
        );
    }

    #[test]
    fn test_resume_with_session_skips_resubscribe() {
        let mut machine = subscribed();
        interrupt(&mut machine);

        let effects = machine
            .on_event(TransportEvent::ConnAck {
                session_present: true,
            })
            .unwrap();
        assert_eq!(
            effects,
            vec![Effect::Notify(SessionNotification::Resumed {
                session_present: true
            })]
        );
        assert_eq!(machine.state(), SessionState::Connected);
    }

    #[test]
    fn test_resume_without_session_resubscribes() {
        let mut machine = subscribed();
        interrupt(&mut machine);

        let effects = machine
            .on_event(TransportEvent::ConnAck {
                session_present: false,
            })
            .unwrap();
        assert_eq!(machine.state(), SessionState::Resubscribing);
        let topics = vec![(TOPIC.to_string(), QoS::AtLeastOnce)];
        assert_eq!(effects[1], Effect::Resubscribe(topics.clone()));

        machine.track_resubscribe(topics.clone());
        machine.on_event(TransportEvent::SubscribeSent { pkid: 9 }).unwrap();
        let effects = machine
            .on_event(TransportEvent::SubAck {
                pkid: 9,
                granted: vec![Some(QoS::AtLeastOnce)],
            })
            .unwrap();
        assert_eq!(
            effects,
            vec![Effect::Notify(SessionNotification::Resubscribed { topics })]
        );
        assert_eq!(machine.state(), SessionState::Connected);
    }

    #[test]
    fn test_rejected_resubscribe_is_fatal() {
        let mut machine = subscribed();
        interrupt(&mut machine);
        machine
            .on_event(TransportEvent::ConnAck {
                session_present: false,
            })
            .unwrap();

        let (tx, mut rx) = oneshot::channel();
        machine.track_publish(QoS::AtLeastOnce, Some(tx));
        machine.track_resubscribe(machine.active_topics());
        machine.on_event(TransportEvent::SubscribeSent { pkid: 4 }).unwrap();

        let err = machine
            .on_event(TransportEvent::SubAck {
                pkid: 4,
                granted: vec![None],
            })
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::SubscribeRejected {
                topic: TOPIC.to_string()
            }
        );
        assert_eq!(machine.state(), SessionState::Disconnected);
        assert!(rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn test_missing_return_code_counts_as_rejection() {
        let mut machine = subscribed();
        interrupt(&mut machine);
        machine
            .on_event(TransportEvent::ConnAck {
                session_present: false,
            })
            .unwrap();
        machine.track_resubscribe(machine.active_topics());
        machine.on_event(TransportEvent::SubscribeSent { pkid: 2 }).unwrap();

        let result = machine.on_event(TransportEvent::SubAck {
            pkid: 2,
            granted: vec![],
        });
        assert!(matches!(result, Err(SessionError::SubscribeRejected { .. })));
    }

    #[test]
    fn test_rejected_initial_subscribe_fails_waiter() {
        let mut machine = connected();
        let (tx, mut rx) = oneshot::channel();
        machine.track_subscribe(vec![(TOPIC.to_string(), QoS::AtLeastOnce)], tx);
        machine.on_event(TransportEvent::SubscribeSent { pkid: 3 }).unwrap();
        machine
            .on_event(TransportEvent::SubAck {
                pkid: 3,
                granted: vec![None],
            })
            .unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(SessionError::SubscribeRejected { .. })
        ));
        assert!(machine.active_topics().is_empty());
        assert_eq!(machine.state(), SessionState::Connected);
    }

    #[test]
    fn test_pending_subscribe_fails_on_interruption() {
        let mut machine = connected();
        let (tx, mut rx) = oneshot::channel();
        machine.track_subscribe(vec![(TOPIC.to_string(), QoS::AtLeastOnce)], tx);
        interrupt(&mut machine);

        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(SessionError::Interrupted(_))
        ));
    }

    #[test]
    fn test_publish_ack_tracking() {
        let mut machine = connected();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        machine.track_publish(QoS::AtLeastOnce, Some(tx1));
        machine.track_publish(QoS::AtLeastOnce, Some(tx2));
        assert_eq!(machine.pending_publishes(), 2);

        machine.on_event(TransportEvent::PublishSent { pkid: 10 }).unwrap();
        machine.on_event(TransportEvent::PublishSent { pkid: 11 }).unwrap();
        machine.on_event(TransportEvent::PubAck { pkid: 11 }).unwrap();

        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), Ok(()));
        assert_eq!(machine.pending_publishes(), 1);

        // Retransmission after a reconnect keeps its packet id
        interrupt(&mut machine);
        machine
            .on_event(TransportEvent::ConnAck {
                session_present: true,
            })
            .unwrap();
        machine.on_event(TransportEvent::PublishSent { pkid: 10 }).unwrap();
        machine.on_event(TransportEvent::PubAck { pkid: 10 }).unwrap();
        assert_eq!(rx1.try_recv().unwrap(), Ok(()));
        assert_eq!(machine.pending_publishes(), 0);
    }

    #[test]
    fn test_qos0_publish_resolves_when_written() {
        let mut machine = connected();
        let (tx, mut rx) = oneshot::channel();
        machine.track_publish(QoS::AtMostOnce, Some(tx));
        machine.on_event(TransportEvent::PublishSent { pkid: 0 }).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(machine.pending_publishes(), 0);
    }

    #[test]
    fn test_disconnect_lifecycle() {
        let mut machine = subscribed();
        machine.begin_disconnect().unwrap();
        assert_eq!(machine.state(), SessionState::Disconnecting);
        assert!(!machine.accepts_requests());
        assert!(machine.begin_disconnect().is_err());

        let effects = machine.on_event(TransportEvent::DisconnectSent).unwrap();
        assert_eq!(
            effects,
            vec![
                Effect::Notify(SessionNotification::Closed),
                Effect::Closed
            ]
        );
        assert_eq!(machine.state(), SessionState::Disconnected);
        assert_eq!(machine.begin_disconnect(), Err(SessionError::Closed));
    }

    #[test]
    fn test_messages_are_delivered() {
        let mut machine = subscribed();
        let message = InboundMessage::new(TOPIC, &b"{}"[..], QoS::AtLeastOnce);
        let effects = machine
            .on_event(TransportEvent::Message(message.clone()))
            .unwrap();
        assert_eq!(effects, vec![Effect::Deliver(message)]);
    }
}
