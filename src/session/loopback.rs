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

//! In-process broker
//!
//! Publishes are echoed back to matching subscriptions of the same client,
//! which is enough to run the whole pipeline offline. A [`LoopbackControl`]
//! injects faults: dropped connections, refused subscriptions and foreign
//! messages. Unacknowledged QoS 1 publishes are redelivered after a
//! reconnect, as a real broker would.

use std::collections::{BTreeMap, HashSet, VecDeque};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use super::topic;
use super::transport::{InboundMessage, QoS, Transport, TransportEvent};
use crate::error::TransportError;

#[derive(Debug, Clone, Default)]
pub struct LoopbackOptions {
    /// Keep subscriptions across reconnects (the broker's session flag)
    pub persist_session: bool,
    /// Refuse every connect attempt
    pub refuse_connect: bool,
}

#[derive(Debug)]
enum Fault {
    Interrupt(String),
    RejectTopic(String),
    Inject(InboundMessage),
}

/// Fault injection for a [`LoopbackTransport`]
#[derive(Clone)]
pub struct LoopbackControl {
    faults: mpsc::UnboundedSender<Fault>,
}

impl LoopbackControl {
    /// Drop the connection; the next poll reconnects
    pub fn interrupt(&self, cause: &str) {
        let _ = self.faults.send(Fault::Interrupt(cause.to_string()));
    }

    /// Refuse any later subscribe to `filter`
    pub fn reject_topic(&self, filter: &str) {
        let _ = self.faults.send(Fault::RejectTopic(filter.to_string()));
    }

    /// Deliver a message as if another client had published it
    pub fn inject(&self, message: InboundMessage) {
        let _ = self.faults.send(Fault::Inject(message));
    }
}

enum Request {
    Subscribe(Vec<(String, QoS)>),
    Publish {
        topic: String,
        qos: QoS,
        payload: Bytes,
    },
    Disconnect,
}

pub struct LoopbackTransport {
    options: LoopbackOptions,
    faults: mpsc::UnboundedReceiver<Fault>,
    connected: bool,
    connected_once: bool,
    closed: bool,
    /// Events produced by the broker, handed out one per poll
    pending: VecDeque<TransportEvent>,
    /// Requests made while the connection was down
    outbox: VecDeque<Request>,
    subscriptions: BTreeMap<String, QoS>,
    rejected: HashSet<String>,
    /// QoS 1+ publishes whose ack has not reached the client
    unacked: BTreeMap<u16, (String, QoS, Bytes)>,
    next_pkid: u16,
}

impl LoopbackTransport {
    pub fn new(options: LoopbackOptions) -> (Self, LoopbackControl) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            options,
            faults: rx,
            connected: false,
            connected_once: false,
            closed: false,
            pending: VecDeque::new(),
            outbox: VecDeque::new(),
            subscriptions: BTreeMap::new(),
            rejected: HashSet::new(),
            unacked: BTreeMap::new(),
            next_pkid: 1,
        };
        (transport, LoopbackControl { faults: tx })
    }

    fn pkid(&mut self) -> u16 {
        let pkid = self.next_pkid;
        self.next_pkid = self.next_pkid.checked_add(1).unwrap_or(1);
        pkid
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.options.refuse_connect {
            return Err(TransportError::Refused("NotAuthorized".to_string()));
        }

        let session_present = self.options.persist_session && self.connected_once;
        if !session_present {
            self.subscriptions.clear();
        }
        self.connected = true;
        self.connected_once = true;
        self.pending
            .push_back(TransportEvent::ConnAck { session_present });

        let retransmits: Vec<_> = self
            .unacked
            .iter()
            .map(|(pkid, (topic, qos, payload))| (*pkid, topic.clone(), *qos, payload.clone()))
            .collect();
        for (pkid, topic, qos, payload) in retransmits {
            debug!(pkid, "loopback retransmitting publish");
            self.pending.push_back(TransportEvent::PublishSent { pkid });
            self.echo(&topic, qos, payload, true);
            self.pending.push_back(TransportEvent::PubAck { pkid });
        }

        while let Some(request) = self.outbox.pop_front() {
            self.handle(request);
        }
        Ok(())
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Subscribe(filters) => {
                let pkid = self.pkid();
                self.pending
                    .push_back(TransportEvent::SubscribeSent { pkid });
                let granted = filters
                    .into_iter()
                    .map(|(filter, qos)| {
                        if self.rejected.contains(&filter) {
                            None
                        } else {
                            self.subscriptions.insert(filter, qos);
                            Some(qos)
                        }
                    })
                    .collect();
                self.pending
                    .push_back(TransportEvent::SubAck { pkid, granted });
            }
            Request::Publish {
                topic,
                qos,
                payload,
            } => {
                let pkid = match qos {
                    QoS::AtMostOnce => 0,
                    _ => self.pkid(),
                };
                self.pending.push_back(TransportEvent::PublishSent { pkid });
                self.echo(&topic, qos, payload.clone(), false);
                if qos != QoS::AtMostOnce {
                    self.unacked.insert(pkid, (topic, qos, payload));
                    self.pending.push_back(TransportEvent::PubAck { pkid });
                }
            }
            Request::Disconnect => {
                self.pending.push_back(TransportEvent::DisconnectSent);
                self.closed = true;
            }
        }
    }

    fn echo(&mut self, topic_name: &str, qos: QoS, payload: Bytes, dup: bool) {
        let granted = self
            .subscriptions
            .iter()
            .filter(|(filter, _)| topic::matches(filter, topic_name))
            .map(|(_, granted)| *granted)
            .max();
        if let Some(granted) = granted {
            let mut message = InboundMessage::new(topic_name, payload, qos.min(granted));
            message.dup = dup;
            self.pending.push_back(TransportEvent::Message(message));
        }
    }

    fn request(&mut self, request: Request) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Request("client is disconnecting".to_string()));
        }
        if self.connected {
            self.handle(request);
        } else {
            self.outbox.push_back(request);
        }
        Ok(())
    }

    fn apply(&mut self, fault: Fault) -> Result<(), TransportError> {
        match fault {
            Fault::Interrupt(cause) => {
                if self.connected {
                    debug!("loopback connection dropped: {}", cause);
                    self.connected = false;
                    self.pending.clear();
                    return Err(TransportError::Connection(cause));
                }
            }
            Fault::RejectTopic(filter) => {
                self.rejected.insert(filter);
            }
            Fault::Inject(message) => {
                if self
                    .subscriptions
                    .keys()
                    .any(|filter| topic::matches(filter, &message.topic))
                {
                    self.pending.push_back(TransportEvent::Message(message));
                } else {
                    debug!(topic = %message.topic, "loopback dropped message with no subscriber");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn poll(&mut self) -> Result<TransportEvent, TransportError> {
        loop {
            // Faults already queued take effect before buffered events
            while let Ok(fault) = self.faults.try_recv() {
                self.apply(fault)?;
            }

            // A disconnect queued while offline still needs a connection
            if !self.connected && (!self.closed || !self.outbox.is_empty()) {
                self.connect()?;
            }

            if let Some(event) = self.pending.pop_front() {
                if let TransportEvent::PubAck { pkid } = &event {
                    self.unacked.remove(pkid);
                }
                return Ok(event);
            }

            match self.faults.recv().await {
                Some(fault) => self.apply(fault)?,
                None => std::future::pending::<()>().await,
            }
        }
    }

    fn subscribe(&mut self, filters: &[(String, QoS)]) -> Result<(), TransportError> {
        self.request(Request::Subscribe(filters.to_vec()))
    }

    fn publish(&mut self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), TransportError> {
        self.request(Request::Publish {
            topic: topic.to_string(),
            qos,
            payload,
        })
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.request(Request::Disconnect)?;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "sensors/env";

    #[tokio::test]
    async fn test_publish_is_echoed_to_subscriber() {
        let (mut transport, _control) = LoopbackTransport::new(LoopbackOptions::default());
        assert_eq!(
            transport.poll().await.unwrap(),
            TransportEvent::ConnAck {
                session_present: false
            }
        );

        transport
            .subscribe(&[(TOPIC.to_string(), QoS::AtLeastOnce)])
            .unwrap();
        assert_eq!(
            transport.poll().await.unwrap(),
            TransportEvent::SubscribeSent { pkid: 1 }
        );
        assert_eq!(
            transport.poll().await.unwrap(),
            TransportEvent::SubAck {
                pkid: 1,
                granted: vec![Some(QoS::AtLeastOnce)]
            }
        );

        transport
            .publish(TOPIC, QoS::AtLeastOnce, Bytes::from_static(b"{}"))
            .unwrap();
        assert_eq!(
            transport.poll().await.unwrap(),
            TransportEvent::PublishSent { pkid: 2 }
        );
        assert!(matches!(
            transport.poll().await.unwrap(),
            TransportEvent::Message(m) if m.topic == TOPIC && !m.dup
        ));
        assert_eq!(
            transport.poll().await.unwrap(),
            TransportEvent::PubAck { pkid: 2 }
        );
    }

    #[tokio::test]
    async fn test_refused_connect() {
        let (mut transport, _control) = LoopbackTransport::new(LoopbackOptions {
            refuse_connect: true,
            ..Default::default()
        });
        assert!(matches!(
            transport.poll().await,
            Err(TransportError::Refused(_))
        ));
    }

    #[tokio::test]
    async fn test_session_flag_follows_persistence() {
        let (mut transport, control) = LoopbackTransport::new(LoopbackOptions {
            persist_session: true,
            ..Default::default()
        });
        transport.poll().await.unwrap();

        control.interrupt("test");
        assert!(matches!(
            transport.poll().await,
            Err(TransportError::Connection(_))
        ));
        assert_eq!(
            transport.poll().await.unwrap(),
            TransportEvent::ConnAck {
                session_present: true
            }
        );
    }

    #[tokio::test]
    async fn test_unacked_publish_redelivered_after_interrupt() {
        let (mut transport, control) = LoopbackTransport::new(LoopbackOptions {
            persist_session: true,
            ..Default::default()
        });
        transport.poll().await.unwrap();
        transport
            .subscribe(&[(TOPIC.to_string(), QoS::AtLeastOnce)])
            .unwrap();
        transport.poll().await.unwrap();
        transport.poll().await.unwrap();

        transport
            .publish(TOPIC, QoS::AtLeastOnce, Bytes::from_static(b"{}"))
            .unwrap();
        assert_eq!(
            transport.poll().await.unwrap(),
            TransportEvent::PublishSent { pkid: 2 }
        );

        control.interrupt("test");
        assert!(transport.poll().await.is_err());

        assert!(matches!(
            transport.poll().await.unwrap(),
            TransportEvent::ConnAck { .. }
        ));
        assert_eq!(
            transport.poll().await.unwrap(),
            TransportEvent::PublishSent { pkid: 2 }
        );
        assert!(matches!(
            transport.poll().await.unwrap(),
            TransportEvent::Message(m) if m.dup
        ));
        assert_eq!(
            transport.poll().await.unwrap(),
            TransportEvent::PubAck { pkid: 2 }
        );
    }

    #[tokio::test]
    async fn test_rejected_topic_gets_failure_code() {
        let (mut transport, control) = LoopbackTransport::new(LoopbackOptions::default());
        control.reject_topic(TOPIC);
        transport.poll().await.unwrap();

        transport
            .subscribe(&[(TOPIC.to_string(), QoS::AtLeastOnce)])
            .unwrap();
        transport.poll().await.unwrap();
        assert_eq!(
            transport.poll().await.unwrap(),
            TransportEvent::SubAck {
                pkid: 1,
                granted: vec![None]
            }
        );
    }

    #[tokio::test]
    async fn test_requests_rejected_after_disconnect() {
        let (mut transport, _control) = LoopbackTransport::new(LoopbackOptions::default());
        transport.poll().await.unwrap();
        transport.disconnect().unwrap();
        assert_eq!(
            transport.poll().await.unwrap(),
            TransportEvent::DisconnectSent
        );
        assert!(transport
            .publish(TOPIC, QoS::AtLeastOnce, Bytes::new())
            .is_err());
    }
}
