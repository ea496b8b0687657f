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

// Transport trait: the wire underneath the session state machine

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Delivery guarantee negotiated for publish/subscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// Set by the broker on redelivery
    pub dup: bool,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            dup: false,
            retain: false,
        }
    }
}

/// Events a transport reports while it is being polled
///
/// Packet ids of outgoing requests are reported in the order the requests
/// were handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The broker accepted the connection
    ConnAck { session_present: bool },
    /// A subscribe request went out with this packet id
    SubscribeSent { pkid: u16 },
    /// Granted QoS per requested filter, `None` where the broker refused
    SubAck { pkid: u16, granted: Vec<Option<QoS>> },
    /// A publish went out with this packet id (0 for QoS 0)
    PublishSent { pkid: u16 },
    PubAck { pkid: u16 },
    Message(InboundMessage),
    DisconnectSent,
}

/// A connection to a broker
///
/// `poll` drives the connection (including automatic reconnects after an
/// error) and must be cancel safe. The request methods only enqueue and
/// never block.
#[async_trait]
pub trait Transport: Send {
    async fn poll(&mut self) -> Result<TransportEvent, TransportError>;

    fn subscribe(&mut self, filters: &[(String, QoS)]) -> Result<(), TransportError>;

    fn publish(&mut self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), TransportError>;

    fn disconnect(&mut self) -> Result<(), TransportError>;
}
