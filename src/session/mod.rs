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

// Messaging session
//
// Provides:
// - Sans-I/O session state machine (connect, interrupt, resume, resubscribe, disconnect)
// - Driver task with request/acknowledgment handles
// - MQTT (rumqttc) and in-process loopback transports

mod driver;
mod loopback;
mod mqtt;
pub mod state;
pub mod topic;
mod transport;

pub use driver::{
    MessageHandler, PublishAck, Session, SessionEvents, SessionHandle, SessionOptions,
};
pub use loopback::{LoopbackControl, LoopbackOptions, LoopbackTransport};
pub use mqtt::MqttTransport;
pub use state::{SessionMachine, SessionNotification, SessionState};
pub use transport::{InboundMessage, QoS, Transport, TransportEvent};
