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

// Environmental telemetry ingest
//
// This is a reliable delivery and persistence pipeline that:
// - Publishes synthetic sensor readings over an MQTT session at QoS 1
// - Survives connection loss, resubscribing when the broker dropped the session
// - Persists every received reading with a fresh id and receive timestamp
// - Answers "latest" and "last N seconds" queries over the stored records

pub mod codec;
pub mod config;
pub mod error;
pub mod generator;
pub mod pipeline;
pub mod protocol;
pub mod publisher;
pub mod query;
pub mod receiver;
pub mod session;
pub mod storage;

// Re-export main types
pub use config::{load_config, load_config_with_env, IngestConfig};
pub use error::{CodecError, QueryError, SessionError, StorageError, TransportError};
pub use generator::{RandomReadingSource, ReadingSource};
pub use protocol::{DecodedRecord, QueryResponse, SensorReading, StoredRecord};
pub use publisher::PublishLoop;
pub use query::{QueryInterface, QueryService};
pub use receiver::{ReceiveHandler, ReceiveStats};
pub use session::{
    InboundMessage, LoopbackControl, LoopbackOptions, LoopbackTransport, MessageHandler,
    MqttTransport, QoS, Session, SessionEvents, SessionHandle, SessionNotification,
    SessionOptions, SessionState, Transport,
};
pub use storage::{BackendFactory, RecordStore};
