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

// MQTT transport over mutual TLS, backed by rumqttc

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, Proxy,
    ProxyAuth, ProxyType, SubscribeFilter, SubscribeReasonCode, TlsConfiguration,
};
use std::path::Path;
use tracing::{debug, info};

use super::transport::{InboundMessage, QoS, Transport, TransportEvent};
use crate::config::MqttConfig;
use crate::error::{SessionError, TransportError};

/// ALPN protocol that lets mutual-TLS MQTT share port 443
const ALPN_MQTT_443: &str = "x-amzn-mqtt-ca";

pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttTransport {
    /// Build the client from configuration
    ///
    /// Certificate material is read here; a missing or unreadable file is a
    /// connect failure. No network traffic happens until the first poll.
    pub fn new(config: &MqttConfig) -> Result<Self, SessionError> {
        let ca = read_pem("ca", config.ca.as_deref())?;
        let cert = read_pem("cert", config.cert.as_deref())?;
        let key = read_pem("key", config.key.as_deref())?;

        let mut options = MqttOptions::new(&config.client_id, &config.endpoint, config.port);
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(config.clean_session);

        let alpn = (config.port == 443).then(|| vec![ALPN_MQTT_443.as_bytes().to_vec()]);
        options.set_transport(rumqttc::Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn,
            client_auth: Some((cert, key)),
        }));

        if let Some(proxy) = &config.proxy {
            info!("Using HTTP proxy {}:{}", proxy.host, proxy.port);
            options.set_proxy(Proxy {
                ty: ProxyType::Http,
                auth: ProxyAuth::None,
                addr: proxy.host.clone(),
                port: proxy.port,
            });
        }

        info!(
            "MQTT transport for '{}' at {}:{}",
            config.client_id, config.endpoint, config.port
        );

        let (client, eventloop) = AsyncClient::new(options, config.request_capacity);
        Ok(Self { client, eventloop })
    }
}

fn read_pem(name: &str, path: Option<&Path>) -> Result<Vec<u8>, SessionError> {
    let path = path.ok_or_else(|| SessionError::Connect(format!("mqtt.{} is not set", name)))?;
    std::fs::read(path).map_err(|e| {
        SessionError::Connect(format!("failed to read {} '{}': {}", name, path.display(), e))
    })
}

#[async_trait]
impl Transport for MqttTransport {
    async fn poll(&mut self) -> Result<TransportEvent, TransportError> {
        loop {
            let event = self.eventloop.poll().await.map_err(map_connection_error)?;
            if let Some(event) = map_event(event) {
                return Ok(event);
            }
        }
    }

    fn subscribe(&mut self, filters: &[(String, QoS)]) -> Result<(), TransportError> {
        let filters = filters
            .iter()
            .map(|(path, qos)| SubscribeFilter::new(path.clone(), (*qos).into()));
        self.client
            .try_subscribe_many(filters)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn publish(&mut self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, qos.into(), false, payload.to_vec())
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.client
            .try_disconnect()
            .map_err(|e| TransportError::Request(e.to_string()))
    }
}

/// Translate rumqttc events; `None` for traffic the session does not track
fn map_event(event: Event) -> Option<TransportEvent> {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => Some(TransportEvent::ConnAck {
            session_present: ack.session_present,
        }),
        Event::Incoming(Packet::SubAck(ack)) => Some(TransportEvent::SubAck {
            pkid: ack.pkid,
            granted: ack
                .return_codes
                .into_iter()
                .map(|code| match code {
                    SubscribeReasonCode::Success(qos) => Some(qos.into()),
                    SubscribeReasonCode::Failure => None,
                })
                .collect(),
        }),
        Event::Incoming(Packet::PubAck(ack)) => Some(TransportEvent::PubAck { pkid: ack.pkid }),
        Event::Incoming(Packet::PubComp(comp)) => Some(TransportEvent::PubAck { pkid: comp.pkid }),
        Event::Incoming(Packet::Publish(publish)) => {
            Some(TransportEvent::Message(InboundMessage {
                topic: publish.topic,
                payload: publish.payload,
                qos: publish.qos.into(),
                dup: publish.dup,
                retain: publish.retain,
            }))
        }
        Event::Outgoing(Outgoing::Subscribe(pkid)) => Some(TransportEvent::SubscribeSent { pkid }),
        Event::Outgoing(Outgoing::Publish(pkid)) => Some(TransportEvent::PublishSent { pkid }),
        Event::Outgoing(Outgoing::Disconnect) => Some(TransportEvent::DisconnectSent),
        other => {
            debug!(?other, "mqtt event");
            None
        }
    }
}

fn map_connection_error(error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::ConnectionRefused(code) => TransportError::Refused(format!("{:?}", code)),
        other => TransportError::Connection(other.to_string()),
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for QoS {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, PubAck, Publish, SubAck};

    #[test]
    fn test_connack_maps_session_flag() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            true,
        )));
        assert_eq!(
            map_event(event),
            Some(TransportEvent::ConnAck {
                session_present: true
            })
        );
    }

    #[test]
    fn test_suback_failure_maps_to_none() {
        let event = Event::Incoming(Packet::SubAck(SubAck::new(
            7,
            vec![
                SubscribeReasonCode::Success(rumqttc::QoS::AtLeastOnce),
                SubscribeReasonCode::Failure,
            ],
        )));
        assert_eq!(
            map_event(event),
            Some(TransportEvent::SubAck {
                pkid: 7,
                granted: vec![Some(QoS::AtLeastOnce), None],
            })
        );
    }

    #[test]
    fn test_publish_maps_to_message() {
        let event = Event::Incoming(Packet::Publish(Publish::new(
            "sensors/env",
            rumqttc::QoS::AtLeastOnce,
            b"{}".to_vec(),
        )));
        match map_event(event) {
            Some(TransportEvent::Message(message)) => {
                assert_eq!(message.topic, "sensors/env");
                assert_eq!(message.qos, QoS::AtLeastOnce);
                assert_eq!(&message.payload[..], b"{}");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_outgoing_and_acks() {
        assert_eq!(
            map_event(Event::Outgoing(Outgoing::Publish(3))),
            Some(TransportEvent::PublishSent { pkid: 3 })
        );
        assert_eq!(
            map_event(Event::Incoming(Packet::PubAck(PubAck::new(3)))),
            Some(TransportEvent::PubAck { pkid: 3 })
        );
        assert_eq!(
            map_event(Event::Outgoing(Outgoing::Disconnect)),
            Some(TransportEvent::DisconnectSent)
        );
        assert_eq!(map_event(Event::Incoming(Packet::PingResp)), None);
    }

    #[test]
    fn test_refused_connection_maps_to_refused() {
        let error = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert!(matches!(
            map_connection_error(error),
            TransportError::Refused(_)
        ));
    }

    #[test]
    fn test_missing_certificate_is_connect_error() {
        let config = MqttConfig {
            endpoint: "broker.example.com".to_string(),
            cert: Some("/nonexistent/cert.pem".into()),
            key: Some("/nonexistent/key.pem".into()),
            ca: Some("/nonexistent/ca.pem".into()),
            ..MqttConfig::default()
        };
        assert!(matches!(
            MqttTransport::new(&config),
            Err(SessionError::Connect(_))
        ));
    }
}
