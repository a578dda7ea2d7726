//! Message Publishers

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MqttConfig;
use crate::BridgeError;

/// Destination for decoded samples and stats
///
/// `publish` is called from plain threads and must not block.
pub trait Publisher: Send + Sync {
    fn name(&self) -> &'static str;

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BridgeError>;
}

/// MQTT publisher (QoS 0, not retained)
pub struct MqttPublisher {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    client_id: String,
}

impl MqttPublisher {
    /// Create the client and spawn its event loop
    ///
    /// Must be called inside a tokio runtime. The connection is made in the
    /// background; until the broker acknowledges it, `publish` fails with
    /// [`BridgeError::NotConnected`].
    pub fn connect(config: &MqttConfig) -> Result<Self, BridgeError> {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("rt-bridge-{}", Uuid::new_v4().simple()));

        let mut options = MqttOptions::new(client_id.clone(), &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

        let (client, mut eventloop) = AsyncClient::new(options, config.queue_capacity.max(1));
        let connected = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&connected);
        let broker = format!("{}:{}", config.broker, config.port);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        info!("Connected to MQTT broker {} ({:?})", broker, ack.code);
                        flag.store(true, Ordering::Release);
                    }
                    Ok(Event::Incoming(incoming)) => {
                        debug!("MQTT incoming: {:?}", incoming);
                    }
                    Err(e) => {
                        if flag.swap(false, Ordering::AcqRel) {
                            warn!("Lost connection to MQTT broker {}", broker);
                        }
                        error!("MQTT error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    _ => {}
                }
            }
        });

        info!("MQTT client {} connecting to {}:{}", client_id, config.broker, config.port);
        Ok(Self {
            client,
            connected,
            client_id,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Ask the event loop to send DISCONNECT
    pub fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect: {}", e);
        }
        self.connected.store(false, Ordering::Release);
    }
}

impl Publisher for MqttPublisher {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| BridgeError::Publish(e.to_string()))
    }
}

/// Publisher that only logs, for dry runs
#[derive(Debug, Default)]
pub struct LogPublisher {
    messages: AtomicU64,
    bytes: AtomicU64,
}

impl LogPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl Publisher for LogPublisher {
    fn name(&self) -> &'static str {
        "log"
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BridgeError> {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
        debug!("{} <- {} bytes", topic, payload.len());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Keeps every published message in memory
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        messages: Mutex<Vec<(String, Vec<u8>)>>,
        pub(crate) fail: AtomicBool,
    }

    impl RecordingPublisher {
        pub(crate) fn messages(&self) -> Vec<(String, Vec<u8>)> {
            self.messages.lock().unwrap().clone()
        }

        pub(crate) fn topics(&self) -> Vec<String> {
            self.messages().into_iter().map(|(topic, _)| topic).collect()
        }
    }

    impl Publisher for RecordingPublisher {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BridgeError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(BridgeError::NotConnected);
            }
            self.messages
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_publisher_counts() {
        let publisher = LogPublisher::new();
        publisher.publish("plc/a", &[1, 2, 3]).unwrap();
        publisher.publish("plc/b", &[4]).unwrap();
        assert_eq!(publisher.messages(), 2);
        assert_eq!(publisher.bytes(), 4);
    }

    #[tokio::test]
    async fn test_mqtt_without_broker_is_not_connected() {
        let config = MqttConfig {
            broker: "127.0.0.1".to_string(),
            port: 1,
            client_id: Some("rt-bridge-test".to_string()),
            ..MqttConfig::default()
        };

        let publisher = MqttPublisher::connect(&config).unwrap();
        assert_eq!(publisher.client_id(), "rt-bridge-test");
        assert!(!publisher.is_connected());
        assert!(matches!(
            publisher.publish("plc/x", b"1"),
            Err(BridgeError::NotConnected)
        ));
        publisher.disconnect();
    }

    #[tokio::test]
    async fn test_generated_client_id() {
        let publisher = MqttPublisher::connect(&MqttConfig::default()).unwrap();
        assert!(publisher.client_id().starts_with("rt-bridge-"));
    }
}
