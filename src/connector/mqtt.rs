//! MQTT target adapter
//!
//! Holds a persistent broker session driven by a background event-loop
//! task. Connection establishment is asynchronous: `connect` waits on a
//! readiness signal flipped by the broker's ConnAck, bounded by a 10 s
//! deadline. Publishes at QoS 1/2 are only successful once the broker's
//! PubAck/PubComp comes back through the event loop, under the same
//! deadline; QoS 0 has no acknowledgement, so a queued write is the
//! contract. A failed or unacknowledged publish marks the session stale so
//! the next send reconnects.

use crate::error::{Error, Result};
use crate::model::JsonMap;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS, Transport,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{with_timestamp, TargetConnector};

/// Broker-level connect (ConnAck) and publish acknowledgement deadline
const MQTT_DEADLINE: Duration = Duration::from_secs(10);

/// MQTT target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttTargetConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    /// Quality of Service level (0..=2)
    #[serde(default)]
    pub qos: u8,
}

fn default_port() -> u16 {
    1883
}

impl MqttTargetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::invalid_config("host", "host cannot be empty"));
        }
        if self.port == 0 {
            return Err(Error::invalid_config("port", "port must be between 1 and 65535"));
        }
        if self.topic.is_empty() {
            return Err(Error::invalid_config("topic", "topic cannot be empty"));
        }
        if self.qos > 2 {
            return Err(Error::invalid_config("qos", "QoS must be 0, 1 or 2"));
        }
        Ok(())
    }

    fn qos_level(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }
}

/// The one in-flight publish awaiting its broker acknowledgement.
///
/// `publish()` hands the message to the client before the packet id is
/// assigned; the driver binds the id when it sees the outgoing packet, then
/// completes the waiter on the matching PubAck (QoS 1) or PubComp (QoS 2).
/// Sends from a simulator are serialized, so one slot is enough.
type PendingAck = (Option<u16>, oneshot::Sender<()>);

/// Bind the packet id the event loop assigned to the in-flight publish
fn bind_publish_pkid(pending: &Mutex<Option<PendingAck>>, pkid: u16) {
    if let Some((slot, _)) = pending.lock().unwrap().as_mut() {
        if slot.is_none() {
            *slot = Some(pkid);
        }
    }
}

/// Complete the waiter iff the acknowledged packet id matches
fn complete_publish_ack(pending: &Mutex<Option<PendingAck>>, pkid: u16) {
    let mut guard = pending.lock().unwrap();
    let matches = guard
        .as_ref()
        .map(|(slot, _)| *slot == Some(pkid))
        .unwrap_or(false);
    if matches {
        if let Some((_, tx)) = guard.take() {
            let _ = tx.send(());
        }
    }
}

/// Drop the waiter so the sender side observes a dead session
fn fail_pending_publish(pending: &Mutex<Option<PendingAck>>) {
    pending.lock().unwrap().take();
}

/// Connector for MQTT brokers
pub struct MqttConnector {
    config: MqttTargetConfig,
    client: Option<AsyncClient>,
    connected: Arc<AtomicBool>,
    pending_ack: Arc<Mutex<Option<PendingAck>>>,
    driver_token: Option<CancellationToken>,
}

impl MqttConnector {
    pub fn new(config: MqttTargetConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            pending_ack: Arc::new(Mutex::new(None)),
            driver_token: None,
        })
    }

    fn teardown_driver(&mut self) {
        if let Some(token) = self.driver_token.take() {
            token.cancel();
        }
        self.client = None;
        self.connected.store(false, Ordering::SeqCst);
        fail_pending_publish(&self.pending_ack);
    }
}

#[async_trait]
impl TargetConnector for MqttConnector {
    fn kind(&self) -> &'static str {
        "mqtt"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) && self.client.is_some() {
            return Ok(());
        }

        // Drop any half-dead session before dialing again
        self.teardown_driver();

        let client_id = format!("fleetsim-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let mut options = MqttOptions::new(client_id, self.config.host.clone(), self.config.port);
        options.set_keep_alive(Duration::from_secs(30));

        if let Some(username) = &self.config.username {
            options.set_credentials(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }

        if self.config.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let (ready_tx, mut ready_rx) = watch::channel(false);
        let connected = self.connected.clone();
        let pending_ack = self.pending_ack.clone();
        let token = CancellationToken::new();
        let driver_token = token.clone();
        let host = self.config.host.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = driver_token.cancelled() => break,
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                            let ok = ack.code == ConnectReturnCode::Success;
                            connected.store(ok, Ordering::SeqCst);
                            let _ = ready_tx.send(ok);
                            if !ok {
                                warn!("MQTT broker {} rejected connection: {:?}", host, ack.code);
                            }
                        }
                        Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                            bind_publish_pkid(&pending_ack, pkid);
                        }
                        Ok(Event::Incoming(Packet::PubAck(ack))) => {
                            complete_publish_ack(&pending_ack, ack.pkid);
                        }
                        Ok(Event::Incoming(Packet::PubComp(comp))) => {
                            complete_publish_ack(&pending_ack, comp.pkid);
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            connected.store(false, Ordering::SeqCst);
                            fail_pending_publish(&pending_ack);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!("MQTT event loop error for {}: {}", host, e);
                            connected.store(false, Ordering::SeqCst);
                            let _ = ready_tx.send(false);
                            fail_pending_publish(&pending_ack);
                            // Back off before librdkafka-style tight reconnect spins
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });

        self.client = Some(client);
        self.driver_token = Some(token);

        // Wait for the ConnAck readiness signal with a bounded deadline
        let wait = async {
            loop {
                if *ready_rx.borrow() {
                    return true;
                }
                if ready_rx.changed().await.is_err() {
                    return false;
                }
            }
        };

        match tokio::time::timeout(MQTT_DEADLINE, wait).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.teardown_driver();
                Err(Error::connection(format!(
                    "MQTT broker {}:{} refused the session",
                    self.config.host, self.config.port
                )))
            }
            Err(_) => {
                self.teardown_driver();
                Err(Error::Timeout {
                    timeout_ms: MQTT_DEADLINE.as_millis() as u64,
                })
            }
        }
    }

    async fn send(&mut self, payload: &JsonMap) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::connection("MQTT session is not connected"));
        }
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::connection("MQTT session is not connected"))?;

        let stamped = with_timestamp(payload);
        let bytes = serde_json::to_vec(&stamped)?;
        let qos = self.config.qos_level();

        // Register the ack slot before publishing so the driver can bind
        // the packet id the moment the publish goes out
        let ack_rx = if self.config.qos > 0 {
            let (tx, rx) = oneshot::channel();
            *self.pending_ack.lock().unwrap() = Some((None, tx));
            Some(rx)
        } else {
            None
        };

        if let Err(e) = client
            .publish(self.config.topic.as_str(), qos, false, bytes)
            .await
        {
            fail_pending_publish(&self.pending_ack);
            // Mark stale so the next send dials a fresh session
            self.connected.store(false, Ordering::SeqCst);
            return Err(Error::send_with_source("MQTT publish failed", e));
        }

        // QoS 0 has no broker acknowledgement: the queued write is final
        let Some(ack_rx) = ack_rx else {
            return Ok(());
        };

        match tokio::time::timeout(MQTT_DEADLINE, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(Error::send(
                    "MQTT session closed before the broker acknowledged the publish",
                ))
            }
            Err(_) => {
                fail_pending_publish(&self.pending_ack);
                self.connected.store(false, Ordering::SeqCst);
                Err(Error::send(format!(
                    "MQTT publish not acknowledged within {:?}",
                    MQTT_DEADLINE
                )))
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(client) = &self.client {
            let _ = client.disconnect().await;
        }
        self.teardown_driver();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
