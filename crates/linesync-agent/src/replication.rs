//! Delta dissemination between replicas.
//!
//! Every local commit is exported relative to the last broadcast and sent as
//! one [`SyncMessage`]. Delivery is at-most-once and unordered; a replica that
//! missed messages repairs itself with an anti-entropy request.

use linesync_core::{ChangeEvent, DocError, Document, ImportStatus, VersionVector};
use linesync_proto::{
    AntiEntropyRequest, AntiEntropyResponse, MessageError, SyncMessage, TopicScheme,
};
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use url::Url;
use uuid::Uuid;

/// A fire-and-forget byte-message channel.
pub trait Transport {
    /// Send one frame to every other participant.
    ///
    /// # Errors
    ///
    /// Returns error if the frame could not be handed to the channel.
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
struct BusFrame {
    sender: u64,
    bytes: Arc<[u8]>,
}

/// Named in-process message bus.
///
/// Endpoints never see their own frames. Slow endpoints lose the frames
/// they lagged behind on.
#[derive(Debug, Clone)]
pub struct LocalBus {
    name: Arc<str>,
    tx: broadcast::Sender<BusFrame>,
    next_endpoint: Arc<AtomicU64>,
}

impl LocalBus {
    /// Create a bus buffering up to `capacity` frames per endpoint.
    #[must_use]
    pub fn new(name: &str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            name: Arc::from(name),
            tx,
            next_endpoint: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Attach a new endpoint; it receives frames sent from now on.
    #[must_use]
    pub fn endpoint(&self) -> BusEndpoint {
        let id = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        BusEndpoint {
            sender: BusSender {
                id,
                name: Arc::clone(&self.name),
                tx: self.tx.clone(),
            },
            rx: self.tx.subscribe(),
        }
    }
}

/// Sending half of a bus endpoint.
#[derive(Debug, Clone)]
pub struct BusSender {
    id: u64,
    name: Arc<str>,
    tx: broadcast::Sender<BusFrame>,
}

impl Transport for BusSender {
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let len = frame.len();
        let frame = BusFrame {
            sender: self.id,
            bytes: Arc::from(frame),
        };
        // No receivers means nobody is listening; the frame is simply lost.
        let receivers = self.tx.send(frame).unwrap_or(0);
        tracing::trace!(bus = %self.name, len, receivers, "Sent bus frame");
        Ok(())
    }
}

/// One participant of a [`LocalBus`].
#[derive(Debug)]
pub struct BusEndpoint {
    sender: BusSender,
    rx: broadcast::Receiver<BusFrame>,
}

impl BusEndpoint {
    /// A sender for this endpoint, to hand to a [`SyncChannel`].
    #[must_use]
    pub fn sender(&self) -> BusSender {
        self.sender.clone()
    }

    /// Next frame from another endpoint, if one is already queued.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.rx.try_recv() {
                Ok(frame) if frame.sender == self.sender.id => {}
                Ok(frame) => return Some(frame.bytes.to_vec()),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(bus = %self.sender.name, skipped, "Bus endpoint lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Wait for the next frame from another endpoint.
    ///
    /// Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.rx.recv().await {
                Ok(frame) if frame.sender == self.sender.id => {}
                Ok(frame) => return Some(frame.bytes.to_vec()),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(bus = %self.sender.name, skipped, "Bus endpoint lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// MQTT-backed transport publishing on the channel's sync topic.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    topics: TopicScheme,
}

impl MqttTransport {
    /// Create a client for `broker`; the returned event loop must be polled.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn connect(
        broker: &str,
        client_id: &str,
        topics: TopicScheme,
    ) -> Result<(Self, EventLoop), TransportError> {
        let (host, port) = parse_mqtt_url(broker)?;

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Ok((Self { client, topics }, eventloop))
    }

    /// Subscribe to the channel's sync topic.
    ///
    /// # Errors
    ///
    /// Returns error if subscription fails.
    pub async fn subscribe(&self) -> Result<(), TransportError> {
        let topic = self.topics.sync();

        tracing::info!(topic, "Subscribing to sync topic");

        self.client
            .subscribe(&topic, QoS::AtMostOnce)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    /// Topic scheme in use.
    #[must_use]
    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    /// Disconnect from the broker.
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be queued.
    pub fn disconnect(&self) -> Result<(), TransportError> {
        self.client
            .try_disconnect()
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

impl Transport for MqttTransport {
    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let topic = self.topics.sync();
        tracing::debug!(topic, payload_len = frame.len(), "Publishing sync message");
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, frame)
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

/// Parse MQTT URL into host and port.
fn parse_mqtt_url(input: &str) -> Result<(String, u16), TransportError> {
    if input.contains("://") {
        let url = Url::parse(input)
            .map_err(|e| TransportError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(TransportError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| TransportError::InvalidBrokerUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port.parse().map_err(|_| {
            TransportError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(TransportError::InvalidBrokerUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Outcome of handling one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Our own message came back
    Echo,
    /// Remote ops were merged
    Imported(ImportStatus),
    /// A catch-up request was answered
    Answered,
    /// Nothing to do (not addressed to us, or nothing to offer)
    Ignored,
}

/// Broadcasts local changes and merges remote ones.
pub struct SyncChannel {
    transport: Box<dyn Transport + Send>,
    replica_id: Uuid,
    last_sent: Option<VersionVector>,
}

impl SyncChannel {
    /// Create a channel for `replica_id`.
    #[must_use]
    pub fn new(transport: Box<dyn Transport + Send>, replica_id: Uuid) -> Self {
        Self {
            transport,
            replica_id,
            last_sent: None,
        }
    }

    /// Replica id stamped on outgoing messages.
    #[must_use]
    pub fn replica_id(&self) -> Uuid {
        self.replica_id
    }

    /// Version covered by the last broadcast.
    #[must_use]
    pub fn last_sent(&self) -> Option<&VersionVector> {
        self.last_sent.as_ref()
    }

    /// Broadcast what changed since the previous broadcast.
    ///
    /// Only local, non-checkout changes are sent. The marker moves before the
    /// send, so a failed send is not retried; anti-entropy repairs it.
    /// Returns the frame size when something was sent.
    ///
    /// # Errors
    ///
    /// Returns error if export, encoding or the send fails.
    pub fn on_commit(
        &mut self,
        doc: &Document,
        event: &ChangeEvent,
    ) -> Result<Option<usize>, SyncError> {
        if !event.is_local || event.from_checkout {
            return Ok(None);
        }
        if self
            .last_sent
            .as_ref()
            .is_some_and(|sent| sent.covers(doc.version()))
        {
            return Ok(None);
        }

        let payload = doc.export_since(self.last_sent.as_ref())?;
        self.last_sent = Some(doc.version().clone());

        let frame = SyncMessage::delta(self.replica_id, payload).to_cbor()?;
        let len = frame.len();
        self.transport.send(frame)?;
        tracing::debug!(replica = %self.replica_id, len, "Broadcast delta");
        Ok(Some(len))
    }

    /// Ask peers for every op this replica is missing.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the send fails.
    pub fn request_catch_up(&self, doc: &Document) -> Result<(), SyncError> {
        let request = SyncMessage::AntiEntropyRequest(AntiEntropyRequest {
            origin: self.replica_id,
            version: doc.version().clone(),
        });
        self.transport.send(request.to_cbor()?)?;
        tracing::debug!(replica = %self.replica_id, version = %doc.version(), "Requested catch-up");
        Ok(())
    }

    /// Handle one inbound frame.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MalformedDelta`] if the frame or its payload
    /// cannot be decoded; the document is left untouched.
    pub fn handle(&mut self, doc: &mut Document, frame: &[u8]) -> Result<Inbound, SyncError> {
        let message =
            SyncMessage::from_cbor(frame).map_err(|e| SyncError::MalformedDelta(e.to_string()))?;
        if message.origin() == self.replica_id {
            return Ok(Inbound::Echo);
        }

        match message {
            SyncMessage::Delta(delta) => Self::import(doc, &delta.payload),
            SyncMessage::AntiEntropyResponse(response) => {
                if response.target == self.replica_id {
                    Self::import(doc, &response.payload)
                } else {
                    Ok(Inbound::Ignored)
                }
            }
            SyncMessage::AntiEntropyRequest(request) => {
                if request.version.covers(doc.version()) {
                    return Ok(Inbound::Ignored);
                }
                let response = SyncMessage::AntiEntropyResponse(AntiEntropyResponse {
                    origin: self.replica_id,
                    target: request.origin,
                    payload: doc.export_since(Some(&request.version))?,
                });
                self.transport.send(response.to_cbor()?)?;
                tracing::debug!(requester = %request.origin, "Answered catch-up request");
                Ok(Inbound::Answered)
            }
        }
    }

    fn import(doc: &mut Document, payload: &[u8]) -> Result<Inbound, SyncError> {
        doc.import(payload)
            .map(Inbound::Imported)
            .map_err(|e| SyncError::MalformedDelta(e.to_string()))
    }

    /// Start over under a new replica id with no broadcast marker.
    pub fn reset(&mut self, replica_id: Uuid) {
        self.replica_id = replica_id;
        self.last_sent = None;
    }
}

/// Errors for transports.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
    /// Frame could not be sent
    #[error("send error: {0}")]
    Send(String),
}

/// Errors for the sync channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Inbound frame or delta could not be decoded
    #[error("malformed delta: {0}")]
    MalformedDelta(String),
    /// Local ops could not be exported
    #[error("export failed: {0}")]
    Export(#[from] DocError),
    /// Message could not be encoded
    #[error("encode failed: {0}")]
    Encode(#[from] MessageError),
    /// Transport rejected the frame
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use linesync_core::{buffer_text, reconcile};

    fn local_event(doc: &Document) -> ChangeEvent {
        ChangeEvent {
            is_local: true,
            from_checkout: false,
            frontier: doc.oplog_frontier().clone(),
        }
    }

    fn replica(bus: &LocalBus) -> (Document, SyncChannel, BusEndpoint) {
        let id = Uuid::new_v4();
        let endpoint = bus.endpoint();
        let channel = SyncChannel::new(Box::new(endpoint.sender()), id);
        (Document::new(id), channel, endpoint)
    }

    #[test]
    fn parse_mqtt_url_variants() {
        assert_eq!(
            parse_mqtt_url("tcp://broker:1884").unwrap(),
            ("broker".to_string(), 1884)
        );
        assert_eq!(
            parse_mqtt_url("mqtt://broker").unwrap(),
            ("broker".to_string(), 1883)
        );
        assert_eq!(
            parse_mqtt_url("localhost:1999").unwrap(),
            ("localhost".to_string(), 1999)
        );
        assert!(parse_mqtt_url("http://broker").is_err());
        assert!(parse_mqtt_url("a:b:c").is_err());
        assert!(parse_mqtt_url(":1883").is_err());
    }

    #[test]
    fn bus_skips_own_frames() {
        let bus = LocalBus::new("test", 16);
        let mut a = bus.endpoint();
        let mut b = bus.endpoint();

        a.sender().send(vec![1]).unwrap();

        assert_eq!(a.try_recv(), None);
        assert_eq!(b.try_recv(), Some(vec![1]));
        assert_eq!(b.try_recv(), None);
    }

    #[test]
    fn lagging_endpoint_loses_frames() {
        let bus = LocalBus::new("test", 2);
        let a = bus.endpoint();
        let mut b = bus.endpoint();

        for i in 0..4u8 {
            a.sender().send(vec![i]).unwrap();
        }

        assert_eq!(b.try_recv(), Some(vec![2]));
        assert_eq!(b.try_recv(), Some(vec![3]));
        assert_eq!(b.try_recv(), None);
    }

    #[test]
    fn local_commit_is_broadcast_and_merged() {
        let bus = LocalBus::new("test", 16);
        let (mut doc_a, mut sync_a, _ep_a) = replica(&bus);
        let (mut doc_b, mut sync_b, mut ep_b) = replica(&bus);

        reconcile(&mut doc_a, "hello\nworld").unwrap();
        assert!(sync_a.on_commit(&doc_a, &local_event(&doc_a)).unwrap().is_some());
        assert_eq!(sync_a.last_sent(), Some(doc_a.version()));

        let frame = ep_b.try_recv().unwrap();
        let inbound = sync_b.handle(&mut doc_b, &frame).unwrap();
        assert!(matches!(inbound, Inbound::Imported(status) if status.changes == 1));
        assert_eq!(buffer_text(&doc_b), "hello\nworld");
    }

    #[test]
    fn deltas_are_incremental() {
        let bus = LocalBus::new("test", 16);
        let (mut doc_a, mut sync_a, _ep_a) = replica(&bus);

        reconcile(&mut doc_a, "x").unwrap();
        let first = sync_a.on_commit(&doc_a, &local_event(&doc_a)).unwrap();
        // Nothing new: nothing sent.
        assert_eq!(sync_a.on_commit(&doc_a, &local_event(&doc_a)).unwrap(), None);

        reconcile(&mut doc_a, "y").unwrap();
        let second = sync_a.on_commit(&doc_a, &local_event(&doc_a)).unwrap();
        assert!(first.is_some() && second.is_some());
    }

    #[test]
    fn remote_and_checkout_events_are_not_broadcast() {
        let bus = LocalBus::new("test", 16);
        let (mut doc_a, mut sync_a, _ep_a) = replica(&bus);
        let mut ep_b = bus.endpoint();
        reconcile(&mut doc_a, "x").unwrap();

        let remote = ChangeEvent {
            is_local: false,
            ..local_event(&doc_a)
        };
        let checkout = ChangeEvent {
            from_checkout: true,
            ..local_event(&doc_a)
        };
        assert_eq!(sync_a.on_commit(&doc_a, &remote).unwrap(), None);
        assert_eq!(sync_a.on_commit(&doc_a, &checkout).unwrap(), None);
        assert_eq!(ep_b.try_recv(), None);
    }

    #[test]
    fn echo_is_dropped() {
        let bus = LocalBus::new("test", 16);
        let (mut doc_a, mut sync_a, _ep_a) = replica(&bus);
        reconcile(&mut doc_a, "x").unwrap();

        let frame = SyncMessage::delta(sync_a.replica_id(), doc_a.export_all().unwrap())
            .to_cbor()
            .unwrap();
        assert_eq!(sync_a.handle(&mut doc_a, &frame).unwrap(), Inbound::Echo);
    }

    #[test]
    fn malformed_frames_leave_document_untouched() {
        let bus = LocalBus::new("test", 16);
        let (mut doc, mut sync, _ep) = replica(&bus);
        reconcile(&mut doc, "keep").unwrap();
        let before = doc.version().clone();

        assert!(matches!(
            sync.handle(&mut doc, b"garbage"),
            Err(SyncError::MalformedDelta(_))
        ));
        let bad_payload = SyncMessage::delta(Uuid::new_v4(), vec![0xff, 0x00])
            .to_cbor()
            .unwrap();
        assert!(matches!(
            sync.handle(&mut doc, &bad_payload),
            Err(SyncError::MalformedDelta(_))
        ));

        assert_eq!(doc.version(), &before);
        assert_eq!(buffer_text(&doc), "keep");
    }

    #[test]
    fn anti_entropy_repairs_lost_delta() {
        let bus = LocalBus::new("test", 16);
        let (mut doc_a, mut sync_a, mut ep_a) = replica(&bus);
        let (mut doc_b, mut sync_b, mut ep_b) = replica(&bus);

        // A's broadcast is lost.
        reconcile(&mut doc_a, "lost").unwrap();
        sync_a.on_commit(&doc_a, &local_event(&doc_a)).unwrap();
        assert!(ep_b.try_recv().is_some());

        sync_b.request_catch_up(&doc_b).unwrap();
        let request = ep_a.try_recv().unwrap();
        assert_eq!(sync_a.handle(&mut doc_a, &request).unwrap(), Inbound::Answered);

        let response = ep_b.try_recv().unwrap();
        assert!(matches!(
            sync_b.handle(&mut doc_b, &response).unwrap(),
            Inbound::Imported(_)
        ));
        assert_eq!(buffer_text(&doc_b), "lost");
    }

    #[test]
    fn catch_up_request_with_nothing_to_offer_is_ignored() {
        let bus = LocalBus::new("test", 16);
        let (mut doc_a, mut sync_a, _ep_a) = replica(&bus);
        let (doc_b, sync_b, _ep_b) = replica(&bus);

        let request = SyncMessage::AntiEntropyRequest(AntiEntropyRequest {
            origin: sync_b.replica_id(),
            version: doc_b.version().clone(),
        })
        .to_cbor()
        .unwrap();
        assert_eq!(sync_a.handle(&mut doc_a, &request).unwrap(), Inbound::Ignored);
    }

    #[test]
    fn responses_for_other_replicas_are_ignored() {
        let bus = LocalBus::new("test", 16);
        let (mut doc, mut sync, _ep) = replica(&bus);
        let response = SyncMessage::AntiEntropyResponse(AntiEntropyResponse {
            origin: Uuid::new_v4(),
            target: Uuid::new_v4(),
            payload: vec![],
        })
        .to_cbor()
        .unwrap();

        assert_eq!(sync.handle(&mut doc, &response).unwrap(), Inbound::Ignored);
    }
}
