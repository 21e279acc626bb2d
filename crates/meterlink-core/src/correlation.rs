//! Request/response correlation over one channel per device.
//!
//! Meters answer requests on the same byte stream they receive them on, with
//! no request id the transport can see. The [`CorrelationTracker`] therefore
//! allows at most one outstanding request per device and hands the next
//! inbound frame for that device to whoever is waiting.
//!
//! # Listen-first timeouts
//!
//! A request is given an initial window ([`ExchangeTimings::initial`]). When it
//! expires the tracker does not resend; it keeps waiting on the same completion
//! handle for a further [`ExchangeTimings::late_listen`] window, because some
//! vendor firmware answers well after its nominal deadline. Only when both
//! windows pass without a reply is the pending request discarded and
//! [`Error::Timeout`] returned.
//!
//! # Stale replies
//!
//! Once a pending request is discarded, a frame that arrives for the device is
//! dropped as unsolicited. If a newer request has already been registered, the
//! tracker can only tell the two apart through a [`FrameTagger`]; with a tagger
//! installed, a frame whose tag does not match the pending request is dropped.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::traits::{FrameHandler, FrameTagger, Transport};

/// Wait windows for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeTimings {
    /// Nominal response deadline.
    #[serde(with = "duration_millis")]
    pub initial: Duration,
    /// Additional time to keep listening after the nominal deadline.
    #[serde(with = "duration_millis")]
    pub late_listen: Duration,
}

impl Default for ExchangeTimings {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(10),
            late_listen: Duration::from_secs(20),
        }
    }
}

impl ExchangeTimings {
    /// Create timings from both windows.
    pub fn new(initial: Duration, late_listen: Duration) -> Self {
        Self {
            initial,
            late_listen,
        }
    }

    /// Combined deadline.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.initial + self.late_listen
    }
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Identifies one request: the device serial plus a tracker-wide nonce.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId {
    /// Device serial.
    pub device_id: String,
    /// Monotonic nonce.
    pub nonce: u64,
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.device_id, self.nonce)
    }
}

struct PendingRequest {
    id: CorrelationId,
    completion: oneshot::Sender<Bytes>,
    created_at: Instant,
    expected_tag: Option<u32>,
}

/// Snapshot of tracker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationStats {
    /// Requests written to the transport.
    pub sent: u64,
    /// Requests completed with a reply.
    pub completed: u64,
    /// Completions that arrived during the late-listen window.
    pub late: u64,
    /// Requests that expired.
    pub timeouts: u64,
    /// Waiters that observed cancellation.
    pub cancelled: u64,
    /// Inbound frames with no matching pending request.
    pub dropped_frames: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    completed: AtomicU64,
    late: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
    dropped_frames: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CorrelationStats {
        CorrelationStats {
            sent: self.sent.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }
}

/// Matches one in-flight request per device to its response.
///
/// The tracker is the [`FrameHandler`] the transport delivers inbound frames
/// to. Create it in an `Arc` and register a weak handle with the transport.
pub struct CorrelationTracker {
    transport: Arc<dyn Transport>,
    tagger: Option<Arc<dyn FrameTagger>>,
    pending: DashMap<String, PendingRequest>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    nonce: AtomicU64,
    counters: Counters,
}

impl CorrelationTracker {
    /// Create a tracker writing through `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            tagger: None,
            pending: DashMap::new(),
            in_flight: DashMap::new(),
            nonce: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    /// Install a frame tagger for stale-reply rejection.
    #[must_use]
    pub fn with_tagger(mut self, tagger: Arc<dyn FrameTagger>) -> Self {
        self.tagger = Some(tagger);
        self
    }

    /// The transport this tracker writes to.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send `request` to `device_id` and wait for its response.
    ///
    /// A second call for the same device waits until the first has resolved or
    /// been discarded. Calls for different devices run independently.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] when the transport has no open channel to
    ///   the device; nothing is written or registered
    /// - [`Error::Transport`] when the write fails
    /// - [`Error::Timeout`] when neither window yields a reply
    /// - [`Error::Cancelled`] when the pending request was discarded by
    ///   another party
    pub async fn send(
        &self,
        device_id: &str,
        request: Bytes,
        timings: ExchangeTimings,
    ) -> Result<Bytes> {
        let slot = self.slot(device_id);
        let _in_flight = slot.lock().await;
        if !self.transport.is_active(device_id) {
            debug!("No open channel to {}, not sending", device_id);
            return Err(Error::NotConnected(device_id.to_string()));
        }

        let id = CorrelationId {
            device_id: device_id.to_string(),
            nonce: self.nonce.fetch_add(1, Ordering::Relaxed),
        };
        let (completion, reply) = oneshot::channel();
        let created_at = Instant::now();
        let pending = PendingRequest {
            id: id.clone(),
            completion,
            created_at,
            expected_tag: self
                .tagger
                .as_ref()
                .and_then(|tagger| tagger.request_tag(&request)),
        };

        if let Some(stale) = self.pending.insert(device_id.to_string(), pending) {
            debug!(
                correlation = %stale.id,
                "Replaced stale pending request for {}", device_id
            );
        }
        let _discard_on_exit = DiscardOnDrop {
            tracker: self,
            id: &id,
        };

        Counters::bump(&self.counters.sent);
        debug!(correlation = %id, bytes = request.len(), "Sending request");
        self.transport.send(device_id, request).await?;

        self.wait(&id, reply, timings).await
    }

    async fn wait(
        &self,
        id: &CorrelationId,
        mut reply: oneshot::Receiver<Bytes>,
        timings: ExchangeTimings,
    ) -> Result<Bytes> {
        let nominal = tokio::time::sleep(timings.initial);
        let deadline = tokio::time::sleep(timings.total());
        tokio::pin!(nominal);
        tokio::pin!(deadline);
        let mut listening_late = false;

        loop {
            tokio::select! {
                biased;
                received = &mut reply => {
                    return match received {
                        Ok(frame) => {
                            Counters::bump(&self.counters.completed);
                            if listening_late {
                                Counters::bump(&self.counters.late);
                                info!(correlation = %id, "Late response accepted");
                            }
                            Ok(frame)
                        }
                        Err(_) => {
                            Counters::bump(&self.counters.cancelled);
                            debug!(correlation = %id, "Pending request cancelled");
                            Err(Error::Cancelled)
                        }
                    };
                }
                () = &mut nominal, if !listening_late => {
                    listening_late = true;
                    debug!(
                        correlation = %id,
                        "No response after {:?}, listening {:?} longer",
                        timings.initial,
                        timings.late_listen
                    );
                }
                () = &mut deadline => {
                    Counters::bump(&self.counters.timeouts);
                    warn!(correlation = %id, "No response within {:?}", timings.total());
                    return Err(Error::timeout(
                        format!("request {}", id),
                        timings.total(),
                    ));
                }
            }
        }
    }

    /// Discard whatever request is pending for `device_id`.
    ///
    /// Its waiter receives [`Error::Cancelled`]. Returns whether a request was
    /// pending.
    pub fn discard(&self, device_id: &str) -> bool {
        match self.pending.remove(device_id) {
            Some((_, pending)) => {
                debug!(correlation = %pending.id, "Discarded pending request");
                true
            }
            None => false,
        }
    }

    /// Remove the pending request only if it is still `id`.
    fn discard_if_current(&self, id: &CorrelationId) {
        self.pending
            .remove_if(&id.device_id, |_, pending| pending.id == *id);
    }

    /// Whether a request is pending for `device_id`.
    pub fn has_pending(&self, device_id: &str) -> bool {
        self.pending.contains_key(device_id)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CorrelationStats {
        self.counters.snapshot()
    }

    fn slot(&self, device_id: &str) -> Arc<Mutex<()>> {
        match self.in_flight.entry(device_id.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => Arc::clone(entry.insert(Arc::new(Mutex::new(()))).value()),
        }
    }

    fn tag_matches(&self, pending: &PendingRequest, frame: &[u8]) -> bool {
        match (&self.tagger, pending.expected_tag) {
            // Untagged frames (exception replies) cannot be attributed and are accepted.
            (Some(tagger), Some(expected)) => tagger
                .response_tag(frame)
                .is_none_or(|tag| tag == expected),
            _ => true,
        }
    }
}

impl FrameHandler for CorrelationTracker {
    fn on_frame(&self, device_id: &str, frame: Bytes) {
        let pending = match self.pending.entry(device_id.to_string()) {
            Entry::Vacant(_) => {
                Counters::bump(&self.counters.dropped_frames);
                warn!(
                    bytes = frame.len(),
                    "Dropping unsolicited frame from {}", device_id
                );
                return;
            }
            Entry::Occupied(entry) => {
                if !self.tag_matches(entry.get(), &frame) {
                    Counters::bump(&self.counters.dropped_frames);
                    warn!(
                        correlation = %entry.get().id,
                        "Dropping stale frame from {} (tag mismatch)", device_id
                    );
                    return;
                }
                entry.remove()
            }
        };

        debug!(
            correlation = %pending.id,
            bytes = frame.len(),
            elapsed = ?pending.created_at.elapsed(),
            "Response received"
        );
        if pending.completion.send(frame).is_err() {
            debug!(correlation = %pending.id, "Waiter gone before response");
        }
    }
}

/// Removes a request from the pending map when `send` returns or its future
/// is dropped, unless a newer request has replaced it.
struct DiscardOnDrop<'a> {
    tracker: &'a CorrelationTracker,
    id: &'a CorrelationId,
}

impl Drop for DiscardOnDrop<'_> {
    fn drop(&mut self) {
        self.tracker.discard_if_current(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::sync::Weak;

    /// Records writes and lets the test feed replies by hand.
    #[derive(Default)]
    struct ScriptedTransport {
        written: StdMutex<Vec<(String, Bytes)>>,
        fail: bool,
        closed: bool,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, device_id: &str, frame: Bytes) -> Result<()> {
            if self.fail {
                return Err(Error::transport(device_id, "write failed"));
            }
            self.written
                .lock()
                .unwrap()
                .push((device_id.to_string(), frame));
            Ok(())
        }

        fn is_active(&self, _device_id: &str) -> bool {
            !self.closed
        }
    }

    /// First byte of every frame is the tag.
    struct FirstByteTagger;

    impl FrameTagger for FirstByteTagger {
        fn request_tag(&self, request: &[u8]) -> Option<u32> {
            request.first().map(|b| u32::from(*b))
        }

        fn response_tag(&self, response: &[u8]) -> Option<u32> {
            response.first().map(|b| u32::from(*b))
        }
    }

    fn timings() -> ExchangeTimings {
        ExchangeTimings::new(Duration::from_secs(5), Duration::from_secs(10))
    }

    fn reply_later(
        tracker: &Arc<CorrelationTracker>,
        device: &str,
        frame: &'static [u8],
        after: Duration,
    ) {
        let weak: Weak<CorrelationTracker> = Arc::downgrade(tracker);
        let device = device.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tracker) = weak.upgrade() {
                tracker.on_frame(&device, Bytes::from_static(frame));
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_within_initial_window() {
        let tracker = Arc::new(CorrelationTracker::new(Arc::new(ScriptedTransport::default())));
        reply_later(&tracker, "M1", b"ok", Duration::from_secs(1));

        let reply = tracker
            .send("M1", Bytes::from_static(b"req"), timings())
            .await
            .unwrap();
        assert_eq!(&reply[..], b"ok");
        let stats = tracker.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.late, 0);
        assert!(!tracker.has_pending("M1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_is_salvaged() {
        let tracker = Arc::new(CorrelationTracker::new(Arc::new(ScriptedTransport::default())));
        reply_later(&tracker, "M1", b"late", Duration::from_secs(8));

        let reply = tracker
            .send("M1", Bytes::from_static(b"req"), timings())
            .await
            .unwrap();
        assert_eq!(&reply[..], b"late");
        assert_eq!(tracker.stats().late, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_pending_request() {
        let tracker = Arc::new(CorrelationTracker::new(Arc::new(ScriptedTransport::default())));
        let started = Instant::now();

        let err = tracker
            .send("M1", Bytes::from_static(b"req"), timings())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(started.elapsed() < Duration::from_secs(16));
        assert!(!tracker.has_pending("M1"));

        // A frame after the discard finds no mapping.
        tracker.on_frame("M1", Bytes::from_static(b"too late"));
        assert_eq!(tracker.stats().dropped_frames, 1);
        assert_eq!(tracker.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_discards_pending_request() {
        let transport = ScriptedTransport {
            fail: true,
            ..Default::default()
        };
        let tracker = CorrelationTracker::new(Arc::new(transport));
        let err = tracker
            .send("M1", Bytes::from_static(b"req"), timings())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert!(!tracker.has_pending("M1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_registers_nothing() {
        let transport = Arc::new(ScriptedTransport {
            closed: true,
            ..Default::default()
        });
        let tracker = CorrelationTracker::new(transport.clone());
        let started = Instant::now();

        let err = tracker
            .send("M1", Bytes::from_static(b"req"), timings())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(ref device) if device == "M1"));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(!tracker.has_pending("M1"));
        assert!(transport.written.lock().unwrap().is_empty());
        assert_eq!(tracker.stats(), CorrelationStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tagged_stale_frame_does_not_complete_newer_request() {
        let tracker = Arc::new(
            CorrelationTracker::new(Arc::new(ScriptedTransport::default()))
                .with_tagger(Arc::new(FirstByteTagger)),
        );

        // Request 1 times out; its reply shows up while request 2 is pending.
        let err = tracker
            .send("M1", Bytes::from_static(&[1, 0xAA]), timings())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));

        reply_later(&tracker, "M1", &[1, 0xEE], Duration::from_secs(1));
        reply_later(&tracker, "M1", &[2, 0xBB], Duration::from_secs(2));
        let reply = tracker
            .send("M1", Bytes::from_static(&[2, 0xAA]), timings())
            .await
            .unwrap();
        assert_eq!(&reply[..], &[2, 0xBB]);
        assert_eq!(tracker.stats().dropped_frames, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_in_flight_per_device() {
        let transport = Arc::new(ScriptedTransport::default());
        let tracker = Arc::new(CorrelationTracker::new(transport.clone()));

        let first = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .send("M1", Bytes::from_static(b"one"), timings())
                    .await
            })
        };
        let second = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .send("M1", Bytes::from_static(b"two"), timings())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Only one request reached the wire.
        assert_eq!(transport.written.lock().unwrap().len(), 1);

        tracker.on_frame("M1", Bytes::from_static(b"r1"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.written.lock().unwrap().len(), 2);
        tracker.on_frame("M1", Bytes::from_static(b"r2"));

        let mut replies = vec![
            first.await.unwrap().unwrap(),
            second.await.unwrap().unwrap(),
        ];
        replies.sort();
        assert_eq!(
            replies,
            vec![Bytes::from_static(b"r1"), Bytes::from_static(b"r2")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_devices_do_not_block_each_other() {
        let transport = Arc::new(ScriptedTransport::default());
        let tracker = Arc::new(CorrelationTracker::new(transport.clone()));

        let slow = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .send("M1", Bytes::from_static(b"a"), timings())
                    .await
            })
        };
        reply_later(&tracker, "M2", b"fast", Duration::from_millis(5));
        let reply = tracker
            .send("M2", Bytes::from_static(b"b"), timings())
            .await
            .unwrap();
        assert_eq!(&reply[..], b"fast");
        assert!(tracker.has_pending("M1"));

        tracker.discard("M1");
        assert!(matches!(slow.await.unwrap(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_exchange_timings_serde() {
        let timings = ExchangeTimings::new(Duration::from_millis(1500), Duration::from_secs(3));
        let json = serde_json::to_string(&timings).unwrap();
        assert_eq!(json, r#"{"initial":1500,"late_listen":3000}"#);
        let back: ExchangeTimings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, timings);
    }
}
