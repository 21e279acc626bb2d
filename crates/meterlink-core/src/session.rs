//! Association lifecycle per device.
//!
//! The [`SessionManager`] owns one [`DeviceSession`] per device serial. A
//! session is created lazily by [`SessionManager::get_or_create_session`],
//! which performs the association handshake, and is removed when a reply
//! carries the association-lost trailer. Sessions are never repaired in place:
//! after a loss the next call re-associates from scratch with a fresh codec.
//!
//! ```text
//! NoSession --get_or_create--> Associating --accepted--> Associated
//!     ^                              |                        |
//!     +---------- rejected ----------+                        |
//!     +---------------- trailer / invalidate / release -------+
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use meterlink_types::ReplyState;
use meterlink_types::obis::ASSOCIATION_LOST_TRAILER;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::correlation::{CorrelationTracker, ExchangeTimings};
use crate::error::{Error, Result};
use crate::traits::{Codec, CodecFactory};

/// Session manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Wait windows for every exchange.
    pub timings: ExchangeTimings,
    /// Reply suffix that signals a lost association.
    pub association_lost_trailer: Vec<u8>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timings: ExchangeTimings::default(),
            association_lost_trailer: ASSOCIATION_LOST_TRAILER.to_vec(),
        }
    }
}

/// Association state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No association.
    NoSession,
    /// Handshake in progress.
    Associating,
    /// Association established.
    Associated,
}

/// An established association with one device.
pub struct DeviceSession {
    device_id: String,
    generation: u64,
    codec: Mutex<Box<dyn Codec>>,
    associated_at: Instant,
    last_activity: std::sync::Mutex<Instant>,
}

impl DeviceSession {
    /// Device serial.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Distinguishes successive sessions of the same device.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When the association was established.
    pub fn associated_at(&self) -> Instant {
        self.associated_at
    }

    /// Time since the last exchange.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// Lock the session's codec.
    pub async fn codec(&self) -> MutexGuard<'_, Box<dyn Codec>> {
        self.codec.lock().await
    }

    fn touch(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device_id", &self.device_id)
            .field("generation", &self.generation)
            .field("idle_for", &self.idle_for())
            .finish()
    }
}

/// Owns the association state of every device.
pub struct SessionManager {
    tracker: Arc<CorrelationTracker>,
    codecs: Arc<dyn CodecFactory>,
    config: SessionConfig,
    sessions: DashMap<String, Arc<DeviceSession>>,
    handshakes: DashMap<String, Arc<Mutex<()>>>,
    generation: AtomicU64,
}

impl SessionManager {
    /// Create a manager that associates through `tracker`.
    pub fn new(
        tracker: Arc<CorrelationTracker>,
        codecs: Arc<dyn CodecFactory>,
        config: SessionConfig,
    ) -> Self {
        Self {
            tracker,
            codecs,
            config,
            sessions: DashMap::new(),
            handshakes: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// The tracker used for every exchange.
    pub fn tracker(&self) -> &Arc<CorrelationTracker> {
        &self.tracker
    }

    /// Current configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Return the device's session, associating first if there is none.
    ///
    /// # Errors
    ///
    /// Handshake failures propagate unchanged; no retry is attempted.
    pub async fn get_or_create_session(&self, device_id: &str) -> Result<Arc<DeviceSession>> {
        if let Some(session) = self.sessions.get(device_id) {
            return Ok(Arc::clone(session.value()));
        }

        let handshake = match self.handshakes.entry(device_id.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => Arc::clone(entry.insert(Arc::new(Mutex::new(()))).value()),
        };
        let _associating = handshake.lock().await;

        // Another caller may have finished the handshake while we waited.
        if let Some(session) = self.sessions.get(device_id) {
            return Ok(Arc::clone(session.value()));
        }

        let session = Arc::new(self.associate(device_id).await?);
        self.sessions
            .insert(device_id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    async fn associate(&self, device_id: &str) -> Result<DeviceSession> {
        debug!("Associating with {}", device_id);
        let mut codec = self.codecs.create(device_id)?;
        let request = codec.build_association_request()?;
        let reply = self
            .tracker
            .send(device_id, request, self.config.timings)
            .await?;
        codec.parse_association_reply(&reply).map_err(|e| {
            warn!("Association with {} rejected: {}", device_id, e);
            match e {
                Error::AssociationRejected { .. } => e,
                other => Error::AssociationRejected {
                    device_id: device_id.to_string(),
                    reason: other.to_string(),
                },
            }
        })?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        info!(generation, "Associated with {}", device_id);
        let now = Instant::now();
        Ok(DeviceSession {
            device_id: device_id.to_string(),
            generation,
            codec: Mutex::new(codec),
            associated_at: now,
            last_activity: std::sync::Mutex::new(now),
        })
    }

    /// Send `request` within `session` and return the raw reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AssociationLost`] and removes the session when the
    /// reply ends with the association-lost trailer. Tracker errors propagate
    /// without touching the session.
    pub async fn exchange(&self, session: &DeviceSession, request: Bytes) -> Result<Bytes> {
        let reply = self
            .tracker
            .send(&session.device_id, request, self.config.timings)
            .await?;
        session.touch();

        let trailer = &self.config.association_lost_trailer;
        if !trailer.is_empty() && reply.ends_with(trailer) {
            warn!(
                generation = session.generation,
                "Association lost with {}", session.device_id
            );
            self.remove_generation(&session.device_id, session.generation);
            return Err(Error::association_lost(&session.device_id));
        }
        Ok(reply)
    }

    /// Build a request with the session's codec, exchange it, and decode the
    /// reply.
    pub async fn transact<F>(&self, session: &DeviceSession, build: F) -> Result<ReplyState>
    where
        F: FnOnce(&mut dyn Codec) -> Result<Bytes>,
    {
        let request = {
            let mut codec = session.codec().await;
            build(&mut **codec)?
        };
        let reply = self.exchange(session, request).await?;
        let mut codec = session.codec().await;
        codec.decode(&reply)
    }

    /// Drop the cached session for `device_id`.
    pub fn invalidate(&self, device_id: &str) -> bool {
        match self.sessions.remove(device_id) {
            Some((_, session)) => {
                debug!(generation = session.generation, "Invalidated session for {}", device_id);
                true
            }
            None => false,
        }
    }

    fn remove_generation(&self, device_id: &str, generation: u64) {
        self.sessions
            .remove_if(device_id, |_, current| current.generation == generation);
    }

    /// Release the association (best effort) and drop the session.
    pub async fn release(&self, device_id: &str) {
        let Some((_, session)) = self.sessions.remove(device_id) else {
            return;
        };
        let request = {
            let mut codec = session.codec().await;
            codec.build_release_request()
        };
        let result = match request {
            Ok(request) => self
                .tracker
                .send(device_id, request, self.config.timings)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => info!("Released association with {}", device_id),
            Err(e) => debug!("Release for {} failed: {}", device_id, e),
        }
    }

    /// Association state of a device.
    pub fn state(&self, device_id: &str) -> SessionState {
        if self.sessions.contains_key(device_id) {
            return SessionState::Associated;
        }
        let handshaking = self
            .handshakes
            .get(device_id)
            .is_some_and(|lock| lock.try_lock().is_err());
        if handshaking {
            SessionState::Associating
        } else {
            SessionState::NoSession
        }
    }

    /// Devices with an established session.
    pub fn active_devices(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop sessions idle for longer than `max_idle`. Returns how many were
    /// dropped.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let idle: Vec<(String, u64)> = self
            .sessions
            .iter()
            .filter(|e| e.value().idle_for() > max_idle)
            .map(|e| (e.key().clone(), e.value().generation))
            .collect();
        for (device_id, generation) in &idle {
            debug!(generation, "Dropping idle session for {}", device_id);
            self.remove_generation(device_id, *generation);
        }
        idle.len()
    }

    /// Run [`SessionManager::sweep_idle`] every `every` until `cancel` fires.
    pub fn spawn_idle_sweeper(
        self: &Arc<Self>,
        every: Duration,
        max_idle: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Idle session sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let dropped = manager.sweep_idle(max_idle);
                        if dropped > 0 {
                            info!("Dropped {} idle sessions", dropped);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNetwork;

    fn manager(network: &Arc<MockNetwork>) -> Arc<SessionManager> {
        let tracker = network.tracker();
        Arc::new(SessionManager::new(
            tracker,
            network.clone(),
            SessionConfig {
                timings: ExchangeTimings::new(Duration::from_secs(1), Duration::from_secs(1)),
                ..Default::default()
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_is_created_once() {
        let network = MockNetwork::new();
        network.add_meter("M1");
        let sessions = manager(&network);

        assert_eq!(sessions.state("M1"), SessionState::NoSession);
        let a = sessions.get_or_create_session("M1").await.unwrap();
        let b = sessions.get_or_create_session("M1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(sessions.state("M1"), SessionState::Associated);
        assert_eq!(network.meter("M1").unwrap().associations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_handshake() {
        let network = MockNetwork::new();
        network.add_meter("M1").set_reply_delay(Duration::from_millis(200));
        let sessions = manager(&network);

        let (a, b) = tokio::join!(
            sessions.get_or_create_session("M1"),
            sessions.get_or_create_session("M1"),
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(network.meter("M1").unwrap().associations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_association_leaves_no_session() {
        let network = MockNetwork::new();
        network.add_meter("M1").reject_associations(true);
        let sessions = manager(&network);

        let err = sessions.get_or_create_session("M1").await.unwrap_err();
        assert!(matches!(err, Error::AssociationRejected { .. }));
        assert_eq!(sessions.state("M1"), SessionState::NoSession);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailer_invalidates_session() {
        let network = MockNetwork::new();
        let meter = network.add_meter("M1");
        let sessions = manager(&network);
        let session = sessions.get_or_create_session("M1").await.unwrap();

        meter.lose_association_after(0);
        let err = sessions
            .transact(&session, |codec| {
                codec.build_attribute_read_request(
                    8,
                    &meterlink_types::obis::CLOCK,
                    2,
                )
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AssociationLost { .. }));
        assert_eq!(sessions.state("M1"), SessionState::NoSession);

        let fresh = sessions.get_or_create_session("M1").await.unwrap();
        assert!(fresh.generation() > session.generation());
        assert_eq!(meter.associations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_idle_drops_only_idle_sessions() {
        let network = MockNetwork::new();
        network.add_meter("M1");
        network.add_meter("M2");
        let sessions = manager(&network);
        sessions.get_or_create_session("M1").await.unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        sessions.get_or_create_session("M2").await.unwrap();

        assert_eq!(sessions.sweep_idle(Duration::from_secs(60)), 1);
        assert_eq!(sessions.active_devices(), vec!["M2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweeper_stops_on_cancel() {
        let network = MockNetwork::new();
        network.add_meter("M1");
        let sessions = manager(&network);
        sessions.get_or_create_session("M1").await.unwrap();

        let cancel = CancellationToken::new();
        let handle = sessions.spawn_idle_sweeper(
            Duration::from_secs(30),
            Duration::from_secs(60),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(sessions.state("M1"), SessionState::NoSession);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_sends_release_request() {
        let network = MockNetwork::new();
        let meter = network.add_meter("M1");
        let sessions = manager(&network);
        sessions.get_or_create_session("M1").await.unwrap();

        sessions.release("M1").await;
        assert_eq!(sessions.state("M1"), SessionState::NoSession);
        assert_eq!(meter.releases(), 1);
    }
}
