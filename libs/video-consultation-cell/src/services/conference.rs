// libs/video-consultation-cell/src/services/conference.rs
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::{
    ConferenceEvent, ConferenceStatus, JoinRequest, VideoConsultationError,
};
use crate::services::lock;

/// An engine event tagged with the join it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterEvent {
    pub generation: u64,
    pub event: ConferenceEvent,
}

/// Where an engine pushes its events for one join.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<AdapterEvent>,
}

impl EventSink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the controller has gone away.
    pub fn emit(&self, event: ConferenceEvent) -> bool {
        self.tx
            .send(AdapterEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// The external conferencing engine: joins a named room and reports events.
#[async_trait::async_trait]
pub trait ConferenceEngine: Send + Sync {
    /// Resolves once the engine has confirmed the join.
    async fn join(
        &self,
        request: &JoinRequest,
        events: EventSink,
    ) -> Result<Box<dyn ConferenceHandle>, VideoConsultationError>;
}

/// A live room membership returned by [`ConferenceEngine::join`].
pub trait ConferenceHandle: Send + Sync {
    fn set_video_input(&self, device_id: &str) -> Result<(), VideoConsultationError>;
    fn set_audio_input(&self, device_id: &str) -> Result<(), VideoConsultationError>;
    fn set_audio_muted(&self, muted: bool) -> Result<(), VideoConsultationError>;
    fn set_video_muted(&self, muted: bool) -> Result<(), VideoConsultationError>;
    fn leave(&self) -> Result<(), VideoConsultationError>;
    fn status(&self) -> ConferenceStatus;
    /// Releases the engine's resources. Called exactly once per handle.
    fn dispose(&self);
}

struct LiveConference {
    generation: u64,
    handle: Box<dyn ConferenceHandle>,
}

/// Thin wrapper around the engine that keeps at most one handle live and
/// normalizes everything it emits onto one channel.
pub struct ConferenceAdapter {
    engine: Arc<dyn ConferenceEngine>,
    live: Mutex<Option<LiveConference>>,
    generation: AtomicU64,
    events: mpsc::UnboundedSender<AdapterEvent>,
}

impl ConferenceAdapter {
    pub fn new(engine: Arc<dyn ConferenceEngine>) -> (Self, mpsc::UnboundedReceiver<AdapterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = Self {
            engine,
            live: Mutex::new(None),
            generation: AtomicU64::new(0),
            events: tx,
        };
        (adapter, rx)
    }

    /// Joins the room, disposing any previous handle first.
    /// Returns the generation tag of the new join.
    pub async fn join(&self, request: JoinRequest) -> Result<u64, VideoConsultationError> {
        if self.dispose() {
            debug!("Disposed previous conference before joining {}", request.room_name);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = EventSink {
            generation,
            tx: self.events.clone(),
        };

        info!("Joining conference room {} (generation {})", request.room_name, generation);
        let handle = self.engine.join(&request, sink).await?;

        let mut live = lock(&self.live);
        if let Some(stale) = live.take() {
            warn!("Conference generation {} was still live, disposing", stale.generation);
            stale.handle.dispose();
        }
        *live = Some(LiveConference { generation, handle });

        Ok(generation)
    }

    /// Disposes the live handle, if any. Returns whether one was disposed.
    pub fn dispose(&self) -> bool {
        let taken = lock(&self.live).take();
        match taken {
            Some(conference) => {
                conference.handle.dispose();
                debug!("Disposed conference generation {}", conference.generation);
                true
            }
            None => false,
        }
    }

    pub fn leave(&self) -> Result<(), VideoConsultationError> {
        self.with_handle(|handle| handle.leave())
    }

    pub fn is_live(&self) -> bool {
        lock(&self.live).is_some()
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether an event tagged `generation` belongs to the most recent join.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation.load(Ordering::SeqCst)
    }

    /// Read-only status query used by the monitors.
    pub fn status(&self) -> Option<ConferenceStatus> {
        lock(&self.live).as_ref().map(|conference| conference.handle.status())
    }

    pub fn set_audio_muted(&self, muted: bool) -> Result<(), VideoConsultationError> {
        self.with_handle(|handle| handle.set_audio_muted(muted))
    }

    pub fn set_video_muted(&self, muted: bool) -> Result<(), VideoConsultationError> {
        self.with_handle(|handle| handle.set_video_muted(muted))
    }

    pub fn set_video_input(&self, device_id: &str) -> Result<(), VideoConsultationError> {
        self.with_handle(|handle| handle.set_video_input(device_id))
    }

    pub fn set_audio_input(&self, device_id: &str) -> Result<(), VideoConsultationError> {
        self.with_handle(|handle| handle.set_audio_input(device_id))
    }

    fn with_handle<T>(
        &self,
        f: impl FnOnce(&dyn ConferenceHandle) -> Result<T, VideoConsultationError>,
    ) -> Result<T, VideoConsultationError> {
        let live = lock(&self.live);
        match live.as_ref() {
            Some(conference) => f(conference.handle.as_ref()),
            None => Err(VideoConsultationError::ConnectionLost {
                message: "no live conference".to_string(),
            }),
        }
    }
}

/// Scriptable engine for controller tests.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize};

    use crate::models::ConnectionState;

    #[derive(Default)]
    pub struct MockConferenceHandle {
        dispose_calls: AtomicUsize,
        leave_calls: AtomicUsize,
        audio_muted: AtomicBool,
        video_muted: AtomicBool,
        screen_sharing: AtomicBool,
        participants: AtomicU32,
        video_input: Mutex<Option<String>>,
        audio_input: Mutex<Option<String>>,
    }

    impl MockConferenceHandle {
        pub fn dispose_calls(&self) -> usize {
            self.dispose_calls.load(Ordering::SeqCst)
        }

        pub fn leave_calls(&self) -> usize {
            self.leave_calls.load(Ordering::SeqCst)
        }

        pub fn is_video_muted(&self) -> bool {
            self.video_muted.load(Ordering::SeqCst)
        }

        pub fn is_audio_muted(&self) -> bool {
            self.audio_muted.load(Ordering::SeqCst)
        }

        pub fn video_input(&self) -> Option<String> {
            lock(&self.video_input).clone()
        }

        pub fn audio_input(&self) -> Option<String> {
            lock(&self.audio_input).clone()
        }

        pub fn set_participants(&self, count: u32) {
            self.participants.store(count, Ordering::SeqCst);
        }

        pub fn set_screen_sharing(&self, sharing: bool) {
            self.screen_sharing.store(sharing, Ordering::SeqCst);
        }
    }

    impl ConferenceHandle for Arc<MockConferenceHandle> {
        fn set_video_input(&self, device_id: &str) -> Result<(), VideoConsultationError> {
            *lock(&self.video_input) = Some(device_id.to_string());
            Ok(())
        }

        fn set_audio_input(&self, device_id: &str) -> Result<(), VideoConsultationError> {
            *lock(&self.audio_input) = Some(device_id.to_string());
            Ok(())
        }

        fn set_audio_muted(&self, muted: bool) -> Result<(), VideoConsultationError> {
            self.audio_muted.store(muted, Ordering::SeqCst);
            Ok(())
        }

        fn set_video_muted(&self, muted: bool) -> Result<(), VideoConsultationError> {
            self.video_muted.store(muted, Ordering::SeqCst);
            Ok(())
        }

        fn leave(&self) -> Result<(), VideoConsultationError> {
            self.leave_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn status(&self) -> ConferenceStatus {
            let connection_state = if self.dispose_calls() > 0 {
                ConnectionState::Disconnected
            } else {
                ConnectionState::Connected
            };
            ConferenceStatus {
                connection_state,
                participant_count: self.participants.load(Ordering::SeqCst),
                audio_muted: self.audio_muted.load(Ordering::SeqCst),
                video_muted: self.video_muted.load(Ordering::SeqCst),
                screen_sharing: self.screen_sharing.load(Ordering::SeqCst),
            }
        }

        fn dispose(&self) {
            self.dispose_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Joins succeed unless a failure was queued with [`Self::fail_next_join`].
    #[derive(Default)]
    pub struct MockConferenceEngine {
        outcomes: Mutex<VecDeque<VideoConsultationError>>,
        requests: Mutex<Vec<JoinRequest>>,
        handles: Mutex<Vec<Arc<MockConferenceHandle>>>,
        last_sink: Mutex<Option<EventSink>>,
        join_calls: AtomicUsize,
    }

    impl MockConferenceEngine {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next_join(&self, error: VideoConsultationError) {
            lock(&self.outcomes).push_back(error);
        }

        pub fn fail_next_joins(&self, count: usize, error: VideoConsultationError) {
            let mut outcomes = lock(&self.outcomes);
            for _ in 0..count {
                outcomes.push_back(error.clone());
            }
        }

        pub fn join_calls(&self) -> usize {
            self.join_calls.load(Ordering::SeqCst)
        }

        pub fn join_requests(&self) -> Vec<JoinRequest> {
            lock(&self.requests).clone()
        }

        pub fn handles(&self) -> Vec<Arc<MockConferenceHandle>> {
            lock(&self.handles).clone()
        }

        pub fn last_handle(&self) -> Option<Arc<MockConferenceHandle>> {
            lock(&self.handles).last().cloned()
        }

        /// Handles that were joined and never disposed.
        pub fn live_handles(&self) -> usize {
            lock(&self.handles)
                .iter()
                .filter(|handle| handle.dispose_calls() == 0)
                .count()
        }

        pub fn total_dispose_calls(&self) -> usize {
            lock(&self.handles).iter().map(|handle| handle.dispose_calls()).sum()
        }

        /// Pushes an event through the most recent join's sink.
        pub fn emit(&self, event: ConferenceEvent) -> bool {
            match lock(&self.last_sink).as_ref() {
                Some(sink) => sink.emit(event),
                None => false,
            }
        }
    }

    #[async_trait::async_trait]
    impl ConferenceEngine for MockConferenceEngine {
        async fn join(
            &self,
            request: &JoinRequest,
            events: EventSink,
        ) -> Result<Box<dyn ConferenceHandle>, VideoConsultationError> {
            self.join_calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.requests).push(request.clone());

            if let Some(error) = lock(&self.outcomes).pop_front() {
                return Err(error);
            }

            let handle = Arc::new(MockConferenceHandle::default());
            handle.set_participants(1);
            lock(&self.handles).push(Arc::clone(&handle));
            events.emit(ConferenceEvent::Joined {
                room_name: request.room_name.clone(),
            });
            *lock(&self.last_sink) = Some(events);

            Ok(Box::new(handle))
        }
    }
}
