// libs/video-consultation-cell/src/services/devices.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::models::{
    DeviceInventory, DeviceKind, MediaConstraints, MediaDeviceInfo, VideoConsultationError,
};
use crate::services::lock;

/// A local capture stream (camera and/or microphone tracks).
pub trait MediaStream: Send + Sync {
    fn id(&self) -> &str;
    fn has_video(&self) -> bool;
    fn has_audio(&self) -> bool;
    /// Current input level in `0.0..=1.0`, if the stream carries audio.
    fn audio_level(&self) -> Option<f32>;
    /// Stops every track of the stream.
    fn stop(&self);
}

impl std::fmt::Debug for dyn MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream").field("id", &self.id()).finish()
    }
}

/// Platform media capability: device enumeration and capture.
#[async_trait::async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<MediaDeviceInfo>, VideoConsultationError>;

    /// Fails with `PermissionDenied` when the user refuses access and with
    /// `DeviceFailure` when the hardware cannot be opened.
    async fn open_stream(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<dyn MediaStream>, VideoConsultationError>;
}

/// Every local stream the session has opened. Teardown stops them all and
/// closes the registry; anything registered afterwards is stopped at once.
#[derive(Default)]
pub struct MediaRegistry {
    streams: Mutex<Vec<Arc<dyn MediaStream>>>,
    closed: AtomicBool,
}

impl MediaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` (with the stream already stopped) once closed.
    pub fn register(&self, stream: Arc<dyn MediaStream>) -> bool {
        let mut streams = lock(&self.streams);
        if self.closed.load(Ordering::SeqCst) {
            warn!("Media registry closed, stopping late stream {}", stream.id());
            stream.stop();
            return false;
        }
        debug!("Registered local media stream {}", stream.id());
        streams.push(stream);
        true
    }

    /// Stops and forgets a single stream, e.g. when a preview is replaced.
    pub fn release(&self, stream_id: &str) -> bool {
        let mut streams = lock(&self.streams);
        match streams.iter().position(|s| s.id() == stream_id) {
            Some(index) => {
                let stream = streams.remove(index);
                stream.stop();
                true
            }
            None => false,
        }
    }

    /// Stops every registered stream, closes the registry and returns how
    /// many were stopped.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<Arc<dyn MediaStream>> = {
            let mut streams = lock(&self.streams);
            self.closed.store(true, Ordering::SeqCst);
            streams.drain(..).collect()
        };
        for stream in &drained {
            stream.stop();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.streams).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Device enumeration, testing and local preview.
pub struct DeviceProbe {
    media: Arc<dyn MediaDevices>,
    registry: Arc<MediaRegistry>,
    preview: Mutex<Option<Arc<dyn MediaStream>>>,
}

impl DeviceProbe {
    pub fn new(media: Arc<dyn MediaDevices>, registry: Arc<MediaRegistry>) -> Self {
        Self {
            media,
            registry,
            preview: Mutex::new(None),
        }
    }

    pub async fn inventory(&self) -> Result<DeviceInventory, VideoConsultationError> {
        let devices = self.media.enumerate().await?;
        let inventory = DeviceInventory::from_devices(devices);
        info!(
            "Found {} cameras, {} microphones, {} speakers",
            inventory.cameras.len(),
            inventory.microphones.len(),
            inventory.speakers.len()
        );
        Ok(inventory)
    }

    /// Requests camera and microphone access and releases the stream at once.
    pub async fn request_permissions(&self) -> Result<(), VideoConsultationError> {
        let stream = self.media.open_stream(&MediaConstraints::audio_and_video()).await?;
        stream.stop();
        Ok(())
    }

    /// Opens `device_id` on its own and closes it again.
    pub async fn test_device(
        &self,
        kind: DeviceKind,
        device_id: &str,
    ) -> Result<(), VideoConsultationError> {
        let constraints = match kind {
            DeviceKind::Camera => MediaConstraints {
                video: true,
                camera_id: Some(device_id.to_string()),
                ..MediaConstraints::default()
            },
            DeviceKind::Microphone => MediaConstraints {
                audio: true,
                microphone_id: Some(device_id.to_string()),
                ..MediaConstraints::default()
            },
            DeviceKind::Speaker => {
                // Output devices cannot be captured; presence is the test.
                let inventory = self.inventory().await?;
                return if inventory.contains(DeviceKind::Speaker, device_id) {
                    Ok(())
                } else {
                    Err(VideoConsultationError::DeviceFailure {
                        device: DeviceKind::Speaker,
                        message: format!("speaker {} not found", device_id),
                    })
                };
            }
        };

        let stream = self.media.open_stream(&constraints).await.map_err(|e| {
            warn!("{} test failed for {}: {}", kind, device_id, e);
            e
        })?;
        stream.stop();
        Ok(())
    }

    /// Starts (or restarts) the local preview with the chosen devices.
    pub async fn start_preview(
        &self,
        camera_id: Option<&str>,
        microphone_id: Option<&str>,
    ) -> Result<Arc<dyn MediaStream>, VideoConsultationError> {
        let constraints = MediaConstraints {
            video: true,
            audio: true,
            camera_id: camera_id.map(str::to_string),
            microphone_id: microphone_id.map(str::to_string),
        };
        if self.registry.is_closed() {
            return Err(VideoConsultationError::SessionEnded);
        }
        let stream = self.media.open_stream(&constraints).await?;

        // Closed while the stream was opening: it is stopped, not kept.
        if !self.registry.register(Arc::clone(&stream)) {
            return Err(VideoConsultationError::SessionEnded);
        }
        let previous = lock(&self.preview).replace(Arc::clone(&stream));
        if let Some(previous) = previous {
            self.registry.release(previous.id());
        }

        Ok(stream)
    }

    pub fn stop_preview(&self) -> bool {
        match lock(&self.preview).take() {
            Some(stream) => self.registry.release(stream.id()),
            None => false,
        }
    }

    /// Audio-level meter reading of the preview stream.
    pub fn audio_level(&self) -> Option<f32> {
        lock(&self.preview)
            .as_ref()
            .and_then(|stream| stream.audio_level())
    }
}

/// Scriptable media devices for tests.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub struct MockMediaStream {
        id: String,
        video: bool,
        audio: bool,
        stop_calls: AtomicUsize,
    }

    impl MockMediaStream {
        pub fn new(id: &str, video: bool, audio: bool) -> Self {
            Self {
                id: id.to_string(),
                video,
                audio,
                stop_calls: AtomicUsize::new(0),
            }
        }

        pub fn stop_calls(&self) -> usize {
            self.stop_calls.load(Ordering::SeqCst)
        }
    }

    impl MediaStream for MockMediaStream {
        fn id(&self) -> &str {
            &self.id
        }

        fn has_video(&self) -> bool {
            self.video
        }

        fn has_audio(&self) -> bool {
            self.audio
        }

        fn audio_level(&self) -> Option<f32> {
            self.audio.then_some(0.42)
        }

        fn stop(&self) {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub struct MockMediaDevices {
        devices: Vec<MediaDeviceInfo>,
        deny_permissions: AtomicBool,
        camera_broken: AtomicBool,
        open_calls: AtomicUsize,
        streams: Mutex<Vec<Arc<MockMediaStream>>>,
    }

    impl Default for MockMediaDevices {
        fn default() -> Self {
            let device = |id: &str, kind: DeviceKind, label: &str| MediaDeviceInfo {
                device_id: id.to_string(),
                kind,
                label: label.to_string(),
            };
            Self {
                devices: vec![
                    device("cam-1", DeviceKind::Camera, "Built-in Camera"),
                    device("cam-2", DeviceKind::Camera, "USB Camera"),
                    device("mic-1", DeviceKind::Microphone, "Built-in Microphone"),
                    device("spk-1", DeviceKind::Speaker, "Speakers"),
                ],
                deny_permissions: AtomicBool::new(false),
                camera_broken: AtomicBool::new(false),
                open_calls: AtomicUsize::new(0),
                streams: Mutex::new(Vec::new()),
            }
        }
    }

    impl MockMediaDevices {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_deny_permissions(&self, deny: bool) {
            self.deny_permissions.store(deny, Ordering::SeqCst);
        }

        pub fn set_camera_broken(&self, broken: bool) {
            self.camera_broken.store(broken, Ordering::SeqCst);
        }

        pub fn open_calls(&self) -> usize {
            self.open_calls.load(Ordering::SeqCst)
        }

        pub fn streams(&self) -> Vec<Arc<MockMediaStream>> {
            lock(&self.streams).clone()
        }
    }

    #[async_trait::async_trait]
    impl MediaDevices for MockMediaDevices {
        async fn enumerate(&self) -> Result<Vec<MediaDeviceInfo>, VideoConsultationError> {
            Ok(self.devices.clone())
        }

        async fn open_stream(
            &self,
            constraints: &MediaConstraints,
        ) -> Result<Arc<dyn MediaStream>, VideoConsultationError> {
            let call = self.open_calls.fetch_add(1, Ordering::SeqCst);

            if self.deny_permissions.load(Ordering::SeqCst) {
                return Err(VideoConsultationError::PermissionDenied {
                    detail: "NotAllowedError: permission denied by user".to_string(),
                });
            }
            if constraints.video && self.camera_broken.load(Ordering::SeqCst) {
                return Err(VideoConsultationError::DeviceFailure {
                    device: DeviceKind::Camera,
                    message: "NotReadableError: could not start video source".to_string(),
                });
            }

            let stream = Arc::new(MockMediaStream::new(
                &format!("stream-{}", call),
                constraints.video,
                constraints.audio,
            ));
            lock(&self.streams).push(Arc::clone(&stream));
            Ok(stream)
        }
    }
}
