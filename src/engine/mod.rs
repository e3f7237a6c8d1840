//! The stream engine and its public handle.
//!
//! [`AudioStream`] is the one-shot playback session for a single URL:
//! configure it, `start()` it, control it, and throw it away once it is
//! done. Internally a driver task owns the [`core::StreamEngine`] state
//! machine and serializes every mutation; the handle talks to it through a
//! command channel and reads a mutex-guarded snapshot, so property getters
//! and queries never block on the pipeline.

mod core;
mod state;

pub use self::core::{StreamDelegate, StreamStatus};
pub use self::state::{DoneReason, StreamState};

pub(crate) use self::core::{Command, EngineConfig, EngineEvent, SharedState, StreamEngine};

#[cfg(test)]
pub(crate) use self::core::test_support;

use crate::audio::{
    AudioQueueFactory, FileStreamFactory, RodioFactory, SymphoniaFactory,
};
use crate::config::StreamSettings;
use crate::errors::StreamError;
use crate::models::{FileType, StreamDescription, TrackInfo};
use crate::net::{Connector, HttpConnector, ProxyConfig};
use reqwest::Url;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// A one-shot audio stream bound to a single URL.
///
/// Pre-start attributes (buffering, timeout, proxy, file type) are frozen
/// once [`AudioStream::start`] is called; setters silently do nothing after
/// that, mirroring how proxy changes after start are specified to be
/// ignored. Commands post to the driver task and return immediately; state
/// can be observed through the predicates or a [`StreamDelegate`].
pub struct AudioStream {
    url: Url,
    settings: StreamSettings,
    proxy: ProxyConfig,
    delegate: Option<Arc<dyn StreamDelegate>>,
    connector: Arc<dyn Connector>,
    parser_factory: Arc<dyn FileStreamFactory>,
    queue_factory: Arc<dyn AudioQueueFactory>,
    shared: Arc<Mutex<SharedState>>,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl AudioStream {
    /// A stream over the production stack: reqwest transport, symphonia
    /// parser, rodio output.
    pub fn new(url: Url) -> Self {
        Self::with_components(
            url,
            StreamSettings::default(),
            Arc::new(HttpConnector),
            Arc::new(SymphoniaFactory),
            Arc::new(RodioFactory),
        )
    }

    /// A stream with custom pipeline components. This is the seam used by
    /// tests and by embedders with their own transport or audio output.
    pub fn with_components(
        url: Url,
        settings: StreamSettings,
        connector: Arc<dyn Connector>,
        parser_factory: Arc<dyn FileStreamFactory>,
        queue_factory: Arc<dyn AudioQueueFactory>,
    ) -> Self {
        Self {
            url,
            settings,
            proxy: ProxyConfig::SystemDefault,
            delegate: None,
            connector,
            parser_factory,
            queue_factory,
            shared: Arc::new(Mutex::new(SharedState::default())),
            commands: None,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn started(&self) -> bool {
        self.commands.is_some()
    }

    // ---- pre-start configuration (ignored once started) ---------------

    pub fn set_delegate(&mut self, delegate: Arc<dyn StreamDelegate>) -> bool {
        if self.started() {
            return false;
        }
        self.delegate = Some(delegate);
        true
    }

    pub fn set_settings(&mut self, settings: StreamSettings) -> bool {
        if self.started() {
            return false;
        }
        self.settings = settings;
        true
    }

    pub fn set_buffer_count(&mut self, count: u32) -> bool {
        if self.started() {
            return false;
        }
        self.settings.set_buffer_count(count);
        true
    }

    pub fn set_buffer_size(&mut self, size: u32) -> bool {
        if self.started() {
            return false;
        }
        self.settings.set_buffer_size(size);
        true
    }

    pub fn set_buffer_fill_count_to_start(&mut self, count: u32) -> bool {
        if self.started() {
            return false;
        }
        self.settings.buffer_fill_count_to_start = count;
        true
    }

    pub fn set_buffer_infinite(&mut self, infinite: bool) -> bool {
        if self.started() {
            return false;
        }
        self.settings.buffer_infinite = infinite;
        true
    }

    pub fn set_timeout_interval(&mut self, seconds: u64) -> bool {
        if self.started() {
            return false;
        }
        self.settings.timeout_interval = seconds.max(1);
        true
    }

    pub fn set_playback_rate(&mut self, rate: f32) -> bool {
        if self.started() {
            return false;
        }
        self.settings.set_playback_rate(rate);
        true
    }

    pub fn set_file_type(&mut self, file_type: FileType) -> bool {
        if self.started() {
            return false;
        }
        self.settings.file_type = Some(file_type);
        true
    }

    pub fn set_http_proxy(&mut self, host: &str, port: u16) -> bool {
        if self.started() {
            return false;
        }
        self.proxy = ProxyConfig::Http {
            host: host.to_string(),
            port,
        };
        true
    }

    pub fn set_socks_proxy(&mut self, host: &str, port: u16) -> bool {
        if self.started() {
            return false;
        }
        self.proxy = ProxyConfig::Socks {
            host: host.to_string(),
            port,
        };
        true
    }

    // ---- lifecycle -----------------------------------------------------

    /// Spawn the driver task and begin downloading. Returns false if the
    /// stream was already started; a stream is never restartable. Must be
    /// called within a tokio runtime.
    pub fn start(&mut self) -> bool {
        if self.started() {
            return false;
        }
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = StreamEngine::new(EngineConfig {
            url: self.url.clone(),
            settings: self.settings.clone(),
            proxy: self.proxy.clone(),
            connector: self.connector.clone(),
            parser_factory: self.parser_factory.clone(),
            queue_factory: self.queue_factory.clone(),
            delegate: self.delegate.clone(),
            shared: self.shared.clone(),
            events_tx,
        });
        self.commands = Some(commands);
        tokio::spawn(run_driver(engine, command_rx, events_rx));
        true
    }

    /// Stop playback and tear everything down. Idempotent.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Pause if playing. Returns false in any other state.
    pub fn pause(&self) -> bool {
        if self.state() != StreamState::Playing {
            return false;
        }
        self.send(Command::Pause)
    }

    /// Resume if paused. Returns false in any other state.
    pub fn play(&self) -> bool {
        if self.state() != StreamState::Paused {
            return false;
        }
        self.send(Command::Play)
    }

    /// Seek to `time` seconds. Requires the bitrate and the resource
    /// length to be known; returns false otherwise. The reopen completes
    /// asynchronously; observe progress through the delegate.
    pub fn seek_to_time(&self, time: f64) -> bool {
        let ready = {
            let shared = self.shared.lock().unwrap();
            shared.bit_rate.is_some() && shared.file_length.is_some()
        };
        if !ready || self.is_done() {
            return false;
        }
        self.send(Command::SeekTo(time))
    }

    /// Seek relative to the current progress.
    pub fn seek_by_delta(&self, delta: f64) -> bool {
        match self.progress() {
            Some(progress) => self.seek_to_time((progress + delta).max(0.0)),
            None => false,
        }
    }

    /// Set the playback volume in [0.0, 1.0]. Returns false until the
    /// audio queue exists; callers that need earlier control should cache
    /// and re-apply (the playlist does).
    pub fn set_volume(&self, volume: f32) -> bool {
        if !self.shared.lock().unwrap().sink_created {
            return false;
        }
        self.send(Command::SetVolume(volume))
    }

    /// Ramp volume 0 → 1 over `duration` seconds. Returns false until the
    /// audio queue exists.
    pub fn fade_in_duration(&self, duration: f32) -> bool {
        if !self.shared.lock().unwrap().sink_created {
            return false;
        }
        self.send(Command::FadeIn(duration))
    }

    /// Ramp volume 1 → 0 over `duration` seconds. Returns false until the
    /// audio queue exists.
    pub fn fade_out_duration(&self, duration: f32) -> bool {
        if !self.shared.lock().unwrap().sink_created {
            return false;
        }
        self.send(Command::FadeOut(duration))
    }

    fn send(&self, command: Command) -> bool {
        match &self.commands {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    // ---- observation ---------------------------------------------------

    pub fn state(&self) -> StreamState {
        self.shared
            .lock()
            .unwrap()
            .state
            .unwrap_or(StreamState::Initialized)
    }

    pub fn is_playing(&self) -> bool {
        self.state() == StreamState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state() == StreamState::Paused
    }

    pub fn is_waiting(&self) -> bool {
        self.state().is_waiting()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn done_reason(&self) -> Option<DoneReason> {
        self.shared.lock().unwrap().done_reason.clone()
    }

    pub fn error(&self) -> Option<StreamError> {
        self.shared.lock().unwrap().error.clone()
    }

    pub fn http_headers(&self) -> HashMap<String, String> {
        self.shared.lock().unwrap().http_headers.clone()
    }

    /// The current song from ICY metadata, when the stream carries any.
    /// This is the raw `StreamTitle` value as the station sent it.
    pub fn current_song(&self) -> Option<String> {
        self.shared.lock().unwrap().current_song.clone()
    }

    /// The current song split into artist and title for display.
    pub fn current_track(&self) -> Option<TrackInfo> {
        self.current_song()
            .map(|title| TrackInfo::from_stream_title(&title))
    }

    pub fn stream_description(&self) -> Option<StreamDescription> {
        self.shared.lock().unwrap().description.clone()
    }

    pub fn is_seekable(&self) -> bool {
        self.shared.lock().unwrap().seekable
    }

    /// Stream duration in seconds, when both length and bitrate are known.
    pub fn duration(&self) -> Option<f64> {
        self.shared.lock().unwrap().duration
    }

    /// Playback position in seconds from the start of the resource.
    pub fn progress(&self) -> Option<f64> {
        self.shared.lock().unwrap().progress
    }

    /// Bits per second, once enough of the stream has been observed.
    pub fn calculated_bit_rate(&self) -> Option<f64> {
        self.shared.lock().unwrap().bit_rate
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        // dropping the command channel stops the driver
        debug!(url = %self.url, "stream handle dropped");
    }
}

/// Owns the engine; the only code that mutates it.
async fn run_driver(
    mut engine: StreamEngine,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) {
    engine.start_stream();

    let timeout_period = Duration::from_secs(engine.timeout_interval());
    let mut timeout =
        tokio::time::interval_at(tokio::time::Instant::now() + timeout_period, timeout_period);
    timeout.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut progress = tokio::time::interval(Duration::from_millis(250));
    progress.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut fade = tokio::time::interval(Duration::from_millis(30));
    fade.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(command) => engine.handle_command(command),
                // the handle is gone; nobody can control this stream
                None => engine.stop(),
            },
            event = events.recv() => {
                if let Some(event) = event {
                    engine.handle_event(event);
                }
            }
            _ = timeout.tick() => engine.check_timeout(),
            _ = progress.tick() => engine.update_progress(),
            _ = fade.tick(), if engine.is_fading() => engine.fade_tick(),
        }
        if engine.is_terminal() {
            break;
        }
    }
    debug!("stream driver finished");
}

#[cfg(test)]
mod tests {
    use super::core::test_support::{test_settings, ChunkingFactory, MockConnector, MockQueueFactory};
    use super::*;
    use crate::audio::sink::test_support::QueueLog;

    fn mock_stream() -> (AudioStream, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::default());
        let stream = AudioStream::with_components(
            "http://radio.example/live".parse().unwrap(),
            test_settings(4, 4096, 2),
            connector.clone(),
            Arc::new(ChunkingFactory::default()),
            Arc::new(MockQueueFactory {
                log: Arc::new(Mutex::new(QueueLog::default())),
                events: Arc::new(Mutex::new(Vec::new())),
            }),
        );
        (stream, connector)
    }

    #[tokio::test]
    async fn test_prestart_attributes_freeze_after_start() {
        let (mut stream, _connector) = mock_stream();
        assert!(stream.set_buffer_count(64));
        assert!(stream.set_http_proxy("proxy.local", 8080));
        assert_eq!(stream.settings().buffer_count, 64);

        assert!(stream.start());
        assert!(!stream.start());

        // ignored, not an error
        assert!(!stream.set_buffer_count(8));
        assert!(!stream.set_http_proxy("other.local", 1080));
        assert!(!stream.set_playback_rate(2.0));
        assert_eq!(stream.settings().buffer_count, 64);
    }

    #[tokio::test]
    async fn test_initial_predicates() {
        let (stream, _connector) = mock_stream();
        assert_eq!(stream.state(), StreamState::Initialized);
        assert!(!stream.is_playing());
        assert!(!stream.is_paused());
        assert!(!stream.is_done());
        assert!(stream.duration().is_none());
        assert!(stream.progress().is_none());
        assert!(stream.calculated_bit_rate().is_none());
        assert!(stream.current_song().is_none());
        assert!(stream.current_track().is_none());
    }

    #[tokio::test]
    async fn test_volume_rejected_before_queue_exists() {
        let (mut stream, _connector) = mock_stream();
        assert!(!stream.set_volume(0.5));
        assert!(!stream.fade_in_duration(1.0));

        stream.start();
        // still no audio queue: the stream is only downloading
        assert!(!stream.set_volume(0.5));
        assert!(!stream.fade_out_duration(1.0));
    }

    #[tokio::test]
    async fn test_seek_rejected_without_bitrate() {
        let (mut stream, _connector) = mock_stream();
        stream.start();
        assert!(!stream.seek_to_time(10.0));
        assert!(!stream.seek_by_delta(5.0));
    }

    #[tokio::test]
    async fn test_pause_requires_playing() {
        let (mut stream, _connector) = mock_stream();
        assert!(!stream.pause());
        stream.start();
        assert!(!stream.pause());
        assert!(!stream.play());
    }
}
