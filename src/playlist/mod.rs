//! Playlist coordination over one-shot streams.
//!
//! A [`Playlist`] owns an ordered queue of URLs and at most one
//! [`AudioStream`] at a time. It advances automatically when a song ends,
//! retries network failures a bounded number of times (resuming near the
//! point of failure when the stream is seekable), and tells its observer
//! when the queue runs low or dry.

use crate::engine::{AudioStream, DoneReason, StreamDelegate, StreamState, StreamStatus};
use crate::errors::StreamError;
use crate::models::TrackInfo;
use reqwest::Url;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Network-class failures are retried this many times per song.
const MAX_TRIES: u32 = 3;
/// Base back-off between retry attempts; multiplied by the attempt number.
const RETRY_DELAY: Duration = Duration::from_secs(1);
/// `RunningOutOfSongs` fires when fewer songs than this remain queued.
const LOW_WATER_MARK: usize = 2;

/// Observer callbacks for playlist-level events. All optional.
pub trait PlaylistDelegate: Send + Sync {
    /// A new URL started playing.
    fn new_song_playing(&self, _url: &Url) {}
    /// Playback was requested but the queue is empty.
    fn no_songs_left(&self) {}
    /// The queue is running low; feed it more songs.
    fn running_out_of_songs(&self) {}
    /// A new stream was created for the current song.
    fn created_new_stream(&self) {}
    /// A song failed beyond retry; the playlist is advancing.
    fn stream_error(&self, _error: &StreamError) {}
    /// A retry attempt is about to reopen the current song.
    fn attempting_new_song(&self) {}
}

/// Builds one stream per song; swapped out in tests.
type StreamBuilder = Box<dyn Fn(Url) -> AudioStream + Send + Sync>;

struct PlaylistInner {
    songs: VecDeque<Url>,
    playing: Option<Url>,
    stream: Option<AudioStream>,
    /// Identity of the current stream; stale delegate events are dropped
    stream_id: u64,
    retrying: bool,
    nexting: bool,
    stopping: bool,
    volume_set: bool,
    volume: f32,
    last_known_seek_time: f64,
    /// Seek target to apply once the retried stream can seek
    resume_at: Option<f64>,
    tries: u32,
    /// The current stream reached playing at least once
    reached_playing: bool,
}

struct PlaylistShared {
    inner: Mutex<PlaylistInner>,
    delegate: Mutex<Option<Arc<dyn PlaylistDelegate>>>,
    builder: StreamBuilder,
    ids: AtomicU64,
}

/// Ordered queue of songs driving successive streams.
///
/// Cheap to clone; clones share the same queue and stream.
#[derive(Clone)]
pub struct Playlist {
    shared: Arc<PlaylistShared>,
}

impl Playlist {
    /// A playlist over the production stream stack.
    pub fn new() -> Self {
        Self::with_capacity(16)
    }

    /// A playlist expecting roughly `capacity` queued songs.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_builder(capacity, Box::new(AudioStream::new))
    }

    /// A playlist whose streams come from `builder`. Tests and embedders
    /// with custom pipelines use this.
    pub fn with_builder(capacity: usize, builder: StreamBuilder) -> Self {
        Self {
            shared: Arc::new(PlaylistShared {
                inner: Mutex::new(PlaylistInner {
                    songs: VecDeque::with_capacity(capacity),
                    playing: None,
                    stream: None,
                    stream_id: 0,
                    retrying: false,
                    nexting: false,
                    stopping: false,
                    volume_set: false,
                    volume: 1.0,
                    last_known_seek_time: 0.0,
                    resume_at: None,
                    tries: 0,
                    reached_playing: false,
                }),
                delegate: Mutex::new(None),
                builder,
                ids: AtomicU64::new(1),
            }),
        }
    }

    pub fn set_delegate(&self, delegate: Arc<dyn PlaylistDelegate>) {
        *self.shared.delegate.lock().unwrap() = Some(delegate);
    }

    // ---- queue management ----------------------------------------------

    /// Append a song; optionally begin playing if nothing is.
    pub fn add_song(&self, url: Url, play: bool) {
        let start = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.songs.push_back(url);
            play && inner.stream.as_ref().map(|s| s.is_done()).unwrap_or(true)
        };
        if start {
            self.play();
        }
    }

    /// Remove the song at `index`. Returns false when out of range.
    pub fn remove_song_at(&self, index: usize) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.songs.remove(index).is_some()
    }

    /// Drop every queued song without touching the current one. Does not
    /// trigger low-queue notifications.
    pub fn clear_song_list(&self) {
        self.shared.inner.lock().unwrap().songs.clear();
    }

    /// Snapshot of the queued songs.
    pub fn songs(&self) -> Vec<Url> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .songs
            .iter()
            .cloned()
            .collect()
    }

    /// The URL currently playing, if any.
    pub fn playing_url(&self) -> Option<Url> {
        self.shared.inner.lock().unwrap().playing.clone()
    }

    // ---- playback control ----------------------------------------------

    /// Start playing the queue, or resume the paused current song.
    pub fn play(&self) {
        {
            let inner = self.shared.inner.lock().unwrap();
            if let Some(stream) = &inner.stream {
                if stream.is_paused() {
                    stream.play();
                    return;
                }
                if !stream.is_done() {
                    return;
                }
            }
        }
        self.start_next();
    }

    /// Pause the current song, if one is playing.
    pub fn pause(&self) {
        let inner = self.shared.inner.lock().unwrap();
        if let Some(stream) = &inner.stream {
            stream.pause();
        }
    }

    /// Stop the current song and forget about it. Queued songs stay.
    pub fn stop(&self) {
        let stream = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.stopping {
                return;
            }
            inner.stopping = true;
            inner.playing = None;
            inner.stream.take()
        };
        if let Some(stream) = stream {
            stream.stop();
        }
        self.shared.inner.lock().unwrap().stopping = false;
    }

    /// Skip to the next queued song.
    pub fn next(&self) {
        let stream = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.nexting {
                return;
            }
            inner.nexting = true;
            inner.playing = None;
            inner.stream.take()
        };
        if let Some(stream) = stream {
            stream.stop();
        }
        self.start_next();
        self.shared.inner.lock().unwrap().nexting = false;
    }

    /// Reopen the current song after a network failure, resuming near the
    /// point of failure. Does nothing unless the current stream failed
    /// with a retryable error.
    pub fn retry(&self) {
        let (url, resume_at) = {
            let inner = self.shared.inner.lock().unwrap();
            let failed = inner
                .stream
                .as_ref()
                .and_then(|s| s.error())
                .map(|e| e.is_retryable())
                .unwrap_or(false);
            if !failed {
                return;
            }
            match &inner.playing {
                Some(url) => (url.clone(), inner.last_known_seek_time),
                None => return,
            }
        };
        self.emit(|d| d.attempting_new_song());
        self.start_url(url, Some(resume_at), true);
    }

    /// Set the volume for this and every future song. Cached and pushed
    /// to each new stream, so it applies even before audio exists.
    pub fn set_volume(&self, volume: f32) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.volume = volume.clamp(0.0, 1.0);
        inner.volume_set = true;
        if let Some(stream) = &inner.stream {
            stream.set_volume(inner.volume);
        }
    }

    // ---- stream observation --------------------------------------------

    pub fn is_paused(&self) -> bool {
        self.with_stream(|s| s.is_paused())
    }

    pub fn is_playing(&self) -> bool {
        self.with_stream(|s| s.is_playing() || s.is_waiting())
    }

    /// True when no stream exists or the current one is finished.
    pub fn is_idle(&self) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        match &inner.stream {
            Some(stream) => stream.is_done(),
            None => true,
        }
    }

    pub fn is_error(&self) -> bool {
        self.with_stream(|s| s.error().is_some())
    }

    pub fn duration(&self) -> Option<f64> {
        let inner = self.shared.inner.lock().unwrap();
        inner.stream.as_ref().and_then(|s| s.duration())
    }

    pub fn progress(&self) -> Option<f64> {
        let inner = self.shared.inner.lock().unwrap();
        inner.stream.as_ref().and_then(|s| s.progress())
    }

    /// Artist and title of the current song, when the stream carries ICY
    /// metadata.
    pub fn current_track(&self) -> Option<TrackInfo> {
        let inner = self.shared.inner.lock().unwrap();
        inner.stream.as_ref().and_then(|s| s.current_track())
    }

    fn with_stream(&self, f: impl Fn(&AudioStream) -> bool) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        inner.stream.as_ref().map(f).unwrap_or(false)
    }

    // ---- internals -----------------------------------------------------

    /// Take the queue head and play it; tell the observer when the queue
    /// is empty or running low.
    fn start_next(&self) {
        let (url, remaining) = {
            let mut inner = self.shared.inner.lock().unwrap();
            match inner.songs.pop_front() {
                Some(url) => {
                    let remaining = inner.songs.len();
                    (url, remaining)
                }
                None => {
                    drop(inner);
                    debug!("no songs left to play");
                    self.emit(|d| d.no_songs_left());
                    return;
                }
            }
        };
        if remaining < LOW_WATER_MARK {
            self.emit(|d| d.running_out_of_songs());
        }
        self.start_url(url, None, false);
    }

    /// Create and start a stream for `url`.
    fn start_url(&self, url: Url, resume_at: Option<f64>, retrying: bool) {
        info!(url = %url, retrying, "starting song");
        let id = self.shared.ids.fetch_add(1, Ordering::Relaxed);
        let mut stream = (self.shared.builder)(url.clone());

        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.volume_set {
                let mut settings = stream.settings().clone();
                settings.volume = inner.volume;
                stream.set_settings(settings);
            }
            inner.stream_id = id;
            inner.retrying = retrying;
            inner.reached_playing = false;
            inner.resume_at = resume_at.filter(|&t| t > 0.0);
            if !retrying {
                inner.tries = 0;
                inner.last_known_seek_time = 0.0;
            }
            inner.playing = Some(url.clone());
        }

        stream.set_delegate(Arc::new(StreamObserver {
            playlist: Arc::downgrade(&self.shared),
            id,
        }));
        stream.start();
        self.shared.inner.lock().unwrap().stream = Some(stream);

        self.emit(|d| d.created_new_stream());
        self.emit(|d| d.new_song_playing(&url));
    }

    fn emit(&self, f: impl Fn(&dyn PlaylistDelegate)) {
        let delegate = self.shared.delegate.lock().unwrap().clone();
        if let Some(delegate) = delegate {
            f(delegate.as_ref());
        }
    }

    /// Handle a status change from the current stream.
    fn on_stream_status(&self, id: u64, status: &StreamStatus) {
        enum Action {
            None,
            Advance,
            Retry { url: Url, attempt: u32 },
            Fail { error: StreamError },
        }

        let action = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.stream_id != id {
                return; // a replaced stream finishing its teardown
            }
            if let Some(progress) = status.progress {
                inner.last_known_seek_time = progress;
            }
            match status.state {
                StreamState::Playing => {
                    if !inner.reached_playing {
                        inner.reached_playing = true;
                        inner.tries = 0;
                        inner.retrying = false;
                    }
                    Action::None
                }
                StreamState::Done => match &status.done_reason {
                    Some(DoneReason::Eof) => Action::Advance,
                    Some(DoneReason::Error(error)) => {
                        if error.is_retryable() && inner.tries < MAX_TRIES {
                            inner.tries += 1;
                            inner.retrying = true;
                            match &inner.playing {
                                Some(url) => Action::Retry {
                                    url: url.clone(),
                                    attempt: inner.tries,
                                },
                                None => Action::Advance,
                            }
                        } else {
                            Action::Fail {
                                error: error.clone(),
                            }
                        }
                    }
                    _ => Action::None,
                },
                StreamState::Stopped => Action::None,
                _ => Action::None,
            }
        };

        match action {
            Action::None => {}
            Action::Advance => {
                debug!("song finished, advancing");
                self.start_next();
            }
            Action::Retry { url, attempt } => {
                warn!(url = %url, attempt, "song failed, retrying");
                self.emit(|d| d.attempting_new_song());
                let playlist = self.clone();
                let resume_at = self.shared.inner.lock().unwrap().last_known_seek_time;
                tokio::spawn(async move {
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                    playlist.start_url(url, Some(resume_at), true);
                });
            }
            Action::Fail { error } => {
                warn!(error = %error, "song failed, advancing");
                self.emit(|d| d.stream_error(&error));
                self.start_next();
            }
        }
    }

    fn on_stream_bitrate_ready(&self, id: u64) {
        let (stream_seek, target) = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.stream_id != id {
                return;
            }
            match inner.resume_at.take() {
                Some(target) => (true, target),
                None => (false, 0.0),
            }
        };
        if stream_seek {
            let inner = self.shared.inner.lock().unwrap();
            if let Some(stream) = &inner.stream {
                debug!(seconds = target, "resuming after retry");
                stream.seek_to_time(target);
            }
        }
    }
}

impl Default for Playlist {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-stream delegate bridging engine events back to the playlist.
struct StreamObserver {
    playlist: Weak<PlaylistShared>,
    id: u64,
}

impl StreamDelegate for StreamObserver {
    fn status_did_change(&self, status: &StreamStatus) {
        if let Some(shared) = self.playlist.upgrade() {
            Playlist { shared }.on_stream_status(self.id, status);
        }
    }

    fn bitrate_is_ready(&self, _status: &StreamStatus) {
        if let Some(shared) = self.playlist.upgrade() {
            Playlist { shared }.on_stream_bitrate_ready(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sink::test_support::QueueLog;
    use crate::audio::{SinkEvent, SinkEventSink};
    use crate::engine::test_support::{
        test_settings, ChunkingFactory, MockConnector, MockQueueFactory,
    };
    use crate::net::NetEvent;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    struct StreamHarness {
        connector: Arc<MockConnector>,
        queue_log: Arc<Mutex<QueueLog>>,
        queue_events: Arc<Mutex<Vec<SinkEventSink>>>,
    }

    impl StreamHarness {
        fn net(&self, event: NetEvent) {
            (self.connector.opens.lock().unwrap()[0].events)(event);
        }

        fn sink(&self, event: SinkEvent) {
            (self.queue_events.lock().unwrap()[0])(event);
        }

        fn opened(&self) -> bool {
            !self.connector.opens.lock().unwrap().is_empty()
        }
    }

    #[derive(Default)]
    struct Recorder {
        new_songs: Mutex<Vec<Url>>,
        no_songs: AtomicUsize,
        low_water: AtomicUsize,
        created: AtomicUsize,
        errors: Mutex<Vec<StreamError>>,
        attempts: AtomicUsize,
    }

    impl PlaylistDelegate for Recorder {
        fn new_song_playing(&self, url: &Url) {
            self.new_songs.lock().unwrap().push(url.clone());
        }

        fn no_songs_left(&self) {
            self.no_songs.fetch_add(1, Ordering::SeqCst);
        }

        fn running_out_of_songs(&self) {
            self.low_water.fetch_add(1, Ordering::SeqCst);
        }

        fn created_new_stream(&self) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }

        fn stream_error(&self, error: &StreamError) {
            self.errors.lock().unwrap().push(error.clone());
        }

        fn attempting_new_song(&self) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_playlist() -> (Playlist, Arc<Mutex<Vec<StreamHarness>>>, Arc<Recorder>) {
        let harnesses: Arc<Mutex<Vec<StreamHarness>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = harnesses.clone();
        let playlist = Playlist::with_builder(
            4,
            Box::new(move |url| {
                let connector = Arc::new(MockConnector::default());
                let queue_log = Arc::new(Mutex::new(QueueLog::default()));
                let queue_events = Arc::new(Mutex::new(Vec::new()));
                captured.lock().unwrap().push(StreamHarness {
                    connector: connector.clone(),
                    queue_log: queue_log.clone(),
                    queue_events: queue_events.clone(),
                });
                AudioStream::with_components(
                    url,
                    test_settings(4, 4096, 1),
                    connector,
                    Arc::new(ChunkingFactory::default()),
                    Arc::new(MockQueueFactory {
                        log: queue_log,
                        events: queue_events,
                    }),
                )
            }),
        );
        let recorder = Arc::new(Recorder::default());
        playlist.set_delegate(recorder.clone());
        (playlist, harnesses, recorder)
    }

    fn url(name: &str) -> Url {
        format!("http://radio.example/{}", name).parse().unwrap()
    }

    async fn wait_until(what: &str, f: impl Fn() -> bool) {
        for _ in 0..500 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("never happened: {}", what);
    }

    fn mp3_headers() -> HashMap<String, String> {
        [("content-type", "audio/mpeg"), ("content-length", "1000000")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// True once the current stream is in the playing state proper, not
    /// merely waiting.
    fn strictly_playing(playlist: &Playlist) -> bool {
        let inner = playlist.shared.inner.lock().unwrap();
        inner
            .stream
            .as_ref()
            .map(|s| s.is_playing())
            .unwrap_or(false)
    }

    async fn drive_to_playing(playlist: &Playlist, h: &StreamHarness) {
        wait_until("stream opened", || h.opened()).await;
        h.net(NetEvent::Headers {
            status: 200,
            headers: mp3_headers(),
        });
        h.net(NetEvent::Bytes(vec![1u8; 4096].into()));
        h.net(NetEvent::Bytes(vec![2u8; 4096].into()));
        wait_until("queue started", || h.queue_log.lock().unwrap().started).await;
        h.sink(SinkEvent::IsRunningChanged(true));
        wait_until("reached playing", || strictly_playing(playlist)).await;
    }

    fn drive_to_eof(h: &StreamHarness) {
        h.net(NetEvent::EndOfStream);
        h.sink(SinkEvent::BufferFree(0));
        h.sink(SinkEvent::BufferFree(1));
        h.sink(SinkEvent::IsRunningChanged(false));
    }

    #[test]
    fn test_play_on_empty_queue_reports_no_songs() {
        let (playlist, _harnesses, recorder) = test_playlist();
        playlist.play();
        assert_eq!(recorder.no_songs.load(Ordering::SeqCst), 1);
        assert!(playlist.is_idle());
    }

    #[test]
    fn test_queue_editing() {
        let (playlist, _harnesses, _recorder) = test_playlist();
        playlist.add_song(url("a.mp3"), false);
        playlist.add_song(url("b.mp3"), false);
        playlist.add_song(url("c.mp3"), false);
        assert_eq!(playlist.songs().len(), 3);

        assert!(playlist.remove_song_at(1));
        assert!(!playlist.remove_song_at(7));
        assert_eq!(playlist.songs(), vec![url("a.mp3"), url("c.mp3")]);

        playlist.clear_song_list();
        assert!(playlist.songs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_advance_through_queue() {
        let (playlist, harnesses, recorder) = test_playlist();
        playlist.add_song(url("one.mp3"), false);
        playlist.add_song(url("two.mp3"), false);
        playlist.play();

        // taking the head leaves one song: the queue is running low
        assert_eq!(recorder.low_water.load(Ordering::SeqCst), 1);

        {
            let h = &harnesses.lock().unwrap()[0];
            drive_to_playing(&playlist, h).await;
            drive_to_eof(h);
        }

        // EOF advances to the second song automatically
        wait_until("second stream", || harnesses.lock().unwrap().len() == 2).await;
        assert_eq!(playlist.playing_url(), Some(url("two.mp3")));

        {
            let h1 = &harnesses.lock().unwrap()[1];
            drive_to_playing(&playlist, h1).await;
            drive_to_eof(h1);
        }

        wait_until("queue exhausted", || {
            recorder.no_songs.load(Ordering::SeqCst) == 1
        })
        .await;
        assert!(playlist.is_idle());

        let songs = recorder.new_songs.lock().unwrap();
        assert_eq!(songs.as_slice(), &[url("one.mp3"), url("two.mp3")]);
        assert_eq!(recorder.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_retries_same_url() {
        let (playlist, harnesses, recorder) = test_playlist();
        playlist.add_song(url("fragile.mp3"), true);

        {
            let h = &harnesses.lock().unwrap()[0];
            drive_to_playing(&playlist, h).await;
            h.net(NetEvent::Failed(StreamError::NetworkConnectionFailed(
                "connection reset".to_string(),
            )));
        }

        wait_until("retry attempted", || {
            recorder.attempts.load(Ordering::SeqCst) >= 1
        })
        .await;
        wait_until("stream reopened", || harnesses.lock().unwrap().len() == 2).await;

        // still on the same song, no error surfaced to the observer
        assert_eq!(playlist.playing_url(), Some(url("fragile.mp3")));
        assert!(recorder.errors.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_surfaces_error_and_advances() {
        let (playlist, harnesses, recorder) = test_playlist();
        playlist.add_song(url("dead.mp3"), true);

        // the initial attempt plus three retries all fail before playing
        for attempt in 0..4 {
            wait_until("stream created", || {
                harnesses.lock().unwrap().len() == attempt + 1
            })
            .await;
            {
                let h = &harnesses.lock().unwrap()[attempt];
                wait_until("stream opened", || h.opened()).await;
                h.net(NetEvent::Failed(StreamError::NetworkConnectionFailed(
                    "no route".to_string(),
                )));
            }
        }

        wait_until("error surfaced", || {
            !recorder.errors.lock().unwrap().is_empty()
        })
        .await;
        assert_eq!(recorder.attempts.load(Ordering::SeqCst), 3);
        // nothing else queued: the advance reports an empty queue
        assert_eq!(recorder.no_songs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_cached_and_pushed_to_new_streams() {
        let (playlist, _harnesses, _recorder) = test_playlist();
        playlist.set_volume(0.4);
        playlist.add_song(url("quiet.mp3"), true);

        let inner = playlist.shared.inner.lock().unwrap();
        let stream = inner.stream.as_ref().unwrap();
        assert_eq!(stream.settings().volume, 0.4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_forgets_current_song() {
        let (playlist, harnesses, _recorder) = test_playlist();
        playlist.add_song(url("song.mp3"), true);
        {
            let h = &harnesses.lock().unwrap()[0];
            drive_to_playing(&playlist, h).await;
        }

        playlist.stop();
        assert_eq!(playlist.playing_url(), None);
        assert!(playlist.is_idle());
        // stop does not touch the queue
        playlist.stop();
        assert_eq!(playlist.songs().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_through_playlist() {
        let (playlist, harnesses, _recorder) = test_playlist();
        playlist.add_song(url("song.mp3"), true);
        {
            let h = &harnesses.lock().unwrap()[0];
            drive_to_playing(&playlist, h).await;
        }

        playlist.pause();
        wait_until("paused", || playlist.is_paused()).await;

        playlist.play();
        wait_until("resumed", || playlist.is_playing()).await;
    }
}
