//! The stream engine: a state machine over the four pipeline stages.
//!
//! All engine state lives here and is only touched by the driver task that
//! owns the engine, so the handlers below are plain synchronous code.
//! Network and sink callbacks arrive as [`EngineEvent`]s stamped with the
//! pipeline generation they belong to; a teardown bumps the generation, so
//! stragglers from a closed reader or a disposed queue fall on the floor.

use crate::audio::{
    AudioQueueFactory, BufferRing, FileStreamFactory, PacketDesc, PacketParser, ParserEvent,
    PlaybackSink, RingAction, SinkEvent, SinkEventSink,
};
use crate::config::StreamSettings;
use crate::engine::state::{DoneReason, StreamState};
use crate::errors::StreamError;
use crate::models::{FileType, StreamDescription};
use crate::net::{Connector, IcyDemuxer, NetEvent, NetEventSink, ProxyConfig, ReaderHandle};
use reqwest::Url;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Packets to observe before the averaged bitrate is trusted.
const BITRATE_READY_PACKETS: u64 = 50;

/// Commands sent from the public handle to the driver task.
#[derive(Debug)]
pub(crate) enum Command {
    Pause,
    Play,
    Stop,
    SeekTo(f64),
    SetVolume(f32),
    FadeIn(f32),
    FadeOut(f32),
}

/// Stage events, marshaled onto the driver task.
#[derive(Debug)]
pub(crate) enum EngineEvent {
    Net { generation: u64, event: NetEvent },
    Sink { generation: u64, event: SinkEvent },
    /// Posted to the control loop when a freed buffer should trigger an
    /// overflow-FIFO drain
    DrainQueued { generation: u64 },
}

/// Snapshot handed to delegate callbacks.
#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub state: StreamState,
    pub done_reason: Option<DoneReason>,
    pub error: Option<StreamError>,
    pub current_song: Option<String>,
    pub progress: Option<f64>,
}

/// Event callbacks for a stream.
///
/// Exactly one delegate receives each event; there is no broadcast
/// notification channel. Callbacks run on the stream's driver task, so keep
/// them short and never block.
pub trait StreamDelegate: Send + Sync {
    /// The stream's status changed; inspect the snapshot or query the
    /// stream's properties.
    fn status_did_change(&self, status: &StreamStatus);

    /// Enough packets have been observed to calculate the bitrate. This is
    /// the earliest point at which seeking can succeed, and fires at most
    /// once per stream.
    fn bitrate_is_ready(&self, _status: &StreamStatus) {}
}

/// State shared between the engine task and the public handle.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    pub state: Option<StreamState>,
    pub done_reason: Option<DoneReason>,
    pub error: Option<StreamError>,
    pub http_headers: HashMap<String, String>,
    pub current_song: Option<String>,
    pub description: Option<StreamDescription>,
    pub bit_rate: Option<f64>,
    pub duration: Option<f64>,
    pub progress: Option<f64>,
    pub sink_created: bool,
    pub file_length: Option<u64>,
    pub seekable: bool,
}

/// Everything the engine needs at construction.
pub(crate) struct EngineConfig {
    pub url: Url,
    pub settings: StreamSettings,
    pub proxy: ProxyConfig,
    pub connector: Arc<dyn Connector>,
    pub parser_factory: Arc<dyn FileStreamFactory>,
    pub queue_factory: Arc<dyn AudioQueueFactory>,
    pub delegate: Option<Arc<dyn StreamDelegate>>,
    pub shared: Arc<Mutex<SharedState>>,
    pub events_tx: mpsc::UnboundedSender<EngineEvent>,
}

pub(crate) struct StreamEngine {
    url: Url,
    settings: StreamSettings,
    proxy: ProxyConfig,
    connector: Arc<dyn Connector>,
    parser_factory: Arc<dyn FileStreamFactory>,
    queue_factory: Arc<dyn AudioQueueFactory>,
    delegate: Option<Arc<dyn StreamDelegate>>,
    shared: Arc<Mutex<SharedState>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,

    state: StreamState,
    done_reason: Option<DoneReason>,
    error: Option<StreamError>,
    generation: u64,

    reader: Option<ReaderHandle>,
    demuxer: Option<IcyDemuxer>,
    parser: Option<PacketParser>,
    ring: Option<BufferRing>,
    sink: Option<PlaybackSink>,

    http_headers: HashMap<String, String>,
    mime_type: Option<String>,
    file_length: Option<u64>,
    seekable: bool,
    current_song: Option<String>,

    // cached container facts, preserved across seek reopens
    description: Option<StreamDescription>,
    data_offset: u64,
    audio_data_byte_count: Option<u64>,
    total_audio_packets: Option<u64>,

    // seek accounting
    seek_time: f64,
    seek_byte_offset: u64,
    discontinuous: bool,
    last_progress: Option<f64>,

    // bitrate sampling
    processed_packets: u64,
    processed_bytes: u64,
    bitrate_emitted: bool,
    icy_bitrate: Option<f64>,

    // timeout bookkeeping
    net_events: u32,
    unscheduled: bool,
    rescheduled: bool,

    sink_running: bool,
    net_eof: bool,
    /// Flush deferred until the overflow FIFO drains
    eof_flush_pending: bool,
    /// Suppresses re-entrant failures raised during teardown
    failing: bool,
}

impl StreamEngine {
    pub(crate) fn new(config: EngineConfig) -> Self {
        Self {
            url: config.url,
            settings: config.settings,
            proxy: config.proxy,
            connector: config.connector,
            parser_factory: config.parser_factory,
            queue_factory: config.queue_factory,
            delegate: config.delegate,
            shared: config.shared,
            events_tx: config.events_tx,
            state: StreamState::Initialized,
            done_reason: None,
            error: None,
            generation: 0,
            reader: None,
            demuxer: None,
            parser: None,
            ring: None,
            sink: None,
            http_headers: HashMap::new(),
            mime_type: None,
            file_length: None,
            seekable: false,
            current_song: None,
            description: None,
            data_offset: 0,
            audio_data_byte_count: None,
            total_audio_packets: None,
            seek_time: 0.0,
            seek_byte_offset: 0,
            discontinuous: false,
            last_progress: None,
            processed_packets: 0,
            processed_bytes: 0,
            bitrate_emitted: false,
            icy_bitrate: None,
            net_events: 0,
            unscheduled: false,
            rescheduled: false,
            sink_running: false,
            net_eof: false,
            eof_flush_pending: false,
            failing: false,
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn timeout_interval(&self) -> u64 {
        self.settings.timeout_interval.max(1)
    }

    pub(crate) fn is_fading(&self) -> bool {
        self.sink.as_ref().map(|s| s.is_fading()).unwrap_or(false)
    }

    /// Begin downloading. Called once by the driver task.
    pub(crate) fn start_stream(&mut self) {
        if self.state != StreamState::Initialized {
            return;
        }
        info!(url = %self.url, "starting stream");
        self.open_reader(0);
        self.set_state(StreamState::WaitingForData);
    }

    pub(crate) fn handle_command(&mut self, command: Command) {
        match command {
            Command::Pause => self.pause(),
            Command::Play => self.play(),
            Command::Stop => self.stop(),
            Command::SeekTo(time) => {
                self.seek_to(time);
            }
            Command::SetVolume(volume) => self.set_volume(volume),
            Command::FadeIn(duration) => self.fade(duration, true),
            Command::FadeOut(duration) => self.fade(duration, false),
        }
    }

    pub(crate) fn handle_event(&mut self, event: EngineEvent) {
        if self.is_terminal() {
            return;
        }
        match event {
            EngineEvent::Net { generation, event } => {
                if generation == self.generation {
                    self.handle_net(event);
                }
            }
            EngineEvent::Sink { generation, event } => {
                if generation == self.generation {
                    self.handle_sink(event);
                }
            }
            EngineEvent::DrainQueued { generation } => {
                if generation == self.generation {
                    self.drain_overflow();
                }
            }
        }
    }

    // ---- network path -------------------------------------------------

    fn handle_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Headers { status, headers } => {
                self.net_events += 1;
                self.apply_headers(status, headers);
            }
            NetEvent::Bytes(bytes) => {
                self.net_events += 1;
                self.process_bytes(&bytes);
            }
            NetEvent::EndOfStream => {
                self.net_events += 1;
                self.handle_end_of_stream();
            }
            NetEvent::Failed(error) => self.fail(error),
        }
    }

    fn apply_headers(&mut self, status: u16, headers: HashMap<String, String>) {
        debug!(status, "response headers received");
        if let Some(len) = headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            // on a range reopen the remaining length plus the offset
            // reconstructs the full resource size
            self.file_length = Some(self.seek_byte_offset + len);
        }
        if status == 206 {
            self.seekable = true;
            if let Some(total) = headers
                .get("content-range")
                .and_then(|v| v.rsplit('/').next())
                .and_then(|total| total.trim().parse::<u64>().ok())
            {
                self.file_length = Some(total);
            }
        } else if headers
            .get("accept-ranges")
            .map(|v| v.contains("bytes"))
            .unwrap_or(false)
        {
            self.seekable = true;
        }
        self.mime_type = headers.get("content-type").cloned();

        let demuxer = IcyDemuxer::for_response(&headers);
        if let Some(bitrate) = demuxer.bitrate() {
            self.icy_bitrate = Some(bitrate);
        }
        self.demuxer = Some(demuxer);
        self.http_headers.extend(headers);

        self.sync_shared();
        self.check_bitrate_ready();
    }

    fn process_bytes(&mut self, bytes: &[u8]) {
        let demuxer = self
            .demuxer
            .get_or_insert_with(IcyDemuxer::transparent);
        let mut audio = Vec::with_capacity(bytes.len());
        let updates = demuxer.feed(bytes, &mut audio);

        let mut song_changed = false;
        for update in updates {
            if let Some(title) = update.title {
                debug!(title = %title, "current song changed");
                self.current_song = Some(title);
                song_changed = true;
            }
        }
        if demuxer.is_icy() && !demuxer.inline_headers().is_empty() {
            for (key, value) in demuxer.inline_headers().clone() {
                self.http_headers.entry(key).or_insert(value);
            }
            if self.icy_bitrate.is_none() {
                self.icy_bitrate = demuxer.bitrate();
            }
        }
        if song_changed {
            self.sync_shared();
        }

        if audio.is_empty() {
            return;
        }
        self.parse_audio(&audio);
    }

    fn parse_audio(&mut self, audio: &[u8]) {
        if self.parser.is_none() {
            let file_type = self
                .settings
                .file_type
                .unwrap_or_else(|| FileType::infer(self.mime_type.as_deref(), self.url.path()));
            debug!(?file_type, "opening packet parser");
            let mut parser = PacketParser::new(self.parser_factory.create());
            if let Err(e) = parser.open(file_type) {
                self.fail(e);
                return;
            }
            self.parser = Some(parser);
        }

        let discontinuous = self.discontinuous;
        self.discontinuous = false;
        let result = self
            .parser
            .as_mut()
            .expect("parser exists")
            .feed(audio, discontinuous);
        match result {
            Ok(events) => self.process_parser_events(events),
            Err(e) => self.fail(e),
        }
    }

    fn process_parser_events(&mut self, events: Vec<ParserEvent>) {
        for event in events {
            if self.is_terminal() {
                return;
            }
            match event {
                ParserEvent::Ready => self.setup_playback(),
                ParserEvent::Packets { data, descs } => self.handle_packets(&data, &descs),
            }
        }
    }

    /// Properties are known: build the ring and the platform queue.
    fn setup_playback(&mut self) {
        let parser = self.parser.as_ref().expect("parser exists");
        let Some(description) = parser.description().cloned() else {
            self.fail(StreamError::AudioDataNotFound);
            return;
        };
        if parser.data_offset() > 0 {
            self.data_offset = parser.data_offset();
        }
        if let Some(count) = parser.audio_data_byte_count() {
            self.audio_data_byte_count = Some(count);
        }
        if let Some(total) = parser.total_audio_packets() {
            self.total_audio_packets = Some(total);
        }
        let buffer_size = parser.packet_buffer_size(self.settings.buffer_size);

        info!(
            ?description,
            buffer_size,
            buffer_count = self.settings.buffer_count,
            "stream properties ready"
        );
        self.description = Some(description.clone());

        self.ring = Some(BufferRing::new(
            self.settings.buffer_count as usize,
            buffer_size as usize,
            self.settings.buffer_infinite,
        ));
        match self.queue_factory.create(
            &description,
            buffer_size,
            self.settings.buffer_count,
            self.sink_events(),
        ) {
            Ok(queue) => {
                let mut sink = PlaybackSink::new(queue, self.settings.volume);
                if (self.settings.playback_rate - 1.0).abs() > f32::EPSILON {
                    if let Err(e) = sink.set_playback_rate(self.settings.playback_rate) {
                        warn!(error = %e, "playback rate not applied");
                    }
                }
                self.sink = Some(sink);
                self.sync_shared();
                self.check_bitrate_ready();
            }
            Err(e) => self.fail(e),
        }
    }

    fn handle_packets(&mut self, data: &[u8], descs: &[PacketDesc]) {
        if self.ring.is_none() {
            // packets without properties: nothing to play into
            self.fail(StreamError::AudioDataNotFound);
            return;
        }
        for desc in descs {
            if self.is_terminal() {
                return;
            }
            let packet = &data[desc.offset..desc.offset + desc.len];
            self.processed_packets += 1;
            self.processed_bytes += desc.len as u64;

            let actions = match self.ring.as_mut().expect("ring exists").push_packet(packet) {
                Ok(actions) => actions,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            };
            self.apply_ring_actions(&actions);
        }
        self.check_bitrate_ready();
        self.check_start_policy();
    }

    fn apply_ring_actions(&mut self, actions: &[RingAction]) {
        for action in actions {
            match *action {
                RingAction::Enqueue { index } => self.enqueue_committed(index),
                RingAction::UnscheduleReader => {
                    trace!("buffer ring saturated, descheduling reader");
                    if let Some(reader) = &self.reader {
                        reader.unschedule();
                    }
                    self.unscheduled = true;
                }
            }
            if self.is_terminal() {
                return;
            }
        }
    }

    fn enqueue_committed(&mut self, index: usize) {
        let Some(ring) = self.ring.as_ref() else {
            return;
        };
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let (bytes, descs) = ring.committed(index);
        if let Err(e) = sink.enqueue(index, bytes, descs) {
            self.fail(e);
        }
    }

    fn handle_end_of_stream(&mut self) {
        info!("network end of stream");
        self.net_eof = true;

        if let Some(parser) = self.parser.as_mut() {
            match parser.finish() {
                Ok(events) => self.process_parser_events(events),
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
        if self.is_terminal() {
            return;
        }

        let Some(ring) = self.ring.as_mut() else {
            // stream ended before any audio was found
            self.fail(StreamError::AudioDataNotFound);
            return;
        };

        if ring.queued_len() > 0 {
            // trailing audio is still parked in the overflow FIFO; flush
            // once the drain completes
            self.eof_flush_pending = true;
            return;
        }
        self.flush_at_eof();
    }

    fn flush_at_eof(&mut self) {
        self.eof_flush_pending = false;
        if let Some(action) = self.ring.as_mut().and_then(|ring| ring.flush_pending()) {
            self.apply_ring_actions(&[action]);
        }
        if self.is_terminal() {
            return;
        }
        self.check_start_policy();
        if self.state == StreamState::WaitingForData
            && self.ring.as_ref().map(|r| r.buffers_used()).unwrap_or(0) == 0
        {
            // the stream ended and nothing playable ever materialized
            self.fail(StreamError::AudioDataNotFound);
            return;
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.flush() {
                self.fail(e);
                return;
            }
        }
        self.maybe_finish_eof();
    }

    // ---- sink path ----------------------------------------------------

    fn handle_sink(&mut self, event: SinkEvent) {
        match event {
            SinkEvent::BufferFree(index) => {
                let wants_drain = match self.ring.as_mut() {
                    Some(ring) => match ring.mark_free(index) {
                        Ok(wants_drain) => wants_drain,
                        Err(e) => {
                            self.fail(e);
                            return;
                        }
                    },
                    None => return,
                };
                if wants_drain {
                    // drain on the control loop, not in the callback path
                    let _ = self.events_tx.send(EngineEvent::DrainQueued {
                        generation: self.generation,
                    });
                }
                self.maybe_finish_eof();
            }
            SinkEvent::IsRunningChanged(running) => {
                debug!(running, "audio queue running state changed");
                self.sink_running = running;
                if running {
                    if self.state == StreamState::WaitingForQueueToStart {
                        self.set_state(StreamState::Playing);
                    }
                } else {
                    self.maybe_finish_eof();
                }
            }
        }
    }

    fn drain_overflow(&mut self) {
        let Some(ring) = self.ring.as_mut() else {
            return;
        };
        let result = match ring.drain_queued() {
            Ok(result) => result,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        self.apply_ring_actions(&result.actions);
        if self.is_terminal() {
            return;
        }
        if result.drained_all {
            if self.unscheduled {
                trace!("overflow drained, rescheduling reader");
                if let Some(reader) = &self.reader {
                    reader.schedule();
                }
                self.unscheduled = false;
                // skip exactly one timeout check so a long saturation does
                // not read as a dead connection
                self.rescheduled = true;
            }
            if self.eof_flush_pending {
                self.flush_at_eof();
                return;
            }
        }
        self.check_start_policy();
    }

    /// Start playback once enough buffers are filled, or at end of stream
    /// with whatever exists.
    fn check_start_policy(&mut self) {
        if self.state != StreamState::WaitingForData {
            return;
        }
        let Some(ring) = self.ring.as_ref() else {
            return;
        };
        if self.sink.is_none() {
            return;
        }
        let target = self.settings.effective_fill_count() as usize;
        let enough = ring.buffers_used() >= target || (self.net_eof && ring.buffers_used() > 0);
        if !enough {
            return;
        }
        info!(filled = ring.buffers_used(), needed = target, "starting audio queue");
        if let Err(e) = self.sink.as_mut().expect("sink exists").start() {
            self.fail(e);
            return;
        }
        self.set_state(StreamState::WaitingForQueueToStart);
    }

    fn maybe_finish_eof(&mut self) {
        if self.is_terminal() || !self.net_eof || self.sink_running {
            return;
        }
        let Some(ring) = self.ring.as_ref() else {
            return;
        };
        if ring.queued_len() == 0 && ring.buffers_used() == 0 && self.state != StreamState::WaitingForData
        {
            self.finish(DoneReason::Eof);
        }
    }

    // ---- commands -----------------------------------------------------

    fn pause(&mut self) {
        if self.state != StreamState::Playing {
            return;
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.pause() {
                self.fail(e);
                return;
            }
        }
        self.set_state(StreamState::Paused);
    }

    fn play(&mut self) {
        if self.state != StreamState::Paused {
            return;
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.resume() {
                self.fail(e);
                return;
            }
        }
        self.set_state(StreamState::Playing);
    }

    pub(crate) fn stop(&mut self) {
        if self.is_terminal() {
            return;
        }
        info!(url = %self.url, "stopping stream");
        self.teardown();
        self.done_reason = Some(DoneReason::Stopped);
        self.set_state(StreamState::Stopped);
    }

    fn set_volume(&mut self, volume: f32) {
        self.settings.set_volume(volume);
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.set_volume(volume) {
                warn!(error = %e, "volume not applied");
            }
        }
    }

    fn fade(&mut self, duration: f32, fade_in: bool) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let result = if fade_in {
            sink.fade_in(duration)
        } else {
            sink.fade_out(duration)
        };
        if let Err(e) = result {
            warn!(error = %e, "fade not applied");
        }
    }

    pub(crate) fn fade_tick(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.fade_tick(Instant::now()) {
                warn!(error = %e, "fade tick failed");
            }
        }
    }

    /// Reopen the stream at the byte offset for `time` seconds.
    ///
    /// Fails (returns false) until both the bitrate and the resource length
    /// are known.
    pub(crate) fn seek_to(&mut self, time: f64) -> bool {
        if self.is_terminal() || self.state == StreamState::Initialized {
            return false;
        }
        let Some(bit_rate) = self.calculated_bit_rate() else {
            debug!("seek rejected: bitrate unknown");
            return false;
        };
        let Some(file_length) = self.file_length else {
            debug!("seek rejected: file length unknown");
            return false;
        };

        let time = time.max(0.0);
        let byte_offset = self.data_offset + (time * bit_rate / 8.0).round() as u64;
        let byte_offset = byte_offset
            .min(file_length.saturating_sub(1))
            .max(self.data_offset);
        info!(time, byte_offset, "seeking via range reopen");

        // tear the pipeline down but keep everything learned about the
        // resource (headers, description, bitrate counters)
        self.next_generation();
        self.close_stages();

        self.seek_time = time;
        self.last_progress = Some(time);
        self.net_eof = false;
        self.eof_flush_pending = false;
        self.discontinuous = true;
        self.open_reader(byte_offset);
        self.set_state(StreamState::WaitingForData);
        true
    }

    // ---- timers -------------------------------------------------------

    /// One timeout interval elapsed. No network activity in a whole
    /// interval while unpaused and scheduled means the connection is dead.
    pub(crate) fn check_timeout(&mut self) {
        if self.is_terminal()
            || self.state == StreamState::Initialized
            || self.state == StreamState::Paused
        {
            return;
        }
        if self.unscheduled {
            // back-pressure, not a dead remote
            return;
        }
        if self.rescheduled {
            self.rescheduled = false;
            self.net_events = 0;
            return;
        }
        if self.net_events == 0 {
            warn!(interval = self.settings.timeout_interval, "network timed out");
            self.fail(StreamError::TimedOut);
            return;
        }
        self.net_events = 0;
    }

    /// Sample playback progress into the shared snapshot.
    pub(crate) fn update_progress(&mut self) {
        if self.state != StreamState::Playing {
            return;
        }
        let Some(sink) = self.sink.as_ref() else {
            return;
        };
        if let Some(time) = sink.current_time() {
            let candidate = self.seek_time + time;
            let progress = match self.last_progress {
                // progress never regresses
                Some(last) => last.max(candidate),
                None => candidate,
            };
            self.last_progress = Some(progress);
            self.shared.lock().unwrap().progress = Some(progress);
        }
    }

    // ---- derived values -----------------------------------------------

    /// Bits per second: the ICY header value when present, the exact CBR
    /// rate when the container has fixed-size packets, otherwise the
    /// average over observed packets once enough have been seen.
    fn calculated_bit_rate(&self) -> Option<f64> {
        if let Some(bit_rate) = self.icy_bitrate {
            return Some(bit_rate);
        }
        let description = self.description.as_ref()?;
        let frames_per_packet = f64::from(description.frames_per_packet.max(1));
        if let Some(bytes_per_packet) = description.bytes_per_packet {
            return Some(
                f64::from(bytes_per_packet) * 8.0 * f64::from(description.sample_rate)
                    / frames_per_packet,
            );
        }
        let threshold = self
            .total_audio_packets
            .map(|total| total.min(BITRATE_READY_PACKETS))
            .unwrap_or(BITRATE_READY_PACKETS)
            .max(1);
        if self.processed_packets < threshold {
            return None;
        }
        let average = self.processed_bytes as f64 / self.processed_packets as f64;
        Some(8.0 * average * f64::from(description.sample_rate) / frames_per_packet)
    }

    /// Seconds of audio in the whole resource.
    fn duration(&self) -> Option<f64> {
        let bit_rate = self.calculated_bit_rate()?;
        if bit_rate <= 0.0 {
            return None;
        }
        let byte_count = match self.audio_data_byte_count {
            Some(count) => count,
            None => self.file_length?.saturating_sub(self.data_offset),
        };
        Some(byte_count as f64 * 8.0 / bit_rate)
    }

    fn check_bitrate_ready(&mut self) {
        if self.bitrate_emitted || self.calculated_bit_rate().is_none() {
            return;
        }
        self.bitrate_emitted = true;
        info!(bit_rate = self.calculated_bit_rate(), "bitrate is ready");
        self.sync_shared();
        if let Some(delegate) = self.delegate.clone() {
            delegate.bitrate_is_ready(&self.status());
        }
    }

    // ---- plumbing -----------------------------------------------------

    fn open_reader(&mut self, byte_offset: u64) {
        self.next_generation();
        self.seek_byte_offset = byte_offset;
        self.net_events = 0;
        self.unscheduled = false;
        self.rescheduled = false;
        let reader = self
            .connector
            .open(&self.url, byte_offset, &self.proxy, self.net_events_sink());
        self.reader = Some(reader);
    }

    fn net_events_sink(&self) -> NetEventSink {
        let tx = self.events_tx.clone();
        let generation = self.generation;
        Box::new(move |event| {
            let _ = tx.send(EngineEvent::Net { generation, event });
        })
    }

    fn sink_events(&self) -> SinkEventSink {
        let tx = self.events_tx.clone();
        let generation = self.generation;
        Box::new(move |event| {
            let _ = tx.send(EngineEvent::Sink { generation, event });
        })
    }

    fn next_generation(&mut self) {
        self.generation += 1;
    }

    /// Close every pipeline stage, keeping learned facts intact.
    fn close_stages(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.close();
        }
        self.parser = None;
        self.demuxer = None;
        if let Some(mut ring) = self.ring.take() {
            ring.clear();
        }
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.stop() {
                debug!(error = %e, "audio queue stop during teardown");
            }
        }
        self.sink_running = false;
        self.unscheduled = false;
        self.rescheduled = false;
        {
            let mut shared = self.shared.lock().unwrap();
            shared.sink_created = false;
        }
    }

    fn teardown(&mut self) {
        self.next_generation();
        self.close_stages();
    }

    fn fail(&mut self, error: StreamError) {
        if self.failing {
            debug!(error = %error, "suppressing re-entrant failure");
            return;
        }
        if self.is_terminal() {
            debug!(error = %error, "ignoring failure after terminal state");
            return;
        }
        warn!(error = %error, url = %self.url, "stream failed");
        self.failing = true;
        self.teardown();
        self.error = Some(error.clone());
        self.done_reason = Some(DoneReason::Error(error));
        self.set_state(StreamState::Done);
        self.failing = false;
    }

    fn finish(&mut self, reason: DoneReason) {
        if self.is_terminal() {
            return;
        }
        info!(?reason, "stream finished");
        self.teardown();
        self.done_reason = Some(reason);
        self.set_state(StreamState::Done);
    }

    fn status(&self) -> StreamStatus {
        StreamStatus {
            state: self.state,
            done_reason: self.done_reason.clone(),
            error: self.error.clone(),
            current_song: self.current_song.clone(),
            progress: self.last_progress,
        }
    }

    fn set_state(&mut self, state: StreamState) {
        if self.state.is_terminal() {
            return;
        }
        trace!(from = ?self.state, to = ?state, "state transition");
        self.state = state;
        self.sync_shared();
        if let Some(delegate) = self.delegate.clone() {
            delegate.status_did_change(&self.status());
        }
    }

    fn sync_shared(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.state = Some(self.state);
        shared.done_reason = self.done_reason.clone();
        shared.error = self.error.clone();
        shared.http_headers = self.http_headers.clone();
        shared.current_song = self.current_song.clone();
        shared.description = self.description.clone();
        shared.bit_rate = self.calculated_bit_rate();
        shared.duration = self.duration();
        shared.progress = self.last_progress;
        shared.sink_created = self.sink.is_some();
        shared.file_length = self.file_length;
        shared.seekable = self.seekable;
    }
}
