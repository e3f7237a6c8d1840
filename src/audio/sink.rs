//! Playback sink seam and volume control.
//!
//! The platform audio output sits behind the [`AudioQueue`] trait: the
//! engine enqueues committed ring buffers and the queue plays them,
//! reporting freed buffers and running-state changes through a channel so
//! those callbacks land on the engine's control loop. [`PlaybackSink`]
//! wraps a queue with volume state and the linear fade ramp.

use crate::audio::parser::PacketDesc;
use crate::errors::StreamResult;
use crate::models::StreamDescription;
use std::time::Instant;
use tracing::debug;

/// Callbacks from the platform audio queue, marshaled onto the engine loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SinkEvent {
    /// Buffer `index` has been played and may be refilled
    BufferFree(usize),
    /// The queue started (true) or stopped (false) producing sound
    IsRunningChanged(bool),
}

/// Seam for the platform audio output queue.
pub trait AudioQueue: Send {
    /// Hand a filled buffer to the queue. `index` comes back later via
    /// [`SinkEvent::BufferFree`].
    fn enqueue(&mut self, index: usize, data: &[u8], descs: &[PacketDesc]) -> StreamResult<()>;

    fn start(&mut self) -> StreamResult<()>;
    fn pause(&mut self) -> StreamResult<()>;
    fn resume(&mut self) -> StreamResult<()>;

    /// No further buffers will be enqueued; play out what is queued, then
    /// report not-running.
    fn flush(&mut self) -> StreamResult<()>;

    /// Stop immediately, dropping queued audio.
    fn stop(&mut self) -> StreamResult<()>;

    fn set_volume(&mut self, volume: f32) -> StreamResult<()>;
    fn set_playback_rate(&mut self, rate: f32) -> StreamResult<()>;

    /// Seconds of audio played since [`AudioQueue::start`], when known.
    fn current_time(&self) -> Option<f64>;
}

/// Callback through which a queue delivers its events. The engine wires
/// this to its control loop, so queue-internal threads never touch engine
/// state directly.
pub type SinkEventSink = Box<dyn Fn(SinkEvent) + Send + Sync>;

/// Creates one [`AudioQueue`] per stream/reopen.
pub trait AudioQueueFactory: Send + Sync {
    fn create(
        &self,
        description: &StreamDescription,
        buffer_size: u32,
        buffer_count: u32,
        events: SinkEventSink,
    ) -> StreamResult<Box<dyn AudioQueue>>;
}

/// Linear volume ramp.
#[derive(Debug, Clone, Copy)]
struct Fade {
    from: f32,
    to: f32,
    started: Instant,
    duration: f32,
}

/// The engine-facing wrapper over the platform queue.
pub struct PlaybackSink {
    queue: Box<dyn AudioQueue>,
    volume: f32,
    fade: Option<Fade>,
}

impl PlaybackSink {
    pub fn new(queue: Box<dyn AudioQueue>, initial_volume: f32) -> Self {
        Self {
            queue,
            volume: initial_volume,
            fade: None,
        }
    }

    pub fn enqueue(&mut self, index: usize, data: &[u8], descs: &[PacketDesc]) -> StreamResult<()> {
        self.queue.enqueue(index, data, descs)
    }

    pub fn start(&mut self) -> StreamResult<()> {
        self.queue.set_volume(self.volume)?;
        self.queue.start()
    }

    pub fn pause(&mut self) -> StreamResult<()> {
        self.queue.pause()
    }

    pub fn resume(&mut self) -> StreamResult<()> {
        self.queue.resume()
    }

    pub fn flush(&mut self) -> StreamResult<()> {
        self.queue.flush()
    }

    pub fn stop(&mut self) -> StreamResult<()> {
        self.fade = None;
        self.queue.stop()
    }

    pub fn set_playback_rate(&mut self, rate: f32) -> StreamResult<()> {
        self.queue.set_playback_rate(rate)
    }

    pub fn set_volume(&mut self, volume: f32) -> StreamResult<()> {
        self.fade = None;
        self.volume = volume.clamp(0.0, 1.0);
        self.queue.set_volume(self.volume)
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn current_time(&self) -> Option<f64> {
        self.queue.current_time()
    }

    /// Ramp the volume 0 → 1 over `duration` seconds.
    pub fn fade_in(&mut self, duration: f32) -> StreamResult<()> {
        self.begin_fade(0.0, 1.0, duration)
    }

    /// Ramp the volume 1 → 0 over `duration` seconds.
    pub fn fade_out(&mut self, duration: f32) -> StreamResult<()> {
        self.begin_fade(1.0, 0.0, duration)
    }

    fn begin_fade(&mut self, from: f32, to: f32, duration: f32) -> StreamResult<()> {
        if duration <= 0.0 {
            self.volume = to;
            return self.queue.set_volume(to);
        }
        debug!(from, to, duration, "starting volume fade");
        self.queue.set_volume(from)?;
        self.volume = from;
        self.fade = Some(Fade {
            from,
            to,
            started: Instant::now(),
            duration,
        });
        Ok(())
    }

    pub fn is_fading(&self) -> bool {
        self.fade.is_some()
    }

    /// Advance the fade to `now`. Returns true while the fade is still
    /// running; call again on the next tick.
    pub fn fade_tick(&mut self, now: Instant) -> StreamResult<bool> {
        let Some(fade) = self.fade else {
            return Ok(false);
        };
        let elapsed = now.duration_since(fade.started).as_secs_f32();
        let t = (elapsed / fade.duration).min(1.0);
        self.volume = fade.from + (fade.to - fade.from) * t;
        self.queue.set_volume(self.volume)?;
        if t >= 1.0 {
            self.fade = None;
            return Ok(false);
        }
        Ok(true)
    }
}
