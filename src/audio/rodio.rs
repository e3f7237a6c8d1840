//! Rodio-backed playback queue.
//!
//! rodio decodes a whole `Read + Seek` stream rather than discrete packets,
//! so the adapter feeds enqueued buffers through a byte pipe into a
//! `rodio::Decoder` running on a dedicated audio thread (rodio's
//! `OutputStream` is not `Send`). A small poll loop watches the decoder's
//! consumption offset and
//! reports buffers as free once their bytes have been read, and watches the
//! sink to report running-state changes. Both reports go through the event
//! channel so they land on the engine's control loop.

use crate::audio::parser::PacketDesc;
use crate::audio::sink::{AudioQueue, AudioQueueFactory, SinkEvent, SinkEventSink};
use crate::errors::{StreamError, StreamResult};
use crate::models::StreamDescription;
use rodio::{Decoder, OutputStream, Sink};
use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Decoded-side history kept for backward seeks during format probing.
const SEEK_WINDOW: usize = 256 * 1024;
/// Trim threshold for the retained pipe data.
const TRIM_AT: usize = 1024 * 1024;

struct PipeState {
    /// Retained bytes starting at absolute offset `base`
    data: Vec<u8>,
    base: u64,
    /// Absolute read position of the decoder
    read_pos: u64,
    /// Total bytes ever written
    written: u64,
    /// No further writes; reads drain and then return EOF
    closed: bool,
    /// Abandon everything immediately
    aborted: bool,
}

/// Blocking byte pipe between `enqueue` and the decoder thread.
struct PipeReader {
    shared: Arc<(Mutex<PipeState>, Condvar)>,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock().unwrap();
        loop {
            if state.aborted {
                return Ok(0);
            }
            let offset = (state.read_pos - state.base) as usize;
            if offset < state.data.len() {
                let n = (state.data.len() - offset).min(out.len());
                out[..n].copy_from_slice(&state.data[offset..offset + n]);
                state.read_pos += n as u64;
                // keep a window for probe-time backward seeks, drop the rest
                let consumed = (state.read_pos - state.base) as usize;
                if consumed > TRIM_AT {
                    let cut = consumed - SEEK_WINDOW;
                    state.data.drain(..cut);
                    state.base += cut as u64;
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            state = cvar.wait(state).unwrap();
        }
    }
}

impl Seek for PipeReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let (lock, _) = &*self.shared;
        let mut state = lock.lock().unwrap();
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => state.read_pos as i64 + delta,
            SeekFrom::End(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "stream length unknown",
                ))
            }
        };
        if target < state.base as i64 || target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before retained window",
            ));
        }
        state.read_pos = target as u64;
        Ok(state.read_pos)
    }
}

/// Playback queue on top of a rodio sink.
pub struct RodioQueue {
    pipe: Arc<(Mutex<PipeState>, Condvar)>,
    sink: Arc<Sink>,
    /// (buffer index, absolute end offset) in enqueue order
    pending: Arc<Mutex<VecDeque<(usize, u64)>>>,
    shutdown: Arc<AtomicBool>,
}

impl RodioQueue {
    fn create(events: SinkEventSink) -> StreamResult<Self> {
        let pipe = Arc::new((
            Mutex::new(PipeState {
                data: Vec::new(),
                base: 0,
                read_pos: 0,
                written: 0,
                closed: false,
                aborted: false,
            }),
            Condvar::new(),
        ));
        let pending: Arc<Mutex<VecDeque<(usize, u64)>>> = Arc::new(Mutex::new(VecDeque::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        // rodio's OutputStream is not Send: everything device-related
        // lives on this thread
        let (sink_tx, sink_rx) = std::sync::mpsc::channel();
        let reader = PipeReader {
            shared: pipe.clone(),
        };
        std::thread::Builder::new()
            .name("audiopipe-output".to_string())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(out) => out,
                    Err(e) => {
                        let _ = sink_tx.send(Err(format!("audio device: {}", e)));
                        return;
                    }
                };
                let sink = match Sink::try_new(&handle) {
                    Ok(sink) => Arc::new(sink),
                    Err(e) => {
                        let _ = sink_tx.send(Err(format!("sink: {}", e)));
                        return;
                    }
                };
                // hold playback until start() is called
                sink.pause();
                if sink_tx.send(Ok(sink.clone())).is_err() {
                    return;
                }
                // blocks until enough bytes arrive to probe the container
                match Decoder::new(reader) {
                    Ok(decoder) => {
                        sink.append(decoder);
                        sink.sleep_until_end();
                        debug!("audio output drained");
                    }
                    Err(e) => {
                        warn!(error = %e, "audio decoder failed to open");
                    }
                }
                // _stream kept alive until playback finished
            })
            .map_err(|e| StreamError::AudioQueueCreationFailed(e.to_string()))?;

        let sink = sink_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| {
                StreamError::AudioQueueCreationFailed("audio thread did not start".to_string())
            })?
            .map_err(StreamError::AudioQueueCreationFailed)?;

        let queue = Self {
            pipe,
            sink,
            pending,
            shutdown,
        };
        queue.spawn_monitor(events);
        Ok(queue)
    }

    /// Watch decoder consumption and sink state, reporting both as events.
    fn spawn_monitor(&self, events: SinkEventSink) {
        let pipe = self.pipe.clone();
        let pending = self.pending.clone();
        let sink = self.sink.clone();
        let shutdown = self.shutdown.clone();
        std::thread::Builder::new()
            .name("audiopipe-monitor".to_string())
            .spawn(move || {
                let mut last_running = false;
                loop {
                    if shutdown.load(Ordering::Acquire) {
                        return;
                    }

                    let read_pos = {
                        let (lock, _) = &*pipe;
                        lock.lock().unwrap().read_pos
                    };
                    {
                        let mut pending = pending.lock().unwrap();
                        while pending
                            .front()
                            .map(|&(_, end)| end <= read_pos)
                            .unwrap_or(false)
                        {
                            let (index, _) = pending.pop_front().unwrap();
                            events(SinkEvent::BufferFree(index));
                        }
                    }

                    let running = !sink.is_paused() && !sink.empty();
                    if running != last_running {
                        last_running = running;
                        events(SinkEvent::IsRunningChanged(running));
                    }

                    std::thread::sleep(Duration::from_millis(50));
                }
            })
            .ok();
    }
}

impl AudioQueue for RodioQueue {
    fn enqueue(&mut self, index: usize, data: &[u8], _descs: &[PacketDesc]) -> StreamResult<()> {
        let (lock, cvar) = &*self.pipe;
        let mut state = lock.lock().unwrap();
        if state.closed || state.aborted {
            return Err(StreamError::AudioQueueEnqueueFailed(
                "queue is shut down".to_string(),
            ));
        }
        state.data.extend_from_slice(data);
        state.written += data.len() as u64;
        self.pending.lock().unwrap().push_back((index, state.written));
        cvar.notify_all();
        Ok(())
    }

    fn start(&mut self) -> StreamResult<()> {
        self.sink.play();
        Ok(())
    }

    fn pause(&mut self) -> StreamResult<()> {
        self.sink.pause();
        Ok(())
    }

    fn resume(&mut self) -> StreamResult<()> {
        self.sink.play();
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        let (lock, cvar) = &*self.pipe;
        lock.lock().unwrap().closed = true;
        cvar.notify_all();
        Ok(())
    }

    fn stop(&mut self) -> StreamResult<()> {
        self.shutdown.store(true, Ordering::Release);
        {
            let (lock, cvar) = &*self.pipe;
            let mut state = lock.lock().unwrap();
            state.aborted = true;
            cvar.notify_all();
        }
        self.sink.stop();
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> StreamResult<()> {
        self.sink.set_volume(volume);
        Ok(())
    }

    fn set_playback_rate(&mut self, rate: f32) -> StreamResult<()> {
        self.sink.set_speed(rate);
        Ok(())
    }

    fn current_time(&self) -> Option<f64> {
        Some(self.sink.get_pos().as_secs_f64())
    }
}

impl Drop for RodioQueue {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Production queue factory.
#[derive(Debug, Default)]
pub struct RodioFactory;

impl AudioQueueFactory for RodioFactory {
    fn create(
        &self,
        description: &StreamDescription,
        _buffer_size: u32,
        _buffer_count: u32,
        events: SinkEventSink,
    ) -> StreamResult<Box<dyn AudioQueue>> {
        debug!(?description, "creating rodio output queue");
        Ok(Box::new(RodioQueue::create(events)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (Arc<(Mutex<PipeState>, Condvar)>, PipeReader) {
        let shared = Arc::new((
            Mutex::new(PipeState {
                data: Vec::new(),
                base: 0,
                read_pos: 0,
                written: 0,
                closed: false,
                aborted: false,
            }),
            Condvar::new(),
        ));
        let reader = PipeReader {
            shared: shared.clone(),
        };
        (shared, reader)
    }

    fn write(pipe: &Arc<(Mutex<PipeState>, Condvar)>, bytes: &[u8]) {
        let (lock, cvar) = &**pipe;
        let mut state = lock.lock().unwrap();
        state.data.extend_from_slice(bytes);
        state.written += bytes.len() as u64;
        cvar.notify_all();
    }

    #[test]
    fn test_pipe_read_and_eof() {
        let (pipe, mut reader) = pipe_pair();
        write(&pipe, b"hello world");

        let mut buf = [0u8; 5];
        assert_eq!(reader.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        {
            let (lock, cvar) = &*pipe;
            lock.lock().unwrap().closed = true;
            cvar.notify_all();
        }
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b" world");
    }

    #[test]
    fn test_pipe_blocking_read() {
        let (pipe, mut reader) = pipe_pair();
        let writer = pipe.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            write(&writer, b"late");
        });

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"late");
    }

    #[test]
    fn test_pipe_seek_within_window() {
        let (pipe, mut reader) = pipe_pair();
        write(&pipe, b"0123456789");

        let mut buf = [0u8; 4];
        reader.read(&mut buf).unwrap();
        assert_eq!(&buf, b"0123");

        reader.seek(SeekFrom::Start(2)).unwrap();
        reader.read(&mut buf).unwrap();
        assert_eq!(&buf, b"2345");

        assert!(reader.seek(SeekFrom::End(0)).is_err());
    }

    #[test]
    fn test_pipe_abort_unblocks() {
        let (pipe, mut reader) = pipe_pair();
        let aborter = pipe.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let (lock, cvar) = &*aborter;
            lock.lock().unwrap().aborted = true;
            cvar.notify_all();
        });

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }
}
