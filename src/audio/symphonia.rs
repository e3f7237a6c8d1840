//! Symphonia-backed container parser.
//!
//! Symphonia is a pull parser: a `FormatReader` reads from a `MediaSource`.
//! The engine pushes bytes instead, so [`SymphoniaStream`] bridges the two
//! with a growable shared buffer. Probing is deferred until enough bytes
//! are buffered for the prober to succeed in one attempt, and packets are
//! only pulled while a safety margin of unread bytes remains, so the
//! reader never starves mid-packet. A read past the buffered tail surfaces
//! `WouldBlock`, which simply means "feed more bytes".

use crate::audio::parser::{
    FileStream, FileStreamEvent, FileStreamFactory, PacketDesc, StreamProperty,
};
use crate::errors::{StreamError, StreamResult};
use crate::models::{FileType, StreamDescription};
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};
use symphonia::core::codecs::{CODEC_TYPE_AAC, CODEC_TYPE_MP3, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, trace};

/// Bytes to buffer before attempting a probe. Symphonia's probers scan for
/// sync patterns and container headers; starving them risks a false
/// negative that cannot be retried cheaply.
const PROBE_MIN_BYTES: usize = 32 * 1024;

/// Unread bytes that must remain ahead of the reader before another packet
/// is pulled. Larger than any MP3 frame (~2.9 KiB) or ADTS frame (8 KiB),
/// so a `next_packet` call never runs dry halfway through.
const PACKET_MARGIN: usize = 16 * 1024;

#[derive(Default)]
struct SharedBuffer {
    data: Vec<u8>,
    /// Absolute stream offset of `data[0]`
    base: u64,
    /// Absolute read position of the tail source
    read_pos: u64,
    /// Once the reader is established, consumed bytes can be discarded
    trim: bool,
    eof: bool,
}

impl SharedBuffer {
    fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    fn available_ahead(&self) -> usize {
        (self.end() - self.read_pos) as usize
    }

    fn discard_consumed(&mut self) {
        let consumed = (self.read_pos - self.base) as usize;
        if consumed > 0 {
            self.data.drain(..consumed);
            self.base = self.read_pos;
        }
    }
}

/// Forward-only `MediaSource` over the shared buffer.
struct TailSource {
    shared: Arc<Mutex<SharedBuffer>>,
}

impl Read for TailSource {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let mut shared = self.shared.lock().unwrap();
        let offset = (shared.read_pos - shared.base) as usize;
        let available = shared.data.len() - offset;
        if available == 0 {
            if shared.eof {
                return Ok(0);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "no buffered stream data",
            ));
        }
        let n = available.min(out.len());
        out[..n].copy_from_slice(&shared.data[offset..offset + n]);
        shared.read_pos += n as u64;
        if shared.trim {
            shared.discard_consumed();
        }
        Ok(n)
    }
}

impl Seek for TailSource {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let shared = self.shared.lock().unwrap();
        match pos {
            SeekFrom::Current(0) => Ok(shared.read_pos),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "stream source is forward-only",
            )),
        }
    }
}

impl MediaSource for TailSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Push-model parser over symphonia.
pub struct SymphoniaStream {
    shared: Arc<Mutex<SharedBuffer>>,
    reader: Option<Box<dyn FormatReader>>,
    track_id: u32,
    hint: FileType,
    /// ID3v2 tag length found at the head of the stream, if any
    id3_offset: Option<u64>,
    announced: bool,
    finished: bool,
    /// True until the first continuous byte arrives; a stream opened after
    /// a seek starts mid-resource, so head-of-file facts do not apply
    mid_stream: bool,
}

impl SymphoniaStream {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(SharedBuffer::default())),
            reader: None,
            track_id: 0,
            hint: FileType::Mp3,
            id3_offset: None,
            announced: false,
            finished: false,
            mid_stream: false,
        }
    }

    fn buffered(&self) -> usize {
        let shared = self.shared.lock().unwrap();
        shared.data.len()
    }

    fn try_probe(&mut self) -> StreamResult<Vec<FileStreamEvent>> {
        let is_eof = self.shared.lock().unwrap().eof;
        if self.buffered() < PROBE_MIN_BYTES && !is_eof {
            return Ok(Vec::new());
        }

        // rewind the tail to the buffer base; a failed probe may have
        // advanced it
        {
            let mut shared = self.shared.lock().unwrap();
            shared.read_pos = shared.base;
        }

        let source = TailSource {
            shared: self.shared.clone(),
        };
        let mss = MediaSourceStream::new(
            Box::new(source),
            MediaSourceStreamOptions {
                buffer_len: 256 * 1024,
            },
        );
        let mut hint = Hint::new();
        hint.with_extension(self.hint.hint_extension());

        let probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        );
        let probed = match probed {
            Ok(probed) => probed,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock && !is_eof =>
            {
                // not enough data yet; retry on a later feed
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(StreamError::FileStreamOpenFailed(e.to_string()));
            }
        };

        let format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
            .ok_or(StreamError::AudioDataNotFound)?;
        self.track_id = track.id;

        let params = &track.codec_params;
        let codec = params.codec;
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| StreamError::FileStreamGetPropertyFailed("sample rate".to_string()))?;
        let channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);
        let file_type = match codec {
            c if c == CODEC_TYPE_MP3 => FileType::Mp3,
            c if c == CODEC_TYPE_AAC => FileType::Aac,
            _ => self.hint,
        };
        // PCM follows the 1-frame-per-packet convention with a fixed byte
        // size; framed codecs carry a codec-defined frame count and vary in
        // byte size
        let (frames_per_packet, bytes_per_packet) = if file_type.is_pcm() {
            let frame_bytes = u32::from(channels) * params.bits_per_sample.unwrap_or(16).div_ceil(8);
            (1, Some(frame_bytes))
        } else {
            let frames = params
                .max_frames_per_packet
                .map(|f| f as u32)
                .unwrap_or(match file_type {
                    FileType::Mp3 => 1152,
                    FileType::Aac => 1024,
                    _ => 1024,
                });
            (frames, None)
        };
        let description = StreamDescription {
            file_type,
            sample_rate,
            channels,
            frames_per_packet,
            bytes_per_packet,
        };
        debug!(?description, "container probed");

        let mut events = vec![FileStreamEvent::Property(StreamProperty::DataFormat(
            description,
        ))];
        if let Some(offset) = self.id3_offset.filter(|_| !self.mid_stream) {
            events.push(FileStreamEvent::Property(StreamProperty::DataOffset(
                offset,
            )));
        }
        if let Some(n_frames) = params.n_frames {
            let packets = n_frames.div_ceil(u64::from(frames_per_packet.max(1)));
            events.push(FileStreamEvent::Property(
                StreamProperty::AudioDataPacketCount(packets),
            ));
        }
        if let Some(size) = bytes_per_packet {
            events.push(FileStreamEvent::Property(StreamProperty::MaximumPacketSize(
                size,
            )));
        }
        if !self.announced {
            self.announced = true;
            events.push(FileStreamEvent::Property(
                StreamProperty::ReadyToProducePackets,
            ));
        }

        // from here on the tail is read exactly once; consumed bytes can go
        self.shared.lock().unwrap().trim = true;
        self.reader = Some(format);
        Ok(events)
    }

    fn pull_packets(&mut self) -> StreamResult<Vec<FileStreamEvent>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Vec::new());
        };
        if self.finished {
            return Ok(Vec::new());
        }

        let mut data = Vec::new();
        let mut descs = Vec::new();
        loop {
            {
                let shared = self.shared.lock().unwrap();
                if shared.available_ahead() < PACKET_MARGIN && !shared.eof {
                    break;
                }
            }
            match reader.next_packet() {
                Ok(packet) => {
                    if packet.track_id() != self.track_id {
                        continue;
                    }
                    trace!(len = packet.data.len(), "parsed audio packet");
                    descs.push(PacketDesc {
                        offset: data.len(),
                        len: packet.data.len(),
                    });
                    data.extend_from_slice(&packet.data);
                }
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    break;
                }
                Err(SymphoniaError::IoError(_)) => {
                    // end of the buffered stream
                    self.finished = true;
                    break;
                }
                Err(SymphoniaError::ResetRequired) => continue,
                Err(e) => {
                    return Err(StreamError::FileStreamParseBytesFailed(e.to_string()));
                }
            }
        }

        if descs.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![FileStreamEvent::Packets { data, descs }])
    }

    fn pump(&mut self) -> StreamResult<Vec<FileStreamEvent>> {
        let mut events = Vec::new();
        if self.reader.is_none() {
            events.extend(self.try_probe()?);
        }
        events.extend(self.pull_packets()?);
        Ok(events)
    }
}

impl Default for SymphoniaStream {
    fn default() -> Self {
        Self::new()
    }
}

impl FileStream for SymphoniaStream {
    fn open(&mut self, hint: FileType) -> StreamResult<()> {
        self.hint = hint;
        Ok(())
    }

    fn feed(&mut self, bytes: &[u8], discontinuous: bool) -> StreamResult<Vec<FileStreamEvent>> {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.data.is_empty() && shared.base == 0 && self.reader.is_none() {
                // head of stream: note the ID3v2 tag length for seek math
                self.mid_stream = discontinuous;
                if !discontinuous {
                    self.id3_offset = id3v2_length(bytes);
                }
            }
            shared.data.extend_from_slice(bytes);
        }
        self.pump()
    }

    fn finish(&mut self) -> StreamResult<Vec<FileStreamEvent>> {
        self.shared.lock().unwrap().eof = true;
        self.pump()
    }
}

/// Total byte length of an ID3v2 tag at the head of `bytes`, if present.
fn id3v2_length(bytes: &[u8]) -> Option<u64> {
    if bytes.len() < 10 || &bytes[..3] != b"ID3" {
        return None;
    }
    let flags = bytes[5];
    let size = (u64::from(bytes[6] & 0x7f) << 21)
        | (u64::from(bytes[7] & 0x7f) << 14)
        | (u64::from(bytes[8] & 0x7f) << 7)
        | u64::from(bytes[9] & 0x7f);
    let footer = if flags & 0x10 != 0 { 10 } else { 0 };
    Some(10 + size + footer)
}

/// Factory handed to the engine; one fresh parser per stream/reopen.
#[derive(Debug, Default)]
pub struct SymphoniaFactory;

impl FileStreamFactory for SymphoniaFactory {
    fn create(&self) -> Box<dyn FileStream> {
        Box::new(SymphoniaStream::new())
    }
}
