//! Incremental container parsing.
//!
//! The actual container/codec parsing is delegated to a platform parser
//! behind the [`FileStream`] trait: bytes are pushed in, and the parser
//! answers with property events while it learns about the container,
//! followed by batches of complete audio packets. [`PacketParser`] wraps a
//! [`FileStream`] and keeps the derived facts the engine needs for seeking
//! and duration math (data offset, audio byte count, packet sizes, VBR).
//!
//! The production implementation is [`crate::audio::SymphoniaStream`].

use crate::errors::{StreamError, StreamResult};
use crate::models::{FileType, StreamDescription};

/// Location of one packet inside a [`FileStreamEvent::Packets`] batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDesc {
    pub offset: usize,
    pub len: usize,
}

/// Container facts reported by the platform parser, in discovery order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamProperty {
    DataFormat(StreamDescription),
    /// Byte offset of the first audio data in the resource
    DataOffset(u64),
    /// Bytes of audio data in the resource, when the container declares it
    AudioDataByteCount(u64),
    /// Total audio packets in the resource, when known
    AudioDataPacketCount(u64),
    /// Upper bound on a single packet's byte size
    MaximumPacketSize(u32),
    /// All properties are known; packets follow
    ReadyToProducePackets,
}

/// Output of one [`FileStream::feed`] call.
#[derive(Debug)]
pub enum FileStreamEvent {
    Property(StreamProperty),
    Packets {
        data: Vec<u8>,
        descs: Vec<PacketDesc>,
    },
}

/// Seam for the platform audio-file-stream library.
///
/// Implementations parse pushed bytes incrementally and never block waiting
/// for more input: when a packet is incomplete they buffer and return.
pub trait FileStream: Send {
    /// Prepare for parsing. `hint` is the expected container family.
    fn open(&mut self, hint: FileType) -> StreamResult<()>;

    /// Push bytes. `discontinuous` marks data that does not continue the
    /// previously fed bytes (after a seek); the parser must resynchronize
    /// instead of assuming packet continuity.
    fn feed(&mut self, bytes: &[u8], discontinuous: bool) -> StreamResult<Vec<FileStreamEvent>>;

    /// No further bytes will arrive; flush any complete trailing packets.
    fn finish(&mut self) -> StreamResult<Vec<FileStreamEvent>>;
}

/// Creates one [`FileStream`] per stream/reopen.
pub trait FileStreamFactory: Send + Sync {
    fn create(&self) -> Box<dyn FileStream>;
}

/// Events surfaced to the engine.
#[derive(Debug)]
pub enum ParserEvent {
    /// Properties are complete; `description()` is now available
    Ready,
    Packets {
        data: Vec<u8>,
        descs: Vec<PacketDesc>,
    },
}

/// Wraps a [`FileStream`] and tracks the derived per-stream facts.
pub struct PacketParser {
    stream: Box<dyn FileStream>,
    ready: bool,
    description: Option<StreamDescription>,
    data_offset: u64,
    audio_data_byte_count: Option<u64>,
    total_audio_packets: Option<u64>,
    max_packet_size: Option<u32>,
}

impl PacketParser {
    pub fn new(stream: Box<dyn FileStream>) -> Self {
        Self {
            stream,
            ready: false,
            description: None,
            data_offset: 0,
            audio_data_byte_count: None,
            total_audio_packets: None,
            max_packet_size: None,
        }
    }

    pub fn open(&mut self, hint: FileType) -> StreamResult<()> {
        self.stream.open(hint)
    }

    /// Push bytes through the parser, absorbing property events and
    /// translating packet batches.
    pub fn feed(&mut self, bytes: &[u8], discontinuous: bool) -> StreamResult<Vec<ParserEvent>> {
        let events = self.stream.feed(bytes, discontinuous)?;
        Ok(self.absorb(events))
    }

    /// Signal end of input and collect trailing packets.
    pub fn finish(&mut self) -> StreamResult<Vec<ParserEvent>> {
        let events = self.stream.finish()?;
        Ok(self.absorb(events))
    }

    fn absorb(&mut self, events: Vec<FileStreamEvent>) -> Vec<ParserEvent> {
        let mut out = Vec::new();
        for event in events {
            match event {
                FileStreamEvent::Property(prop) => {
                    match prop {
                        StreamProperty::DataFormat(desc) => self.description = Some(desc),
                        StreamProperty::DataOffset(offset) => self.data_offset = offset,
                        StreamProperty::AudioDataByteCount(count) => {
                            self.audio_data_byte_count = Some(count)
                        }
                        StreamProperty::AudioDataPacketCount(count) => {
                            self.total_audio_packets = Some(count)
                        }
                        StreamProperty::MaximumPacketSize(size) => {
                            self.max_packet_size = Some(size)
                        }
                        StreamProperty::ReadyToProducePackets => {
                            if !self.ready {
                                self.ready = true;
                                out.push(ParserEvent::Ready);
                            }
                        }
                    }
                }
                FileStreamEvent::Packets { data, descs } => {
                    // a parser that skips the explicit ready marker still
                    // counts as ready once packets appear
                    if !self.ready {
                        self.ready = true;
                        out.push(ParserEvent::Ready);
                    }
                    out.push(ParserEvent::Packets { data, descs });
                }
            }
        }
        out
    }

    /// True once all container properties have been read.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn description(&self) -> Option<&StreamDescription> {
        self.description.as_ref()
    }

    /// Byte offset of the first audio data within the resource.
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn audio_data_byte_count(&self) -> Option<u64> {
        self.audio_data_byte_count
    }

    pub fn total_audio_packets(&self) -> Option<u64> {
        self.total_audio_packets
    }

    /// Variable-bitrate streams have no fixed bytes-per-packet.
    pub fn is_vbr(&self) -> bool {
        self.description
            .as_ref()
            .map(|d| d.bytes_per_packet.is_none())
            .unwrap_or(false)
    }

    /// Byte size to allocate per ring buffer: the parser's packet upper
    /// bound when it reported one, otherwise the configured fallback.
    pub fn packet_buffer_size(&self, fallback: u32) -> u32 {
        match self.max_packet_size {
            Some(size) if size > 0 => size.max(fallback),
            _ => fallback,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Scripted parser: hands back pre-arranged event batches per feed.
    pub struct ScriptedFileStream {
        pub batches: Arc<Mutex<VecDeque<Vec<FileStreamEvent>>>>,
        pub fail_open: bool,
        pub fed: Arc<Mutex<Vec<(Vec<u8>, bool)>>>,
    }

    impl ScriptedFileStream {
        pub fn new(batches: Vec<Vec<FileStreamEvent>>) -> Self {
            Self {
                batches: Arc::new(Mutex::new(batches.into())),
                fail_open: false,
                fed: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl FileStream for ScriptedFileStream {
        fn open(&mut self, _hint: FileType) -> StreamResult<()> {
            if self.fail_open {
                return Err(StreamError::FileStreamOpenFailed("scripted".to_string()));
            }
            Ok(())
        }

        fn feed(
            &mut self,
            bytes: &[u8],
            discontinuous: bool,
        ) -> StreamResult<Vec<FileStreamEvent>> {
            self.fed
                .lock()
                .unwrap()
                .push((bytes.to_vec(), discontinuous));
            Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
        }

        fn finish(&mut self) -> StreamResult<Vec<FileStreamEvent>> {
            Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    pub fn mp3_description() -> StreamDescription {
        StreamDescription {
            file_type: FileType::Mp3,
            sample_rate: 44_100,
            channels: 2,
            frames_per_packet: 1152,
            bytes_per_packet: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_properties_absorbed_before_ready() {
        let stream = ScriptedFileStream::new(vec![vec![
            FileStreamEvent::Property(StreamProperty::DataFormat(mp3_description())),
            FileStreamEvent::Property(StreamProperty::DataOffset(417)),
            FileStreamEvent::Property(StreamProperty::AudioDataByteCount(1_000_000)),
            FileStreamEvent::Property(StreamProperty::MaximumPacketSize(1045)),
            FileStreamEvent::Property(StreamProperty::ReadyToProducePackets),
        ]]);
        let mut parser = PacketParser::new(Box::new(stream));
        parser.open(FileType::Mp3).unwrap();

        let events = parser.feed(&[0u8; 128], false).unwrap();
        assert!(matches!(events.as_slice(), [ParserEvent::Ready]));
        assert!(parser.is_ready());
        assert_eq!(parser.data_offset(), 417);
        assert_eq!(parser.audio_data_byte_count(), Some(1_000_000));
        assert_eq!(parser.packet_buffer_size(4096), 4096);
        assert_eq!(parser.packet_buffer_size(512), 1045);
        assert!(parser.is_vbr());
    }

    #[test]
    fn test_ready_implied_by_first_packets() {
        let stream = ScriptedFileStream::new(vec![vec![FileStreamEvent::Packets {
            data: vec![1, 2, 3, 4],
            descs: vec![PacketDesc { offset: 0, len: 4 }],
        }]]);
        let mut parser = PacketParser::new(Box::new(stream));
        parser.open(FileType::Mp3).unwrap();

        let events = parser.feed(&[0u8; 4], false).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ParserEvent::Ready));
        assert!(matches!(events[1], ParserEvent::Packets { .. }));
    }

    #[test]
    fn test_ready_emitted_once() {
        let stream = ScriptedFileStream::new(vec![
            vec![FileStreamEvent::Property(
                StreamProperty::ReadyToProducePackets,
            )],
            vec![FileStreamEvent::Property(
                StreamProperty::ReadyToProducePackets,
            )],
        ]);
        let mut parser = PacketParser::new(Box::new(stream));
        parser.open(FileType::Mp3).unwrap();

        assert_eq!(parser.feed(&[0u8; 1], false).unwrap().len(), 1);
        assert!(parser.feed(&[0u8; 1], false).unwrap().is_empty());
    }

    #[test]
    fn test_discontinuous_flag_forwarded() {
        let stream = ScriptedFileStream::new(vec![]);
        let fed = stream.fed.clone();
        let mut parser = PacketParser::new(Box::new(stream));
        parser.open(FileType::Mp3).unwrap();

        parser.feed(&[9u8; 3], true).unwrap();
        let log = fed.lock().unwrap();
        assert_eq!(log[0], (vec![9u8; 3], true));
    }

    #[test]
    fn test_open_failure_propagates() {
        let mut stream = ScriptedFileStream::new(vec![]);
        stream.fail_open = true;
        let mut parser = PacketParser::new(Box::new(stream));
        assert!(matches!(
            parser.open(FileType::Mp3),
            Err(StreamError::FileStreamOpenFailed(_))
        ));
    }
}
