//! ICY/Shoutcast metadata demuxing.
//!
//! ICY streams interleave textual metadata into the audio byte stream: after
//! every `icy-metaint` audio bytes the server inserts one length byte `L`
//! followed by `16 * L` bytes of `Key='Value';` pairs (null padded). The
//! [`IcyDemuxer`] strips those blocks out and publishes the `StreamTitle`
//! field as the current song.
//!
//! Old Shoutcast servers answer with a raw `ICY 200 OK` reply instead of
//! HTTP; the demuxer also consumes that in-body header block (`key:value`
//! lines up to a blank line) before treating the remainder as audio.

use std::collections::HashMap;
use tracing::{debug, warn};

/// One parsed metadata block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IcyMetadata {
    /// `StreamTitle='…'`, the publishable current-song field
    pub title: Option<String>,
    /// `StreamUrl='…'`
    pub url: Option<String>,
}

#[derive(Debug, PartialEq)]
enum IcyState {
    /// Pass bytes through untouched (not an ICY stream)
    Transparent,
    /// First bytes may be a raw `ICY 200 OK` reply; sniff for the magic
    Sniffing,
    /// Consuming in-body `key:value` header lines up to the blank line
    InlineHeaders,
    /// Counting audio bytes toward the next metadata block
    Audio,
    /// Consuming the current metadata block
    Metadata,
}

/// Incremental ICY demultiplexer.
///
/// Feed raw network bytes in; audio bytes come out with metadata blocks
/// removed. Blocks may be split across any number of feeds.
#[derive(Debug)]
pub struct IcyDemuxer {
    state: IcyState,
    /// Bytes between metadata blocks; 0 means metadata never appears
    meta_interval: usize,
    /// Audio bytes read since the last metadata block
    data_bytes_read: usize,
    /// Bytes left in the metadata block currently being read
    meta_bytes_remaining: usize,
    /// Accumulator for a metadata block split across feeds
    metadata: Vec<u8>,
    /// Accumulator for sniffing / in-body header lines
    header_buf: Vec<u8>,
    /// Headers parsed from a raw ICY reply (lower-cased keys)
    inline_headers: HashMap<String, String>,
    /// Bitrate in bits per second, from `icy-br`
    bitrate: Option<f64>,
    is_icy: bool,
}

/// Raw ICY replies start with this magic instead of `HTTP/1.x`.
const ICY_MAGIC: &[u8] = b"ICY";

impl IcyDemuxer {
    /// A demuxer that passes everything through (non-ICY stream).
    pub fn transparent() -> Self {
        Self::new(IcyState::Transparent, 0)
    }

    /// A demuxer for a stream with a known metadata interval.
    pub fn with_interval(meta_interval: usize) -> Self {
        let state = if meta_interval > 0 {
            IcyState::Audio
        } else {
            IcyState::Transparent
        };
        let mut demuxer = Self::new(state, meta_interval);
        demuxer.is_icy = true;
        demuxer
    }

    /// A demuxer that sniffs the body for a raw `ICY 200 OK` reply before
    /// deciding whether the stream carries inline headers and metadata.
    pub fn sniffing() -> Self {
        Self::new(IcyState::Sniffing, 0)
    }

    /// Pick the right demuxer for a response: `icy-metaint` in the HTTP
    /// headers wins; with no usable content type the body is sniffed for a
    /// raw ICY reply; anything else is passed through.
    pub fn for_response(headers: &HashMap<String, String>) -> Self {
        let mut demuxer = if let Some(interval) = headers
            .get("icy-metaint")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            Self::with_interval(interval)
        } else if headers.contains_key("content-type") || headers.contains_key("icy-name") {
            Self::transparent()
        } else {
            Self::sniffing()
        };
        if let Some(br) = headers.get("icy-br") {
            demuxer.set_bitrate_kbps(br);
        }
        demuxer
    }

    fn new(state: IcyState, meta_interval: usize) -> Self {
        Self {
            state,
            meta_interval,
            data_bytes_read: 0,
            meta_bytes_remaining: 0,
            metadata: Vec::new(),
            header_buf: Vec::new(),
            inline_headers: HashMap::new(),
            bitrate: None,
            is_icy: false,
        }
    }

    pub fn is_icy(&self) -> bool {
        self.is_icy
    }

    pub fn meta_interval(&self) -> usize {
        self.meta_interval
    }

    /// Bitrate in bits per second, when the stream advertised one.
    pub fn bitrate(&self) -> Option<f64> {
        self.bitrate
    }

    /// Headers recovered from a raw in-body ICY reply (lower-cased keys).
    pub fn inline_headers(&self) -> &HashMap<String, String> {
        &self.inline_headers
    }

    /// Demultiplex `input`: audio bytes are appended to `audio_out`, and
    /// every completed metadata block is returned in order.
    pub fn feed(&mut self, input: &[u8], audio_out: &mut Vec<u8>) -> Vec<IcyMetadata> {
        let mut updates = Vec::new();
        let mut pos = 0;

        while pos < input.len() {
            match self.state {
                IcyState::Transparent => {
                    audio_out.extend_from_slice(&input[pos..]);
                    return updates;
                }
                IcyState::Sniffing => {
                    self.header_buf.extend_from_slice(&input[pos..]);
                    pos = input.len();
                    self.resolve_sniff(audio_out, &mut updates);
                }
                IcyState::InlineHeaders => {
                    self.header_buf.extend_from_slice(&input[pos..]);
                    pos = input.len();
                    self.consume_inline_headers(audio_out, &mut updates);
                }
                IcyState::Audio => {
                    if self.data_bytes_read == self.meta_interval {
                        // length byte: number of 16-byte metadata chunks
                        let len = input[pos] as usize * 16;
                        pos += 1;
                        self.data_bytes_read = 0;
                        if len > 0 {
                            self.meta_bytes_remaining = len;
                            self.state = IcyState::Metadata;
                        }
                        continue;
                    }
                    let run = (input.len() - pos).min(self.meta_interval - self.data_bytes_read);
                    audio_out.extend_from_slice(&input[pos..pos + run]);
                    self.data_bytes_read += run;
                    pos += run;
                }
                IcyState::Metadata => {
                    let run = (input.len() - pos).min(self.meta_bytes_remaining);
                    self.metadata.extend_from_slice(&input[pos..pos + run]);
                    self.meta_bytes_remaining -= run;
                    pos += run;
                    if self.meta_bytes_remaining == 0 {
                        if let Some(update) = self.finish_metadata_block() {
                            updates.push(update);
                        }
                        self.state = IcyState::Audio;
                    }
                }
            }
        }

        updates
    }

    /// Decide whether the buffered body start is a raw ICY reply.
    fn resolve_sniff(&mut self, audio_out: &mut Vec<u8>, updates: &mut Vec<IcyMetadata>) {
        if self.header_buf.len() < ICY_MAGIC.len() {
            return; // need more bytes
        }
        if self.header_buf.starts_with(ICY_MAGIC) {
            debug!("raw ICY reply detected, parsing in-body headers");
            self.is_icy = true;
            self.state = IcyState::InlineHeaders;
            self.consume_inline_headers(audio_out, updates);
        } else {
            // ordinary body: flush what we held back and go transparent
            audio_out.append(&mut self.header_buf);
            self.state = IcyState::Transparent;
        }
    }

    /// Consume `key:value` lines until the blank line, then switch to the
    /// audio phase. Leftover bytes after the blank line are audio.
    fn consume_inline_headers(&mut self, audio_out: &mut Vec<u8>, updates: &mut Vec<IcyMetadata>) {
        let end = match find_header_end(&self.header_buf) {
            Some(end) => end,
            None => return, // headers not complete yet
        };

        let header_text = String::from_utf8_lossy(&self.header_buf[..end.start]).into_owned();
        for line in header_text.lines().skip(1) {
            // skip(1): the "ICY 200 OK" status line
            if let Some((key, value)) = line.split_once(':') {
                self.inline_headers
                    .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        if let Some(interval) = self
            .inline_headers
            .get("icy-metaint")
            .and_then(|v| v.parse::<usize>().ok())
        {
            self.meta_interval = interval;
        }
        if let Some(br) = self.inline_headers.get("icy-br").cloned() {
            self.set_bitrate_kbps(&br);
        }

        let rest = self.header_buf.split_off(end.end);
        self.header_buf.clear();
        self.state = if self.meta_interval > 0 {
            IcyState::Audio
        } else {
            IcyState::Transparent
        };
        if !rest.is_empty() {
            updates.extend(self.feed(&rest, audio_out));
        }
    }

    /// Parse the accumulated metadata block into `Key='Value';` pairs.
    fn finish_metadata_block(&mut self) -> Option<IcyMetadata> {
        // blocks are null padded to a multiple of 16 bytes
        let trimmed: Vec<u8> = self
            .metadata
            .iter()
            .copied()
            .take_while(|&b| b != 0)
            .collect();
        self.metadata.clear();
        if trimmed.is_empty() {
            return None;
        }

        let text = String::from_utf8_lossy(&trimmed).into_owned();
        let mut update = IcyMetadata::default();
        for (key, value) in parse_metadata_pairs(&text) {
            match key.as_str() {
                "StreamTitle" => update.title = Some(value),
                "StreamUrl" => update.url = Some(value),
                other => debug!(key = other, "ignoring ICY metadata field"),
            }
        }

        if update == IcyMetadata::default() {
            warn!(block = %text, "ICY metadata block carried no known fields");
            return None;
        }
        Some(update)
    }

    fn set_bitrate_kbps(&mut self, value: &str) {
        if let Ok(kbps) = value.trim().parse::<f64>() {
            if kbps > 0.0 {
                self.bitrate = Some(kbps * 1000.0);
            }
        }
    }
}

struct HeaderEnd {
    /// Offset of the blank line
    start: usize,
    /// Offset of the first audio byte
    end: usize,
}

/// Locate the blank line terminating an in-body ICY header block.
fn find_header_end(buf: &[u8]) -> Option<HeaderEnd> {
    if let Some(idx) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(HeaderEnd {
            start: idx,
            end: idx + 4,
        });
    }
    buf.windows(2)
        .position(|w| w == b"\n\n")
        .map(|idx| HeaderEnd {
            start: idx,
            end: idx + 2,
        })
}

/// Split `Key='Value';Key='Value';` pairs. Values may contain anything but
/// the terminating `';` sequence.
fn parse_metadata_pairs(text: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = text;
    while let Some(eq) = rest.find("='") {
        let key = rest[..eq].trim().trim_start_matches(';').trim().to_string();
        let value_start = eq + 2;
        let value_end = rest[value_start..]
            .find("';")
            .map(|i| value_start + i)
            .or_else(|| rest.rfind('\'').filter(|&i| i >= value_start));
        match value_end {
            Some(end) => {
                pairs.push((key, rest[value_start..end].to_string()));
                rest = rest.get(end + 2..).unwrap_or("");
            }
            None => break,
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a null-padded metadata block with its length byte.
    fn metadata_block(content: &str) -> Vec<u8> {
        let len = content.len().div_ceil(16);
        let mut block = vec![len as u8];
        block.extend_from_slice(content.as_bytes());
        block.resize(1 + len * 16, 0);
        block
    }

    #[test]
    fn test_transparent_passthrough() {
        let mut demuxer = IcyDemuxer::transparent();
        let mut audio = Vec::new();
        let updates = demuxer.feed(b"raw audio bytes", &mut audio);
        assert!(updates.is_empty());
        assert_eq!(audio, b"raw audio bytes");
        assert!(!demuxer.is_icy());
    }

    #[test]
    fn test_metadata_stripped_from_audio() {
        let mut demuxer = IcyDemuxer::with_interval(8);
        let mut input = Vec::new();
        input.extend_from_slice(b"AAAAAAAA");
        input.extend_from_slice(&metadata_block("StreamTitle='Artist - Track';"));
        input.extend_from_slice(b"BBBBBBBB");

        let mut audio = Vec::new();
        let updates = demuxer.feed(&input, &mut audio);

        assert_eq!(audio, b"AAAAAAAABBBBBBBB");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].title.as_deref(), Some("Artist - Track"));
    }

    #[test]
    fn test_zero_length_block_produces_no_update() {
        let mut demuxer = IcyDemuxer::with_interval(4);
        let mut audio = Vec::new();
        // 4 audio bytes, a zero length byte, 4 more audio bytes
        let updates = demuxer.feed(b"AAAA\x00BBBB", &mut audio);
        assert!(updates.is_empty());
        assert_eq!(audio, b"AAAABBBB");
    }

    #[test]
    fn test_block_split_across_feeds() {
        let mut demuxer = IcyDemuxer::with_interval(4);
        let mut input = Vec::new();
        input.extend_from_slice(b"AAAA");
        input.extend_from_slice(&metadata_block("StreamTitle='Split Feed Song';"));
        input.extend_from_slice(b"BBBB");

        // feed one byte at a time; reassembly must be identical
        let mut audio = Vec::new();
        let mut updates = Vec::new();
        for byte in &input {
            updates.extend(demuxer.feed(std::slice::from_ref(byte), &mut audio));
        }

        assert_eq!(audio, b"AAAABBBB");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].title.as_deref(), Some("Split Feed Song"));
    }

    #[test]
    fn test_interval_counter_resets_between_blocks() {
        let mut demuxer = IcyDemuxer::with_interval(4);
        let mut input = Vec::new();
        input.extend_from_slice(b"AAAA");
        input.extend_from_slice(&metadata_block("StreamTitle='One';"));
        input.extend_from_slice(b"BBBB");
        input.extend_from_slice(&metadata_block("StreamTitle='Two';"));
        input.extend_from_slice(b"CC");

        let mut audio = Vec::new();
        let updates = demuxer.feed(&input, &mut audio);

        assert_eq!(audio, b"AAAABBBBCC");
        let titles: Vec<_> = updates.iter().filter_map(|u| u.title.as_deref()).collect();
        assert_eq!(titles, vec!["One", "Two"]);
    }

    #[test]
    fn test_title_with_quote_inside() {
        let mut demuxer = IcyDemuxer::with_interval(2);
        let mut input = Vec::new();
        input.extend_from_slice(b"AA");
        input.extend_from_slice(&metadata_block("StreamTitle='Rock 'n' Roll';"));

        let mut audio = Vec::new();
        let updates = demuxer.feed(&input, &mut audio);
        assert_eq!(updates[0].title.as_deref(), Some("Rock 'n' Roll"));
    }

    #[test]
    fn test_raw_icy_reply_headers() {
        let mut demuxer = IcyDemuxer::sniffing();
        let reply = b"ICY 200 OK\r\nicy-name:Test FM\r\nicy-metaint:4\r\nicy-br:128\r\n\r\nAAAA\x00BB";

        let mut audio = Vec::new();
        let updates = demuxer.feed(reply, &mut audio);

        assert!(demuxer.is_icy());
        assert_eq!(demuxer.meta_interval(), 4);
        assert_eq!(demuxer.bitrate(), Some(128_000.0));
        assert_eq!(
            demuxer.inline_headers().get("icy-name").map(String::as_str),
            Some("Test FM")
        );
        assert!(updates.is_empty());
        assert_eq!(audio, b"AAAABB");
    }

    #[test]
    fn test_sniff_falls_back_to_transparent() {
        let mut demuxer = IcyDemuxer::sniffing();
        let mut audio = Vec::new();
        demuxer.feed(b"MP3", &mut audio);
        demuxer.feed(b" frame data", &mut audio);
        assert_eq!(audio, b"MP3 frame data");
        assert!(!demuxer.is_icy());
    }

    #[test]
    fn test_for_response_prefers_http_headers() {
        let mut headers = HashMap::new();
        headers.insert("icy-metaint".to_string(), "8192".to_string());
        headers.insert("icy-br".to_string(), "192".to_string());

        let demuxer = IcyDemuxer::for_response(&headers);
        assert!(demuxer.is_icy());
        assert_eq!(demuxer.meta_interval(), 8192);
        assert_eq!(demuxer.bitrate(), Some(192_000.0));
    }

    #[test]
    fn test_for_response_plain_http() {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "audio/mpeg".to_string());
        let demuxer = IcyDemuxer::for_response(&headers);
        assert!(!demuxer.is_icy());
        assert_eq!(demuxer.state, IcyState::Transparent);
    }

    #[test]
    fn test_scenario_metaint_8192() {
        // icy-metaint:8192 with a title after the first 8192 data bytes
        let mut demuxer = IcyDemuxer::with_interval(8192);
        let mut input = vec![0xAB; 8192];
        input.extend_from_slice(&metadata_block("StreamTitle='Artist - Track';"));
        input.extend_from_slice(&[0xCD; 100]);

        let mut audio = Vec::new();
        let updates = demuxer.feed(&input, &mut audio);

        assert_eq!(audio.len(), 8292);
        assert!(audio[..8192].iter().all(|&b| b == 0xAB));
        assert!(audio[8192..].iter().all(|&b| b == 0xCD));
        assert_eq!(updates[0].title.as_deref(), Some("Artist - Track"));
    }
}
