use serde::{Deserialize, Serialize};

/// Container/codec family of an audio stream.
///
/// If not set explicitly on the stream, the file type is guessed: first from
/// the MIME type of the response, then from the extension on the URL, and
/// finally falling back to MP3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Mp3,
    Aac,
    Wav,
    Aiff,
    Ogg,
    Flac,
    M4a,
}

impl FileType {
    /// Guess the file type from a MIME type (e.g. `audio/mpeg`).
    ///
    /// Parameters after a `;` are ignored.
    pub fn from_mime(mime: &str) -> Option<FileType> {
        let essence = mime.split(';').next().unwrap_or("").trim();
        match essence.to_ascii_lowercase().as_str() {
            "audio/mpeg" | "audio/mp3" | "audio/mpg" => Some(FileType::Mp3),
            "audio/aac" | "audio/aacp" | "audio/x-aac" => Some(FileType::Aac),
            "audio/wav" | "audio/x-wav" | "audio/wave" => Some(FileType::Wav),
            "audio/aiff" | "audio/x-aiff" => Some(FileType::Aiff),
            "audio/ogg" | "application/ogg" => Some(FileType::Ogg),
            "audio/flac" | "audio/x-flac" => Some(FileType::Flac),
            "audio/mp4" | "audio/x-m4a" | "audio/m4a" => Some(FileType::M4a),
            _ => None,
        }
    }

    /// Guess the file type from a URL path extension.
    pub fn from_extension(ext: &str) -> Option<FileType> {
        match ext.to_ascii_lowercase().as_str() {
            "mp3" => Some(FileType::Mp3),
            "aac" | "adts" => Some(FileType::Aac),
            "wav" | "wave" => Some(FileType::Wav),
            "aif" | "aiff" => Some(FileType::Aiff),
            "ogg" | "oga" => Some(FileType::Ogg),
            "flac" => Some(FileType::Flac),
            "m4a" | "mp4" => Some(FileType::M4a),
            _ => None,
        }
    }

    /// Infer a file type with the standard precedence: MIME type, then URL
    /// extension, then MP3.
    pub fn infer(mime: Option<&str>, url_path: &str) -> FileType {
        if let Some(t) = mime.and_then(FileType::from_mime) {
            return t;
        }
        if let Some(t) = url_path
            .rsplit('.')
            .next()
            .filter(|ext| !ext.contains('/'))
            .and_then(FileType::from_extension)
        {
            return t;
        }
        FileType::Mp3
    }

    /// Extension hint handed to the container prober.
    pub fn hint_extension(&self) -> &'static str {
        match self {
            FileType::Mp3 => "mp3",
            FileType::Aac => "aac",
            FileType::Wav => "wav",
            FileType::Aiff => "aiff",
            FileType::Ogg => "ogg",
            FileType::Flac => "flac",
            FileType::M4a => "m4a",
        }
    }

    /// True for PCM containers where every packet has the same byte size.
    /// Framed codecs (MP3, AAC, ...) have variable packet sizes.
    pub fn is_pcm(&self) -> bool {
        matches!(self, FileType::Wav | FileType::Aiff)
    }
}

/// Description of the decoded audio stream, filled in by the packet parser
/// once the container properties have been read.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescription {
    pub file_type: FileType,
    /// Sample frames per second
    pub sample_rate: u32,
    pub channels: u16,
    /// Sample frames carried by one packet (1152 for MP3, 1024 for AAC,
    /// 1 for PCM)
    pub frames_per_packet: u32,
    /// Fixed packet size in bytes for PCM streams, `None` when variable
    pub bytes_per_packet: Option<u32>,
}

impl StreamDescription {
    /// Seconds of audio represented by a single packet.
    pub fn packet_duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        f64::from(self.frames_per_packet) / f64::from(self.sample_rate)
    }
}
