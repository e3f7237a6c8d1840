use std::fmt;

/// Errors raised by the streaming pipeline.
///
/// Any of these halts the stream that raised it: the engine transitions to
/// its done state and tears the pipeline down. Recovery (retrying the URL)
/// is the playlist's job and only applies to the network-class errors, see
/// [`StreamError::is_retryable`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamError {
    /// The network connection to the stream failed (detail carries the
    /// HTTP status or transport error)
    NetworkConnectionFailed(String),
    /// The connection produced no data for a whole timeout interval
    TimedOut,
    /// The file stream parser failed to fetch a property
    FileStreamGetPropertyFailed(String),
    /// The file stream parser failed to set a property
    FileStreamSetPropertyFailed(String),
    /// The file stream parser rejected the stream data
    FileStreamParseBytesFailed(String),
    /// The file stream parser failed to open
    FileStreamOpenFailed(String),
    /// No audio could be found in the stream
    AudioDataNotFound,
    /// The audio queue could not be created
    AudioQueueCreationFailed(String),
    /// The audio queue could not allocate its buffers
    AudioQueueBufferAllocationFailed(String),
    /// The audio queue rejected an enqueued buffer
    AudioQueueEnqueueFailed(String),
    /// The audio queue could not install an event listener
    AudioQueueAddListenerFailed(String),
    /// The audio queue failed to start
    AudioQueueStartFailed(String),
    /// The audio queue failed to pause
    AudioQueuePauseFailed(String),
    /// A buffer came back that the ring does not own
    AudioQueueBufferMismatch,
    /// The audio queue failed to stop
    AudioQueueStopFailed(String),
    /// The audio queue failed to flush
    AudioQueueFlushFailed(String),
    /// A single packet was larger than one buffer; raise the buffer size
    AudioBufferTooSmall { packet_len: usize, buffer_size: usize },
}

impl StreamError {
    /// True for the error classes the playlist may retry: connection
    /// failures and timeouts. Everything else indicates the stream itself
    /// is unplayable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::NetworkConnectionFailed(_) | StreamError::TimedOut
        )
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::NetworkConnectionFailed(msg) => {
                write!(f, "Network connection failed: {}", msg)
            }
            StreamError::TimedOut => write!(f, "Connection to the stream timed out"),
            StreamError::FileStreamGetPropertyFailed(msg) => {
                write!(f, "File stream failed to fetch a property: {}", msg)
            }
            StreamError::FileStreamSetPropertyFailed(msg) => {
                write!(f, "File stream failed to set a property: {}", msg)
            }
            StreamError::FileStreamParseBytesFailed(msg) => {
                write!(f, "File stream failed to parse stream data: {}", msg)
            }
            StreamError::FileStreamOpenFailed(msg) => {
                write!(f, "File stream failed to open: {}", msg)
            }
            StreamError::AudioDataNotFound => write!(f, "No audio data found in stream"),
            StreamError::AudioQueueCreationFailed(msg) => {
                write!(f, "Audio queue creation failed: {}", msg)
            }
            StreamError::AudioQueueBufferAllocationFailed(msg) => {
                write!(f, "Audio queue buffer allocation failed: {}", msg)
            }
            StreamError::AudioQueueEnqueueFailed(msg) => {
                write!(f, "Audio queue enqueue failed: {}", msg)
            }
            StreamError::AudioQueueAddListenerFailed(msg) => {
                write!(f, "Audio queue listener registration failed: {}", msg)
            }
            StreamError::AudioQueueStartFailed(msg) => {
                write!(f, "Audio queue failed to start: {}", msg)
            }
            StreamError::AudioQueuePauseFailed(msg) => {
                write!(f, "Audio queue failed to pause: {}", msg)
            }
            StreamError::AudioQueueBufferMismatch => {
                write!(f, "Audio queue returned a buffer the ring does not own")
            }
            StreamError::AudioQueueStopFailed(msg) => {
                write!(f, "Audio queue failed to stop: {}", msg)
            }
            StreamError::AudioQueueFlushFailed(msg) => {
                write!(f, "Audio queue failed to flush: {}", msg)
            }
            StreamError::AudioBufferTooSmall {
                packet_len,
                buffer_size,
            } => write!(
                f,
                "Audio packet of {} bytes exceeds the {} byte buffer size",
                packet_len, buffer_size
            ),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<reqwest::Error> for StreamError {
    fn from(error: reqwest::Error) -> Self {
        StreamError::NetworkConnectionFailed(error.to_string())
    }
}

/// Result type alias for the streaming pipeline
pub type StreamResult<T> = Result<T, StreamError>;
