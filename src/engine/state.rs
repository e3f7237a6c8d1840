use crate::errors::StreamError;

/// Lifecycle of one stream.
///
/// The engine only ever moves forward through these states; `Done` and
/// `Stopped` are terminal and a finished engine is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created but not yet started; pre-start attributes are still mutable
    Initialized,
    /// Downloading and buffering until enough audio exists to start
    WaitingForData,
    /// The playback queue was started and has not reported running yet
    WaitingForQueueToStart,
    Playing,
    Paused,
    /// Finished; see [`DoneReason`]
    Done,
    /// Torn down by an explicit stop
    Stopped,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Done | StreamState::Stopped)
    }

    /// Waiting on the network or on the playback queue.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            StreamState::WaitingForData | StreamState::WaitingForQueueToStart
        )
    }
}

/// Why a stream finished.
#[derive(Debug, Clone, PartialEq)]
pub enum DoneReason {
    /// All audio was received and played
    Eof,
    /// Stopped by request
    Stopped,
    /// Halted by an error
    Error(StreamError),
}
