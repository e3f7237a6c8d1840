//! # audiopipe
//!
//! A streaming audio playback engine for HTTP(S) and ICY/Shoutcast
//! sources. A stream is downloaded progressively, demultiplexed and parsed
//! into audio packets on the fly, and fed to a platform audio output
//! through a fixed ring of buffers, so playback starts long before the
//! resource finishes downloading. Back-pressure flows the other way: when
//! the ring is full the network reader is descheduled until the player
//! frees a buffer.
//!
//! ## Modules
//!
//! - [`engine`] - The per-stream state machine and the [`AudioStream`] handle
//! - [`playlist`] - Song queue with auto-advance and network retry
//! - [`net`] - HTTP byte reader and ICY metadata demuxing
//! - [`audio`] - Packet parsing, the buffer ring, and the playback sink
//! - [`models`] - Data structures and type definitions
//! - [`config`] - Stream settings and persistence
//! - [`logging`] - Logging configuration and management
//! - [`errors`] - Error types and handling utilities
//!
//! ## Example
//!
//! ```rust,no_run
//! use audiopipe::Playlist;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let playlist = Playlist::new();
//!     playlist.add_song("https://ice6.somafm.com/groovesalad-128-mp3".parse()?, true);
//!
//!     // ... run until the queue drains, observing PlaylistDelegate events
//!
//!     playlist.stop();
//!     Ok(())
//! }
//! ```

pub mod audio;
pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod models;
pub mod net;
pub mod playlist;

pub use engine::{AudioStream, DoneReason, StreamDelegate, StreamState, StreamStatus};
pub use errors::{StreamError, StreamResult};
pub use playlist::{Playlist, PlaylistDelegate};
