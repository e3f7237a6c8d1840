//! Minimal command-line player: stream one or more URLs in order.
//!
//! ```sh
//! cargo run --example play -- https://ice6.somafm.com/groovesalad-128-mp3
//! ```

use audiopipe::logging::{init_logging, LogConfig};
use audiopipe::{Playlist, PlaylistDelegate, StreamError};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Parser)]
#[command(about = "Play audio stream URLs in order")]
struct Args {
    /// Stream URLs to play
    urls: Vec<String>,
    /// Volume in [0.0, 1.0]
    #[arg(long)]
    volume: Option<f32>,
}

struct Printer {
    finished: Arc<Notify>,
}

impl PlaylistDelegate for Printer {
    fn new_song_playing(&self, url: &reqwest::Url) {
        println!("▶ {}", url);
    }

    fn running_out_of_songs(&self) {
        println!("(queue running low)");
    }

    fn stream_error(&self, error: &StreamError) {
        eprintln!("stream error: {}", error);
    }

    fn attempting_new_song(&self) {
        println!("(retrying)");
    }

    fn no_songs_left(&self) {
        println!("done.");
        self.finished.notify_one();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    if args.urls.is_empty() {
        eprintln!("usage: play <url> [<url> ...]");
        std::process::exit(2);
    }

    let _guard = init_logging(LogConfig::default())?;

    let finished = Arc::new(Notify::new());
    let playlist = Playlist::with_capacity(args.urls.len());
    playlist.set_delegate(Arc::new(Printer {
        finished: finished.clone(),
    }));
    if let Some(volume) = args.volume {
        playlist.set_volume(volume);
    }

    for url in &args.urls {
        playlist.add_song(url.parse()?, true);
    }

    let status = playlist.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            let position = match status.progress() {
                Some(seconds) => format!("{:>7.1} s", seconds),
                None => "     --".to_string(),
            };
            match status.current_track() {
                Some(track) => print!("\r{}  {}", position, track),
                None => print!("\r{}", position),
            }
            use std::io::Write;
            let _ = std::io::stdout().flush();
        }
    });

    finished.notified().await;
    playlist.stop();
    Ok(())
}
