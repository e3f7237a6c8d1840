/// Artist and title split out of an ICY `StreamTitle` value.
///
/// The raw title is what [`crate::AudioStream::current_song`] exposes; this
/// is the display-friendly form behind
/// [`crate::AudioStream::current_track`]. Most stations publish
/// `Artist - Title`; jingles and show names come through with no artist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackInfo {
    pub artist: Option<String>,
    pub title: String,
}

impl TrackInfo {
    /// Split an ICY stream title on its first ` - ` separator. Anything
    /// that does not split cleanly becomes a bare title.
    pub fn from_stream_title(stream_title: &str) -> TrackInfo {
        if let Some((artist, title)) = stream_title.split_once(" - ") {
            let (artist, title) = (artist.trim(), title.trim());
            if !artist.is_empty() && !title.is_empty() {
                return TrackInfo {
                    artist: Some(artist.to_string()),
                    title: title.to_string(),
                };
            }
        }
        TrackInfo {
            artist: None,
            title: stream_title.trim().to_string(),
        }
    }
}

impl std::fmt::Display for TrackInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.artist {
            Some(artist) => write!(f, "{} - {}", artist, self.title),
            None => write!(f, "{}", self.title),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artist_and_title() {
        let track = TrackInfo::from_stream_title("Boards of Canada - Dayvan Cowboy");
        assert_eq!(track.artist.as_deref(), Some("Boards of Canada"));
        assert_eq!(track.title, "Dayvan Cowboy");
    }

    #[test]
    fn test_bare_title_has_no_artist() {
        let track = TrackInfo::from_stream_title("Station Jingle");
        assert_eq!(track.artist, None);
        assert_eq!(track.title, "Station Jingle");
    }

    #[test]
    fn test_only_first_separator_splits() {
        let track = TrackInfo::from_stream_title("M83 - Midnight City - Radio Edit");
        assert_eq!(track.artist.as_deref(), Some("M83"));
        assert_eq!(track.title, "Midnight City - Radio Edit");
    }

    #[test]
    fn test_empty_side_falls_back_to_bare_title() {
        let track = TrackInfo::from_stream_title(" - Nameless");
        assert_eq!(track.artist, None);
        assert_eq!(track.title, "- Nameless");
    }

    #[test]
    fn test_display_round_trips_the_common_form() {
        let track = TrackInfo::from_stream_title("Artist - Track");
        assert_eq!(track.to_string(), "Artist - Track");
    }
}
