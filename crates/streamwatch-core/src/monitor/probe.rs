//! HTTP playlist probe engine
//!
//! A [`PlaybackEngine`] for headless deployments. It does not decode
//! anything: it polls the HLS playlist and reports lifecycle events from
//! what it sees.
//!
//! - First valid playlist: `CanPlay`, then `Playing`
//! - Request failure: fatal `ManifestLoadError`, then the probe stops
//! - Body that is not a playlist: `ManifestParsingError`, then the probe stops
//! - Live media sequence not advancing for `stall_polls` polls: `Stalled`
//!
//! Master playlists are followed to their first variant.

use crate::media::{HandleId, MediaHandle};
use crate::monitor::engine::{EngineError, EngineEvent, EngineEvents, ErrorDetail, PlaybackEngine};
use reqwest::Url;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Probe timing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSettings {
    pub poll_interval: Duration,
    /// Consecutive polls without progress before reporting a stall
    pub stall_polls: u32,
    pub request_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            stall_polls: 3,
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlaylistError {
    #[error("Missing #EXTM3U header")]
    MissingHeader,

    #[error("Invalid tag value: {0}")]
    InvalidTag(String),
}

/// The parts of an HLS playlist the probe cares about
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Playlist {
    pub media_sequence: u64,
    pub segments: usize,
    pub target_duration: Option<f64>,
    /// `#EXT-X-ENDLIST` present: nothing more will be appended
    pub ended: bool,
    /// Variant URIs of a master playlist, in order
    pub variants: Vec<String>,
}

impl Playlist {
    pub fn is_master(&self) -> bool {
        !self.variants.is_empty()
    }

    /// Position used to detect a live playlist that stopped moving
    fn progress(&self) -> (u64, usize) {
        (self.media_sequence, self.segments)
    }
}

/// Parse an HLS playlist body
pub fn parse_playlist(body: &str) -> Result<Playlist, PlaylistError> {
    let mut lines = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty());
    if lines.next() != Some("#EXTM3U") {
        return Err(PlaylistError::MissingHeader);
    }

    let mut playlist = Playlist::default();
    let mut expect_variant = false;
    for line in lines {
        if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            playlist.media_sequence = value
                .trim()
                .parse()
                .map_err(|_| PlaylistError::InvalidTag(line.to_string()))?;
        } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            playlist.target_duration = Some(
                value
                    .trim()
                    .parse()
                    .map_err(|_| PlaylistError::InvalidTag(line.to_string()))?,
            );
        } else if line.starts_with("#EXT-X-STREAM-INF") {
            expect_variant = true;
        } else if line == "#EXT-X-ENDLIST" {
            playlist.ended = true;
        } else if line.starts_with("#EXTINF") {
            playlist.segments += 1;
        } else if !line.starts_with('#') && expect_variant {
            playlist.variants.push(line.to_string());
            expect_variant = false;
        }
    }
    Ok(playlist)
}

/// Engine observing streams by polling their playlists
pub struct HttpProbeEngine {
    client: reqwest::Client,
    settings: ProbeSettings,
    sessions: Mutex<HashMap<HandleId, JoinHandle<()>>>,
}

impl std::fmt::Debug for HttpProbeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProbeEngine")
            .field("settings", &self.settings)
            .field("sessions", &self.session_count())
            .finish()
    }
}

impl HttpProbeEngine {
    pub fn new(settings: ProbeSettings) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            settings,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Number of handles currently being probed
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .map(|s| s.values().filter(|t| !t.is_finished()).count())
            .unwrap_or(0)
    }
}

impl PlaybackEngine for HttpProbeEngine {
    fn attach(
        &self,
        url: &str,
        handle: &Arc<MediaHandle>,
        events: EngineEvents,
    ) -> Result<(), EngineError> {
        let parsed = Url::parse(url).map_err(|_| EngineError::UnsupportedUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::UnsupportedUrl(url.to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let task = runtime.spawn(probe_loop(
            self.client.clone(),
            parsed,
            self.settings,
            events,
            handle.label().to_string(),
        ));
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = sessions.insert(handle.id(), task) {
            previous.abort();
        }
        Ok(())
    }

    fn detach(&self, handle: &MediaHandle) -> Result<(), EngineError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = sessions.remove(&handle.id()) {
            task.abort();
        }
        Ok(())
    }

    fn play(&self, handle: &MediaHandle) -> Result<(), EngineError> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if sessions.contains_key(&handle.id()) {
            Ok(())
        } else {
            Err(EngineError::NotAttached(handle.id()))
        }
    }
}

impl Drop for HttpProbeEngine {
    fn drop(&mut self) {
        let sessions = self.sessions.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, task) in sessions.drain() {
            task.abort();
        }
    }
}

enum FetchError {
    Transport(String),
    Parse(PlaylistError),
}

async fn fetch_playlist(client: &reqwest::Client, url: &Url) -> Result<Playlist, FetchError> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| FetchError::Transport(e.to_string()))?;
    let body = response
        .text()
        .await
        .map_err(|e| FetchError::Transport(e.to_string()))?;
    parse_playlist(&body).map_err(FetchError::Parse)
}

async fn probe_loop(
    client: reqwest::Client,
    mut url: Url,
    settings: ProbeSettings,
    events: EngineEvents,
    label: String,
) {
    let mut ticker = tokio::time::interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut announced = false;
    let mut last_progress: Option<(u64, usize)> = None;
    let mut unchanged = 0u32;
    let mut stalled = false;

    loop {
        ticker.tick().await;
        if events.is_closed() {
            return;
        }

        let playlist = match fetch_playlist(&client, &url).await {
            Ok(p) => p,
            Err(FetchError::Transport(msg)) => {
                tracing::warn!(source = %label, url = %url, "Playlist request failed: {}", msg);
                events.emit(EngineEvent::Error {
                    detail: ErrorDetail::ManifestLoadError,
                    fatal: true,
                });
                return;
            }
            Err(FetchError::Parse(e)) => {
                tracing::warn!(source = %label, url = %url, "Playlist unreadable: {}", e);
                events.emit(EngineEvent::Error {
                    detail: ErrorDetail::ManifestParsingError,
                    fatal: false,
                });
                return;
            }
        };

        if let Some(variant) = playlist.variants.first() {
            match url.join(variant) {
                Ok(next) => {
                    tracing::debug!(source = %label, variant = %next, "Following variant playlist");
                    url = next;
                    ticker.reset_immediately();
                    continue;
                }
                Err(_) => {
                    events.emit(EngineEvent::Error {
                        detail: ErrorDetail::LevelLoadError,
                        fatal: false,
                    });
                    return;
                }
            }
        }

        if !announced {
            announced = true;
            events.emit(EngineEvent::CanPlay);
            events.emit(EngineEvent::Playing);
            last_progress = Some(playlist.progress());
            continue;
        }
        if playlist.ended {
            continue;
        }

        if last_progress == Some(playlist.progress()) {
            unchanged += 1;
            if unchanged >= settings.stall_polls && !stalled {
                tracing::warn!(source = %label, polls = unchanged, "Playlist stopped advancing");
                stalled = true;
                events.emit(EngineEvent::Stalled);
            }
        } else {
            last_progress = Some(playlist.progress());
            unchanged = 0;
            if stalled {
                stalled = false;
                events.emit(EngineEvent::Playing);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:1042

#EXTINF:6.0,
seg1042.ts
#EXTINF:6.0,
seg1043.ts
";

    const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1280x720
720p/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=640000
360p/index.m3u8
";

    #[test]
    fn test_parse_live_playlist() {
        let playlist = parse_playlist(LIVE).unwrap();
        assert_eq!(playlist.media_sequence, 1042);
        assert_eq!(playlist.segments, 2);
        assert_eq!(playlist.target_duration, Some(6.0));
        assert!(!playlist.ended);
        assert!(!playlist.is_master());
    }

    #[test]
    fn test_parse_master_playlist() {
        let playlist = parse_playlist(MASTER).unwrap();
        assert!(playlist.is_master());
        assert_eq!(playlist.variants, vec!["720p/index.m3u8", "360p/index.m3u8"]);
    }

    #[test]
    fn test_parse_vod_end() {
        let body = format!("{}#EXT-X-ENDLIST\n", LIVE);
        assert!(parse_playlist(&body).unwrap().ended);
    }

    #[test]
    fn test_reject_non_playlist() {
        assert_eq!(
            parse_playlist("<html>Not found</html>"),
            Err(PlaylistError::MissingHeader)
        );
        assert_eq!(parse_playlist(""), Err(PlaylistError::MissingHeader));
        assert!(matches!(
            parse_playlist("#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:abc\n"),
            Err(PlaylistError::InvalidTag(_))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_url_rejected() {
        let engine = HttpProbeEngine::new(ProbeSettings::default()).unwrap();
        let handle = MediaHandle::new("x");
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let result = engine.attach("rtmp://example.com/live", &handle, EngineEvents::new(1, tx.clone()));
        assert!(matches!(result, Err(EngineError::UnsupportedUrl(_))));
        let result = engine.attach("not a url", &handle, EngineEvents::new(1, tx));
        assert!(matches!(result, Err(EngineError::UnsupportedUrl(_))));
        assert!(matches!(engine.play(&handle), Err(EngineError::NotAttached(_))));
        assert!(engine.detach(&handle).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_host_reports_fatal_load_error() {
        let settings = ProbeSettings {
            poll_interval: Duration::from_millis(10),
            stall_polls: 3,
            request_timeout: Duration::from_secs(2),
        };
        let engine = HttpProbeEngine::new(settings).unwrap();
        let handle = MediaHandle::new("x");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        // Port 9 (discard) on localhost is closed on test machines
        engine
            .attach("http://127.0.0.1:9/live.m3u8", &handle, EngineEvents::new(3, tx))
            .unwrap();
        assert!(engine.play(&handle).is_ok());

        let stamped = rx.recv().await.unwrap();
        assert_eq!(stamped.epoch, 3);
        assert_eq!(
            stamped.event,
            EngineEvent::Error {
                detail: ErrorDetail::ManifestLoadError,
                fatal: true
            }
        );
        engine.detach(&handle).unwrap();
    }
}
