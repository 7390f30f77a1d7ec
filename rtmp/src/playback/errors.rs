use crate::media::MediaSourceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("The media source failed: {0}")]
    MediaSource(#[from] MediaSourceError),

    #[error("Playback was already stopped and cannot be restarted")]
    AlreadyStopped,
}
