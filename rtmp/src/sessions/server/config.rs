use crate::playback::PlaybackConfig;

/// Settings shared by every session a server creates
#[derive(Debug, Clone)]
pub struct ServerSessionConfig {
    pub fms_version: String,
    pub chunk_size: u32,
    pub peer_bandwidth: u32,
    pub window_ack_size: u32,

    /// Pacing of recorded playback.  A buffer length reported by the client takes the
    /// place of `playback.buffer_duration_ms`.
    pub playback: PlaybackConfig,
}

impl ServerSessionConfig {
    /// Defaults that match what Flash Media Server advertises
    pub fn new() -> ServerSessionConfig {
        ServerSessionConfig {
            fms_version: "FMS/3,0,1,1233".to_string(),
            chunk_size: 4096,
            peer_bandwidth: 2_500_000,
            window_ack_size: 2_500_000,
            playback: PlaybackConfig::new(),
        }
    }
}

impl Default for ServerSessionConfig {
    fn default() -> Self {
        ServerSessionConfig::new()
    }
}
