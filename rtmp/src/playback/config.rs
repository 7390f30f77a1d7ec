/// Pacing parameters for recorded playback
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackConfig {
    /// How far ahead of real time the player's buffer should be kept
    pub buffer_duration_ms: u32,

    /// Delays at or below this are not worth arming a timer for
    pub timer_tick_ms: u32,

    /// Writes taking longer than this are logged as a sign of a congested connection
    pub write_latency_warning_ms: u32,
}

impl PlaybackConfig {
    pub fn new() -> PlaybackConfig {
        PlaybackConfig {
            buffer_duration_ms: 5000,
            timer_tick_ms: 100,
            write_latency_warning_ms: 2000,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        PlaybackConfig::new()
    }
}
