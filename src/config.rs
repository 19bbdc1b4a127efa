use std::time::Duration;

/// Tunables for one call engine instance.
#[derive(Clone)]
pub struct RtcConfig {
    /// How long an outgoing media call rings before it is canceled.
    pub answer_timeout: Duration,
    /// Go on with zero local tracks when capture devices fail.
    pub continue_without_local_media: bool,
    /// Statistics collection endpoint. `None` disables upload.
    pub stats_url: Option<String>,
    pub stats_max_attempts: u32,
    /// Base delay between upload attempts, grows linearly per attempt.
    pub stats_retry_backoff: Duration,
    /// Capacity of the engine command queue.
    pub command_buffer: usize,
}

impl std::fmt::Debug for RtcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcConfig")
            .field("answer_timeout", &self.answer_timeout)
            .field(
                "continue_without_local_media",
                &self.continue_without_local_media,
            )
            .field("stats_url", &self.stats_url.is_some())
            .field("stats_max_attempts", &self.stats_max_attempts)
            .field("stats_retry_backoff", &self.stats_retry_backoff)
            .field("command_buffer", &self.command_buffer)
            .finish()
    }
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            answer_timeout: Duration::from_secs(50),
            continue_without_local_media: true,
            stats_url: None,
            stats_max_attempts: 5,
            stats_retry_backoff: Duration::from_millis(500),
            command_buffer: 64,
        }
    }
}
