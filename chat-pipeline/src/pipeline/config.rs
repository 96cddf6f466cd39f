use std::time::Duration;

use common::utils::config::{AppConfig, DEFAULT_PERSONA};

/// Upper bound applied to configured generation timeouts.
pub const MAX_GENERATION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub search_limit: usize,
    pub persona: String,
    pub max_messages: usize,
    pub max_message_chars: usize,
    /// Budget for the whole generation call, including every streamed read.
    pub generation_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            search_limit: 3,
            persona: DEFAULT_PERSONA.to_string(),
            max_messages: 50,
            max_message_chars: 8_000,
            generation_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&AppConfig> for ChatConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            search_limit: config.search_limit,
            persona: config.persona.clone(),
            max_messages: config.max_messages,
            max_message_chars: config.max_message_chars,
            generation_timeout: Duration::from_secs(config.generation_timeout_secs)
                .min(MAX_GENERATION_TIMEOUT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_timeout_is_capped() {
        let app_config = AppConfig {
            generation_timeout_secs: u64::MAX,
            ..AppConfig::default()
        };
        assert_eq!(
            ChatConfig::from(&app_config).generation_timeout,
            MAX_GENERATION_TIMEOUT
        );

        let app_config = AppConfig {
            generation_timeout_secs: 30,
            ..AppConfig::default()
        };
        assert_eq!(
            ChatConfig::from(&app_config).generation_timeout,
            Duration::from_secs(30)
        );
    }
}
