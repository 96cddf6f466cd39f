use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub const DEFAULT_PERSONA: &str = "You are Lumen, a warm and playful companion with a gentle, \
slightly teasing sense of humour. You speak in short, lively sentences, you stay in character, \
and you weave the reference lines you are given into your answers naturally instead of quoting \
them mechanically.";

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
    #[serde(default)]
    pub corpus_path: Option<String>,
    #[serde(default = "default_persona")]
    pub persona: String,
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
    #[serde(default = "default_redaction_marker")]
    pub redaction_marker: String,
    #[serde(default = "default_generation_backend")]
    pub generation_backend: String,
    #[serde(default = "default_generation_model")]
    pub generation_model: String,
    #[serde(default)]
    pub generation_temperature: Option<f32>,
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    #[serde(default = "default_ollama_base_url")]
    pub ollama_base_url: String,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: String,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_http_port() -> u16 {
    8000
}

fn default_search_limit() -> usize {
    3
}

fn default_persona() -> String {
    DEFAULT_PERSONA.to_string()
}

pub fn default_denylist() -> Vec<String> {
    [
        "eval(",
        "exec(",
        "os.system",
        "os.popen",
        "subprocess",
        "__import__",
        "getattr(",
        "setattr(",
        "globals(",
        "runtime.getruntime",
    ]
    .iter()
    .map(|entry| (*entry).to_string())
    .collect()
}

fn default_redaction_marker() -> String {
    "[REDACTED]".to_string()
}

fn default_generation_backend() -> String {
    "ollama".to_string()
}

fn default_generation_model() -> String {
    "llama3.2".to_string()
}

fn default_generation_timeout_secs() -> u64 {
    60
}

fn default_ollama_base_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_backend() -> String {
    "fastembed".to_string()
}

fn default_embedding_dimensions() -> u32 {
    384
}

fn default_max_messages() -> usize {
    50
}

fn default_max_message_chars() -> usize {
    8_000
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            search_limit: default_search_limit(),
            corpus_path: None,
            persona: default_persona(),
            denylist: default_denylist(),
            redaction_marker: default_redaction_marker(),
            generation_backend: default_generation_backend(),
            generation_model: default_generation_model(),
            generation_temperature: None,
            generation_timeout_secs: default_generation_timeout_secs(),
            ollama_base_url: default_ollama_base_url(),
            openai_api_key: String::new(),
            openai_base_url: default_base_url(),
            embedding_backend: default_embedding_backend(),
            embedding_model: None,
            embedding_dimensions: default_embedding_dimensions(),
            max_messages: default_max_messages(),
            max_message_chars: default_max_message_chars(),
            max_body_bytes: default_max_body_bytes(),
            api_key: None,
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::default()
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("denylist"),
        )
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(source: &str) -> AppConfig {
        Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()
            .expect("build config")
            .try_deserialize()
            .expect("deserialize config")
    }

    #[test]
    fn empty_source_uses_defaults() {
        let config = from_toml("");
        assert_eq!(config.http_port, 8000);
        assert_eq!(config.search_limit, 3);
        assert_eq!(config.generation_backend, "ollama");
        assert_eq!(config.generation_model, "llama3.2");
        assert_eq!(config.redaction_marker, "[REDACTED]");
        assert!(config.denylist.contains(&"subprocess".to_string()));
        assert!(config.api_key.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let config = from_toml(
            r#"
            search_limit = 2
            denylist = ["rm -rf", "drop table"]
            generation_backend = "openai"
            generation_temperature = 0.7
            "#,
        );
        assert_eq!(config.search_limit, 2);
        assert_eq!(config.denylist, vec!["rm -rf", "drop table"]);
        assert_eq!(config.generation_backend, "openai");
        assert_eq!(config.generation_temperature, Some(0.7));
    }

    #[test]
    fn default_impl_matches_serde_defaults() {
        let from_serde = from_toml("");
        let from_default = AppConfig::default();
        assert_eq!(from_serde.search_limit, from_default.search_limit);
        assert_eq!(from_serde.denylist, from_default.denylist);
        assert_eq!(from_serde.max_body_bytes, from_default.max_body_bytes);
    }
}
