use crate::storage::FileStore;
use std::env;
use std::path::PathBuf;

/// Bundled config for mobile builds (iOS/Android)
const BUNDLED_CONFIG: &str = include_str!("../assets/config.env");

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8030";
const DEFAULT_MODEL: &str = "qa";
const DEFAULT_KB_NAME: &str = "default";
const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 8192;

pub const DEFAULT_WELCOME: &str = "Welcome to the knowledge-base assistant. \
Ask a question about your documents, attach a file for context, \
and rate answers to help improve the knowledge base.";

/// Loads `.env` when present (desktop dev), otherwise the bundled defaults.
///
/// Must be called before any thread is spawned, including the tokio
/// runtime's workers.
pub fn load_env() {
    if dotenvy::dotenv().is_ok() {
        return;
    }
    load_bundled_config();
}

fn load_bundled_config() {
    for (key, value) in parse_env_lines(BUNDLED_CONFIG) {
        // Only set if not already set (allow env override)
        if env::var(key).is_err() {
            // SAFETY: `load_env` runs in `main` before the runtime or any other thread starts
            unsafe {
                env::set_var(key, value);
            }
        }
    }
}

fn parse_env_lines(raw: &str) -> impl Iterator<Item = (&str, &str)> {
    raw.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        line.split_once('=')
            .map(|(key, value)| (key.trim(), value.trim()))
    })
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(variable = name, value = %raw, "ignoring unparseable setting");
            default
        }),
        Err(_) => default,
    }
}

/// Per-request knobs for the knowledge-base QA endpoints.
#[derive(Clone, Debug, PartialEq)]
pub struct QaSettings {
    pub model: String,
    pub kb_name: String,
    pub use_kb: bool,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

impl Default for QaSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            kb_name: DEFAULT_KB_NAME.to_string(),
            use_kb: true,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            stream: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub data_dir: Option<PathBuf>,
    pub welcome_text: String,
    pub qa: QaSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_BASE_URL.to_string(),
            data_dir: None,
            welcome_text: DEFAULT_WELCOME.to_string(),
            qa: QaSettings::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = QaSettings::default();
        let api_base_url = env::var("KBCHAT_API_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            api_base_url,
            data_dir: env::var("KBCHAT_DATA_DIR").ok().map(PathBuf::from),
            welcome_text: env::var("KBCHAT_WELCOME").unwrap_or_else(|_| DEFAULT_WELCOME.into()),
            qa: QaSettings {
                model: env::var("KBCHAT_MODEL").unwrap_or(defaults.model),
                kb_name: env::var("KBCHAT_KB_NAME").unwrap_or(defaults.kb_name),
                use_kb: env_flag("KBCHAT_USE_KB", defaults.use_kb),
                temperature: env_parse("KBCHAT_TEMPERATURE", defaults.temperature),
                max_tokens: env_parse("KBCHAT_MAX_TOKENS", defaults.max_tokens),
                stream: env_flag("KBCHAT_STREAM", defaults.stream),
            },
        }
    }

    /// File store for `namespace`, under `data_dir` when one is configured.
    pub fn store(&self, namespace: &str) -> FileStore {
        match &self.data_dir {
            Some(dir) => FileStore::new(dir.join(namespace)),
            None => FileStore::for_namespace(namespace),
        }
    }
}
