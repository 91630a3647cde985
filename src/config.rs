use anyhow::{anyhow, bail, Result};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use crate::prompts::PromptStyle;

/// Frontends allowed to call the API when `CORS_ALLOWED_ORIGINS` is not set.
pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "https://anything-boes-chat.vercel.app",
    "https://anythingboes.firebaseapp.com",
];

pub const DEFAULT_MODEL_ID: &str = "Qwen/Qwen2.5-0.5B-Instruct";
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 500;

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub max_message_chars: usize,
    pub model: ModelConfig,
    pub generation: GenerationParams,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_id: String,
    pub revision: String,
    /// Local snapshot directory; when unset the model is fetched from the hub.
    pub model_dir: Option<PathBuf>,
    pub device: String,
    pub prompt_style: PromptStyle,
    pub pool_size: usize,
    pub hf_token: Option<String>,
}

/// Knobs forwarded to the model on every request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Upper bound on prompt + reply tokens.
    pub max_length: usize,
    pub max_new_tokens: Option<usize>,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    pub no_repeat_ngram_size: usize,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub do_sample: bool,
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_length: 1000,
            max_new_tokens: None,
            temperature: 1.0,
            top_k: 50,
            top_p: 0.95,
            no_repeat_ngram_size: 2,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
            do_sample: true,
            seed: None,
        }
    }
}

impl GenerationParams {
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self> {
        let defaults = Self::default();
        let params = Self {
            max_length: parse_or(lookup, "GEN_MAX_LENGTH", defaults.max_length)?,
            max_new_tokens: parse_opt(lookup, "GEN_MAX_NEW_TOKENS")?,
            temperature: parse_or(lookup, "GEN_TEMPERATURE", defaults.temperature)?,
            top_k: parse_or(lookup, "GEN_TOP_K", defaults.top_k)?,
            top_p: parse_or(lookup, "GEN_TOP_P", defaults.top_p)?,
            no_repeat_ngram_size: parse_or(
                lookup,
                "GEN_NO_REPEAT_NGRAM_SIZE",
                defaults.no_repeat_ngram_size,
            )?,
            repeat_penalty: parse_or(lookup, "GEN_REPEAT_PENALTY", defaults.repeat_penalty)?,
            repeat_last_n: parse_or(lookup, "GEN_REPEAT_LAST_N", defaults.repeat_last_n)?,
            do_sample: parse_or(lookup, "GEN_DO_SAMPLE", defaults.do_sample)?,
            seed: parse_opt(lookup, "GEN_SEED")?,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_length == 0 {
            bail!("GEN_MAX_LENGTH must be greater than 0");
        }
        if self.max_new_tokens == Some(0) {
            bail!("GEN_MAX_NEW_TOKENS must be greater than 0");
        }
        if !(self.temperature > 0.0) {
            bail!("GEN_TEMPERATURE must be positive, got {}", self.temperature);
        }
        if self.top_k == 0 {
            bail!("GEN_TOP_K must be greater than 0");
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            bail!("GEN_TOP_P must be in (0, 1], got {}", self.top_p);
        }
        if !(self.repeat_penalty > 0.0) {
            bail!(
                "GEN_REPEAT_PENALTY must be positive, got {}",
                self.repeat_penalty
            );
        }
        Ok(())
    }
}

impl ServerConfig {
    /// Reads the process environment, after `.env` has been loaded.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key: &str| dotenvy::var(key).ok())
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self> {
        let allowed_origins = match get(lookup, "CORS_ALLOWED_ORIGINS") {
            Some(raw) => parse_origins(&raw),
            None => DEFAULT_ALLOWED_ORIGINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };

        let max_message_chars =
            parse_or(lookup, "MESSAGE_MAX_CHARS", DEFAULT_MAX_MESSAGE_CHARS)?;
        if max_message_chars == 0 {
            bail!("MESSAGE_MAX_CHARS must be greater than 0");
        }

        let pool_size = parse_or(lookup, "MODEL_POOL_SIZE", 1usize)?;
        if pool_size == 0 {
            bail!("MODEL_POOL_SIZE must be at least 1");
        }

        let model = ModelConfig {
            model_id: get(lookup, "MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            revision: get(lookup, "MODEL_REVISION").unwrap_or_else(|| "main".to_string()),
            model_dir: get(lookup, "MODEL_DIR").map(PathBuf::from),
            device: get(lookup, "MODEL_DEVICE").unwrap_or_else(|| "cpu".to_string()),
            prompt_style: parse_or(lookup, "MODEL_PROMPT_STYLE", PromptStyle::ChatMl)?,
            pool_size,
            hf_token: get(lookup, "HUGGINGFACE_API_KEY"),
        };

        Ok(Self {
            host: get(lookup, "HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(lookup, "PORT", 5000u16)?,
            allowed_origins,
            max_message_chars,
            model,
            generation: GenerationParams::from_lookup(lookup)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/'))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn get(lookup: Lookup<'_>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_opt<T>(lookup: Lookup<'_>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    get(lookup, key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| anyhow!("invalid value for {key} ('{raw}'): {e}"))
        })
        .transpose()
}

fn parse_or<T>(lookup: Lookup<'_>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}
