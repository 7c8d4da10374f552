//! Process configuration
//!
//! Everything the service reads from the environment at startup, plus the
//! policy enums that configuration selects between.

use crate::{Error, Result};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 5001;
const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiProvider {
    OpenAi,
    Gemini,
}

impl AiProvider {
    pub fn name(&self) -> &'static str {
        match self {
            AiProvider::OpenAi => "openai",
            AiProvider::Gemini => "gemini",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            AiProvider::OpenAi => "gpt-4o",
            AiProvider::Gemini => "gemini-2.5-pro",
        }
    }
}

impl FromStr for AiProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(AiProvider::OpenAi),
            "gemini" => Ok(AiProvider::Gemini),
            other => Err(Error::Config(format!(
                "Unsupported LLM provider: {}. Supported providers are: openai, gemini",
                other
            ))),
        }
    }
}

/// What `consume` does to a context once it has been injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InjectionPolicy {
    /// Keep the context, flagged as injected, until the session ends or expires.
    #[default]
    MarkInjected,
    /// Remove the context (and release its blob) after the first injection.
    DeleteAfterUse,
}

impl FromStr for InjectionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mark" | "mark_injected" => Ok(InjectionPolicy::MarkInjected),
            "delete" | "one_shot" => Ok(InjectionPolicy::DeleteAfterUse),
            other => Err(Error::Config(format!("Unknown INJECTION_POLICY: {}", other))),
        }
    }
}

/// How an injected image is referenced in the forwarded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageReferenceMode {
    /// `data:` URL carrying the base64 payload.
    #[default]
    Inline,
    /// The public URL the blob store returned, falling back to inline.
    PublicUrl,
}

impl FromStr for ImageReferenceMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" | "data_url" => Ok(ImageReferenceMode::Inline),
            "public_url" | "url" => Ok(ImageReferenceMode::PublicUrl),
            other => Err(Error::Config(format!("Unknown IMAGE_REFERENCE: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint: String,
    pub bucket: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub enum BlobBackend {
    Local { dir: String },
    S3(S3Settings),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub provider: AiProvider,
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub bind_addr: SocketAddr,
    pub upstream_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub max_image_bytes: usize,
    pub session_max_age: Duration,
    pub sweep_interval: Duration,
    pub injection_policy: InjectionPolicy,
    pub image_reference: ImageReferenceMode,
    pub session_header: String,
    pub strip_metadata: bool,
    pub blob_backend: BlobBackend,
    pub public_base_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let provider = match var("LLM_PROVIDER") {
            Some(value) => value.parse()?,
            None => AiProvider::OpenAi,
        };

        let api_key = match provider {
            AiProvider::OpenAi => var("OPENAI_API_KEY")
                .ok_or_else(|| Error::Config("OPENAI_API_KEY not set".to_string()))?,
            AiProvider::Gemini => var("GEMINI_API_KEY")
                .or_else(|| var("OPENAI_API_KEY"))
                .ok_or_else(|| Error::Config("GEMINI_API_KEY not set".to_string()))?,
        };

        let model = var("DEFAULT_MODEL").unwrap_or_else(|| provider.default_model().to_string());

        let base_url = match provider {
            AiProvider::OpenAi => var("OPENAI_BASE_URL"),
            AiProvider::Gemini => var("GEMINI_BASE_URL"),
        };

        let bind_addr = match var("BIND_ADDR") {
            Some(addr) => addr,
            None => format!(
                "0.0.0.0:{}",
                var("PORT").unwrap_or_else(|| DEFAULT_PORT.to_string())
            ),
        };
        let bind_addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| Error::Config(format!("Invalid bind address '{}': {}", bind_addr, e)))?;

        let blob_backend = match var("BLOB_BACKEND").as_deref() {
            None | Some("local") => BlobBackend::Local {
                dir: var("BLOB_DIR").unwrap_or_else(|| "uploads".to_string()),
            },
            Some("s3") => BlobBackend::S3(S3Settings {
                access_key_id: var("BLOB_S3_ACCESS_KEY_ID").ok_or_else(|| {
                    Error::Config("BLOB_S3_ACCESS_KEY_ID not set".to_string())
                })?,
                secret_access_key: var("BLOB_S3_SECRET_ACCESS_KEY").ok_or_else(|| {
                    Error::Config("BLOB_S3_SECRET_ACCESS_KEY not set".to_string())
                })?,
                endpoint: var("BLOB_S3_ENDPOINT")
                    .ok_or_else(|| Error::Config("BLOB_S3_ENDPOINT not set".to_string()))?,
                bucket: var("BLOB_S3_BUCKET")
                    .ok_or_else(|| Error::Config("BLOB_S3_BUCKET not set".to_string()))?,
                base_url: var("BLOB_S3_BASE_URL")
                    .ok_or_else(|| Error::Config("BLOB_S3_BASE_URL not set".to_string()))?,
            }),
            Some(other) => {
                return Err(Error::Config(format!("Unknown BLOB_BACKEND: {}", other)));
            }
        };

        let sweep_interval = Duration::from_secs(parse_or(&var, "SWEEP_INTERVAL_SECS", 60)?);
        if sweep_interval.is_zero() {
            return Err(Error::Config("SWEEP_INTERVAL_SECS must be positive".to_string()));
        }

        Ok(Self {
            provider,
            api_key,
            model,
            base_url,
            bind_addr,
            upstream_timeout: Duration::from_secs(parse_or(&var, "UPSTREAM_TIMEOUT_SECS", 60)?),
            stream_idle_timeout: Duration::from_secs(parse_or(
                &var,
                "STREAM_IDLE_TIMEOUT_SECS",
                30,
            )?),
            max_image_bytes: parse_or(&var, "MAX_IMAGE_BYTES", DEFAULT_MAX_IMAGE_BYTES)?,
            session_max_age: Duration::from_secs(parse_or(&var, "SESSION_MAX_AGE_SECS", 3600)?),
            sweep_interval,
            injection_policy: match var("INJECTION_POLICY") {
                Some(value) => value.parse()?,
                None => InjectionPolicy::default(),
            },
            image_reference: match var("IMAGE_REFERENCE") {
                Some(value) => value.parse()?,
                None => ImageReferenceMode::default(),
            },
            session_header: var("SESSION_HEADER")
                .unwrap_or_else(|| "x-session-id".to_string())
                .to_ascii_lowercase(),
            strip_metadata: parse_or(&var, "STRIP_METADATA", true)?,
            blob_backend,
            public_base_url: var("PUBLIC_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
        })
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {} '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_select_openai() {
        let config = Config::from_lookup(lookup(&[("OPENAI_API_KEY", "sk-test")])).unwrap();
        assert_eq!(config.provider, AiProvider::OpenAi);
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.bind_addr.port(), 5001);
        assert_eq!(config.injection_policy, InjectionPolicy::MarkInjected);
        assert_eq!(config.image_reference, ImageReferenceMode::Inline);
        assert_eq!(config.session_header, "x-session-id");
        assert!(config.strip_metadata);
        assert!(matches!(config.blob_backend, BlobBackend::Local { .. }));
    }

    #[test]
    fn test_gemini_key_falls_back_to_openai_key() {
        let config = Config::from_lookup(lookup(&[
            ("LLM_PROVIDER", "Gemini"),
            ("OPENAI_API_KEY", "shared-key"),
        ]))
        .unwrap();
        assert_eq!(config.provider, AiProvider::Gemini);
        assert_eq!(config.api_key, "shared-key");
        assert_eq!(config.model, "gemini-2.5-pro");
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("LLM_PROVIDER", "anthropic"),
            ("OPENAI_API_KEY", "k"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("anthropic"));
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "k"),
            ("DEFAULT_MODEL", "gpt-4o-mini"),
            ("PORT", "8080"),
            ("INJECTION_POLICY", "delete"),
            ("IMAGE_REFERENCE", "public_url"),
            ("MAX_IMAGE_BYTES", "1024"),
            ("PUBLIC_BASE_URL", "https://proxy.example.com/"),
        ]))
        .unwrap();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.injection_policy, InjectionPolicy::DeleteAfterUse);
        assert_eq!(config.image_reference, ImageReferenceMode::PublicUrl);
        assert_eq!(config.max_image_bytes, 1024);
        assert_eq!(
            config.public_base_url.as_deref(),
            Some("https://proxy.example.com")
        );
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "k"),
            ("SWEEP_INTERVAL_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = Config::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "k"),
            ("SESSION_MAX_AGE_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("SESSION_MAX_AGE_SECS"));
    }
}
