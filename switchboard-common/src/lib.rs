//! Common types and utilities shared across Switchboard crates.
//!
//! This crate defines the chat message shapes, rate-limit vocabulary, key
//! configuration model, observability helpers, and shared error types used
//! throughout the Switchboard workspace. It is intentionally lightweight and
//! dependency‑minimal so that all crates can depend on it without
//! introducing heavy transitive costs.
//!
//! # Overview
//!
//! - [`ChatMessage`] / [`ChatRole`]: the conversation shape accepted by brokered providers
//! - [`LimitKind`] / [`LimitSpec`]: the rate-limit dimensions a key may carry
//! - [`KeyConfig`]: one API key with its default and per-model limits
//! - [`observability`]: centralised tracing/logging initialisation
//! - [`SwitchboardError`] and [`Result`]: shared error handling
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod observability;

/// Role of a single chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// One turn of conversation history, as submitted by clients and forwarded
/// to providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// The limit dimensions a key can be constrained by.
///
/// The two uppercase-M codes are *monthly*, not per-minute: `TPM` is tokens
/// per calendar month and `RPM` is requests per calendar month. `TPm` is a
/// fixed (tumbling) 60-second token window, while the request codes `RPS`,
/// `RPm`, and `RPD` are sliding windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitKind {
    #[serde(rename = "RPS")]
    RequestsPerSecond,
    #[serde(rename = "RPm")]
    RequestsPerMinute,
    #[serde(rename = "RPD")]
    RequestsPerDay,
    #[serde(rename = "TPm")]
    TokensPerMinute,
    #[serde(rename = "TPM")]
    TokensPerMonth,
    #[serde(rename = "RPM")]
    RequestsPerMonth,
}

impl LimitKind {
    /// Parse one of the wire codes (`RPS`, `RPm`, `RPD`, `TPm`, `TPM`, `RPM`).
    /// Case matters: the lowercase `m` codes are per-minute, uppercase per-month.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "RPS" => Some(Self::RequestsPerSecond),
            "RPm" => Some(Self::RequestsPerMinute),
            "RPD" => Some(Self::RequestsPerDay),
            "TPm" => Some(Self::TokensPerMinute),
            "TPM" => Some(Self::TokensPerMonth),
            "RPM" => Some(Self::RequestsPerMonth),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::RequestsPerSecond => "RPS",
            Self::RequestsPerMinute => "RPm",
            Self::RequestsPerDay => "RPD",
            Self::TokensPerMinute => "TPm",
            Self::TokensPerMonth => "TPM",
            Self::RequestsPerMonth => "RPM",
        }
    }

    /// True for the token-counting dimensions (`TPm`, `TPM`).
    pub fn is_token_based(&self) -> bool {
        matches!(self, Self::TokensPerMinute | Self::TokensPerMonth)
    }
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// One rate-limit entry: a dimension and its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    #[serde(rename = "type")]
    pub kind: LimitKind,
    pub limit: u64,
}

impl LimitSpec {
    pub fn new(kind: LimitKind, limit: u64) -> Self {
        Self { kind, limit }
    }
}

/// Synthetic model name under which resolvers deliver key-wide defaults.
pub const DEFAULT_MODEL_KEY: &str = "__default__";

/// One API key as produced by a key resolver: the secret itself, a
/// human-readable label (also used to namespace persisted usage), the
/// key-wide default limits, per-model overrides, and an optional fixed
/// inter-request delay for keys without structured limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub default_limits: Vec<LimitSpec>,
    #[serde(default)]
    pub model_limits: HashMap<String, Vec<LimitSpec>>,
    #[serde(default)]
    pub fallback_delay_ms: Option<u64>,
}

impl KeyConfig {
    /// Effective limit set for `model`: start from the defaults, override
    /// entries whose kind also appears in the model's list, then append the
    /// model entries with no default counterpart.
    pub fn active_limits(&self, model: Option<&str>) -> Vec<LimitSpec> {
        let mut merged = self.default_limits.clone();
        let Some(model) = model else {
            return merged;
        };
        let Some(overrides) = self.model_limits.get(model) else {
            return merged;
        };
        for spec in overrides {
            match merged.iter_mut().find(|m| m.kind == spec.kind) {
                Some(existing) => existing.limit = spec.limit,
                None => merged.push(*spec),
            }
        }
        merged
    }

    /// Whether any limit applies to `model` (defaults included).
    pub fn has_limits_for(&self, model: Option<&str>) -> bool {
        !self.active_limits(model).is_empty()
    }
}

/// Startup-time errors shared by the binaries. Scheduling and provider
/// errors have their own types closer to the engine.
#[derive(thiserror::Error, Debug)]
pub enum SwitchboardError {
    /// Configuration was incomplete or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The key resolver could not produce a usable key set at startup.
    #[error("bootstrap error: {0}")]
    Bootstrap(String),
}

/// Convenient alias for results that use [`SwitchboardError`].
pub type Result<T> = std::result::Result<T, SwitchboardError>;
