//! Transcription requests as submitted by callers.
//!
//! A [`TranscriptionRequest`] is immutable once handed to the router; the router only reads
//! from it while walking the fallback chain.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::error::{Error, Result};

/// Which backend the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    /// Let the router pick by priority tier and health.
    #[default]
    Auto,
    /// Use this backend first.
    Backend(BackendKind),
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Backend(kind) => kind.fmt(f),
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim().to_ascii_lowercase();
        if raw.is_empty() || raw == "auto" {
            return Ok(Self::Auto);
        }
        raw.parse::<BackendKind>().map(Self::Backend).map_err(|_| {
            Error::validation(
                "INVALID_METHOD",
                format!("unknown method '{s}' (expected 'auto', 'cloud', 'local' or 'docker')"),
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Transcribe,
    /// Translate speech to English.
    Translate,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcribe => "transcribe",
            Self::Translate => "translate",
        }
    }
}

impl FromStr for Task {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "transcribe" => Ok(Self::Transcribe),
            "translate" => Ok(Self::Translate),
            other => Err(Error::validation(
                "VALIDATION_ERROR",
                format!("unknown task '{other}' (expected 'transcribe' or 'translate')"),
            )),
        }
    }
}

/// Cost/latency trade-off used to order backends for `Method::Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Prefer backends that cost nothing per request.
    Cost,
    #[default]
    Balanced,
    /// Prefer the backend with the lowest expected latency.
    Speed,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cost => "cost",
            Self::Balanced => "balanced",
            Self::Speed => "speed",
        }
    }

    /// Backends in preference order for this tier, before health is taken into account.
    pub fn preference_order(&self) -> [BackendKind; 3] {
        match self {
            Self::Cost => [BackendKind::Local, BackendKind::Docker, BackendKind::Cloud],
            Self::Balanced => [BackendKind::Docker, BackendKind::Local, BackendKind::Cloud],
            Self::Speed => [BackendKind::Cloud, BackendKind::Docker, BackendKind::Local],
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cost" | "cost-optimized" | "cheap" | "low" => Ok(Self::Cost),
            "balanced" | "normal" | "medium" => Ok(Self::Balanced),
            "speed" | "latency" | "latency-optimized" | "fast" | "high" => Ok(Self::Speed),
            other => Err(Error::validation(
                "VALIDATION_ERROR",
                format!("unknown priority '{other}' (expected 'cost', 'balanced' or 'speed')"),
            )),
        }
    }
}

/// Caller-supplied context echoed back on the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// A request to transcribe one audio file.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    /// Audio file already staged on local disk.
    pub file: PathBuf,
    pub method: Method,
    /// Model identifier; `None` lets the backend use its default.
    pub model: Option<String>,
    /// Language hint (e.g. `"en"`); `None` means auto-detect.
    pub language: Option<String>,
    pub task: Task,
    /// `None` falls back to the router's configured default tier.
    pub priority: Option<Priority>,
    pub word_timestamps: bool,
    pub fallback_enabled: bool,
    pub metadata: RequestMetadata,
}

impl TranscriptionRequest {
    /// A request with router-chosen backend, fallback enabled and default options.
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            method: Method::Auto,
            model: None,
            language: None,
            task: Task::Transcribe,
            priority: None,
            word_timestamps: false,
            fallback_enabled: true,
            metadata: RequestMetadata::default(),
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    /// Reject requests that can't be dispatched at all.
    pub fn validate(&self) -> Result<()> {
        if self.file.as_os_str().is_empty() {
            return Err(Error::validation("VALIDATION_ERROR", "no audio file provided"));
        }
        if !self.file.is_file() {
            return Err(Error::validation(
                "VALIDATION_ERROR",
                format!("audio file not found: {}", self.file.display()),
            ));
        }
        if self.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return Err(Error::validation("VALIDATION_ERROR", "model must not be blank"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parses_auto_and_backend_names_case_insensitively() -> anyhow::Result<()> {
        assert_eq!("auto".parse::<Method>()?, Method::Auto);
        assert_eq!("".parse::<Method>()?, Method::Auto);
        assert_eq!(" Local ".parse::<Method>()?, Method::Backend(BackendKind::Local));
        assert_eq!("openai".parse::<Method>()?, Method::Backend(BackendKind::Cloud));
        assert_eq!("container".parse::<Method>()?, Method::Backend(BackendKind::Docker));
        Ok(())
    }

    #[test]
    fn unknown_method_is_invalid_method() {
        let err = "gpu-farm".parse::<Method>().unwrap_err();
        assert_eq!(err.code(), "INVALID_METHOD");
        assert!(err.to_string().contains("gpu-farm"));
    }

    #[test]
    fn priority_aliases_map_to_tiers() -> anyhow::Result<()> {
        assert_eq!("cost-optimized".parse::<Priority>()?, Priority::Cost);
        assert_eq!("latency".parse::<Priority>()?, Priority::Speed);
        assert_eq!("normal".parse::<Priority>()?, Priority::Balanced);
        assert!("urgent!!".parse::<Priority>().is_err());
        Ok(())
    }

    #[test]
    fn every_tier_orders_all_backends_once() {
        for tier in [Priority::Cost, Priority::Balanced, Priority::Speed] {
            let mut order = tier.preference_order().to_vec();
            order.sort();
            order.dedup();
            assert_eq!(order.len(), 3, "{tier}");
        }
    }

    #[test]
    fn validate_rejects_missing_file() {
        let req = TranscriptionRequest::new("/definitely/not/here.wav");
        let err = req.validate().unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn validate_accepts_existing_file() -> anyhow::Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        TranscriptionRequest::new(file.path()).validate()?;
        Ok(())
    }
}
