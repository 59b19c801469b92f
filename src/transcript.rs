use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::job::JobId;
use crate::request::RequestMetadata;

/// A timed span of transcript text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub text: String,
    /// Backend-reported confidence in `0.0..=1.0`, when the backend provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Word-level timings, only filled when requested and supported.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<Word>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability: Option<f32>,
}

/// A backend attempt that failed before the one that produced the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub method: BackendKind,
    pub code: String,
    pub message: String,
}

/// The outcome of one successful job. Produced exactly once per job.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionResult {
    pub job_id: JobId,
    pub text: String,
    pub segments: Vec<Segment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub duration_seconds: f64,
    pub processing_time_ms: u64,
    /// The backend that actually produced this result.
    pub method: BackendKind,
    pub model: String,
    /// Estimated monetary cost in USD.
    pub cost_estimate: f64,
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<FailedAttempt>,
    pub metadata: RequestMetadata,
}

impl TranscriptionResult {
    /// A result with routing fields left at their defaults; the router fills them in.
    pub fn new(method: BackendKind, model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            job_id: JobId::new(),
            text: text.into(),
            segments: Vec::new(),
            language: None,
            duration_seconds: 0.0,
            processing_time_ms: 0,
            method,
            model: model.into(),
            cost_estimate: 0.0,
            fallback_used: false,
            attempts: Vec::new(),
            metadata: RequestMetadata::default(),
        }
    }
}

/// Join segment texts the way whisper-style backends print them.
pub fn join_segments(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(text: &str) -> Segment {
        Segment {
            start_seconds: 0.0,
            end_seconds: 1.0,
            text: text.to_owned(),
            confidence: None,
            words: Vec::new(),
        }
    }

    #[test]
    fn join_segments_trims_and_skips_blank_text() {
        let joined = join_segments(&[seg(" Treat."), seg("  "), seg("Yo. Self. ")]);
        assert_eq!(joined, "Treat. Yo. Self.");
    }

    #[test]
    fn result_serializes_backend_name() -> anyhow::Result<()> {
        let result = TranscriptionResult::new(BackendKind::Docker, "base", "hi");
        let json = serde_json::to_value(&result)?;
        assert_eq!(json["method"], "docker");
        assert_eq!(json["fallback_used"], false);
        assert!(json.get("attempts").is_none());
        Ok(())
    }
}
