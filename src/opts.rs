use crate::request::{Task, TranscriptionRequest};

/// Options that control how a single backend performs a transcription.
///
/// This struct is *adapter-level configuration*, not the caller's request directly.
/// The router maps a [`TranscriptionRequest`] into this type so that:
/// - adapters never see routing concerns (method, priority, fallback)
/// - tests and other frontends can drive an adapter programmatically
#[derive(Debug, Clone, Default)]
pub struct TranscribeOpts {
    /// Model identifier; `None` means the adapter's configured default.
    pub model: Option<String>,

    /// Optional language hint (e.g. `"en"`, `"es"`).
    ///
    /// When `None`, the backend auto-detects the spoken language.
    pub language: Option<String>,

    pub task: Task,

    /// Ask for word-level timestamps. Backends that can't provide them ignore the flag.
    pub word_timestamps: bool,

    /// Thread count hint for process-backed adapters. `None` uses every core.
    pub threads: Option<usize>,

    /// Original filename, kept on the job for diagnostics.
    pub file_name: Option<String>,
}

impl From<&TranscriptionRequest> for TranscribeOpts {
    fn from(req: &TranscriptionRequest) -> Self {
        Self {
            model: req.model.clone(),
            language: req.language.clone(),
            task: req.task,
            word_timestamps: req.word_timestamps,
            threads: None,
            file_name: req.metadata.original_filename.clone().or_else(|| {
                req.file
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            }),
        }
    }
}
