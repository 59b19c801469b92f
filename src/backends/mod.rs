//! Built-in backend adapters.

/// Metered OpenAI-compatible transcription API.
pub mod cloud;
/// Containerized whisper ASR webservice with docker lifecycle controls.
pub mod container;
/// whisper.cpp CLI spawned as a child process.
pub mod local;

use std::path::{Path, PathBuf};

use crate::backend::BackendKind;
use crate::error::{Error, Result};

pub use cloud::CloudBackend;
pub use container::ContainerBackend;
pub use local::LocalBackend;

/// Resolve a binary either as an explicit path or by searching `PATH`.
pub(crate) fn resolve_binary(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 {
        return binary.is_file().then(|| binary.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Best guess at an audio file's mime type from its extension.
pub(crate) fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("ogg") | Some("oga") => "audio/ogg",
        Some("flac") => "audio/flac",
        Some("webm") => "audio/webm",
        _ => "application/octet-stream",
    }
}

/// Read an audio file into a multipart part named after the caller's filename.
pub(crate) async fn audio_part(
    kind: BackendKind,
    path: &Path,
    file_name: Option<&str>,
) -> Result<reqwest::multipart::Part> {
    let bytes = tokio::fs::read(path).await.map_err(|err| {
        Error::execution(kind, format!("failed to read '{}': {err}", path.display()))
    })?;
    let name = file_name
        .map(str::to_owned)
        .or_else(|| {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "audio.wav".to_owned());

    reqwest::multipart::Part::bytes(bytes)
        .file_name(name)
        .mime_str(mime_for(path))
        .map_err(|err| Error::execution(kind, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_for_known_and_unknown_extensions() {
        assert_eq!(mime_for(Path::new("a.WAV")), "audio/wav");
        assert_eq!(mime_for(Path::new("talk.m4a")), "audio/mp4");
        assert_eq!(mime_for(Path::new("blob")), "application/octet-stream");
    }

    #[test]
    fn resolve_binary_rejects_missing_explicit_path() {
        assert!(resolve_binary(Path::new("/no/such/dir/whisper-cli")).is_none());
    }

    #[test]
    fn resolve_binary_accepts_existing_explicit_path() -> anyhow::Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        assert_eq!(
            resolve_binary(file.path()).as_deref(),
            Some(file.path())
        );
        Ok(())
    }
}
