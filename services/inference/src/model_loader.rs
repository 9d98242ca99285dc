//! Model artifact loading with optional Fernet decryption.
//!
//! Encrypted artifacts (`*.enc`) are decrypted in memory and staged in a
//! per-process temporary file that only lives for the duration of the
//! backend's load call.

use crate::config::SecretString;
use argus_pipeline::PipelineError;
use fernet::Fernet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// File name suffix that marks an artifact as encrypted
pub const ENCRYPTED_SUFFIX: &str = ".enc";

pub fn is_encrypted(path: &Path) -> bool {
    path.to_string_lossy().ends_with(ENCRYPTED_SUFFIX)
}

#[derive(Debug, Clone)]
enum Artifact {
    Plain(PathBuf),
    Encrypted { path: PathBuf, key: SecretString },
}

/// Resolves a model path into a form the detector backend can open
#[derive(Debug, Clone)]
pub struct ModelLoader {
    artifact: Artifact,
}

impl ModelLoader {
    /// Decide how `path` must be loaded.
    ///
    /// Fails with a configuration error, before touching the filesystem,
    /// when the artifact is encrypted and no key was provided.
    pub fn resolve(
        path: impl Into<PathBuf>,
        key: Option<SecretString>,
    ) -> Result<Self, PipelineError> {
        let path = path.into();

        let artifact = if is_encrypted(&path) {
            let key = key.filter(|k| !k.expose().trim().is_empty()).ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "MODEL_ENCRYPTION_KEY is required to load encrypted model {}",
                    path.display()
                ))
            })?;
            Artifact::Encrypted { path, key }
        } else {
            Artifact::Plain(path)
        };

        Ok(Self { artifact })
    }

    pub fn path(&self) -> &Path {
        match &self.artifact {
            Artifact::Plain(path) => path,
            Artifact::Encrypted { path, .. } => path,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.artifact, Artifact::Encrypted { .. })
    }

    /// Hand a loadable path to `open` and return what it builds.
    ///
    /// For encrypted artifacts the path points at a decrypted temporary copy
    /// which is removed as soon as `open` returns, whether it succeeded or not.
    pub fn load<M, F>(&self, open: F) -> Result<M, PipelineError>
    where
        F: FnOnce(&Path) -> Result<M, PipelineError>,
    {
        match &self.artifact {
            Artifact::Plain(path) => {
                info!(path = %path.display(), "Loading plaintext model");
                open(path)
            }
            Artifact::Encrypted { path, key } => {
                let cipher = Fernet::new(key.expose().trim()).ok_or_else(|| {
                    PipelineError::Configuration(
                        "MODEL_ENCRYPTION_KEY is not a valid Fernet key".to_string(),
                    )
                })?;

                let token = std::fs::read(path).map_err(|e| {
                    PipelineError::ModelLoad(format!("failed to read {}: {}", path.display(), e))
                })?;

                let plaintext = decrypt(&cipher, &token)?;
                info!(
                    path = %path.display(),
                    size_bytes = plaintext.len(),
                    "Decrypted model artifact"
                );

                let staged = StagedArtifact::write(&plaintext, &staged_suffix(path))?;
                let model = open(staged.path());
                staged.remove();
                model
            }
        }
    }
}

fn decrypt(cipher: &Fernet, token: &[u8]) -> Result<Vec<u8>, PipelineError> {
    let token = std::str::from_utf8(token).map_err(|_| {
        PipelineError::Decryption("model artifact is not a Fernet token".to_string())
    })?;

    cipher.decrypt(token.trim()).map_err(|_| {
        PipelineError::Decryption("wrong key or corrupt model ciphertext".to_string())
    })
}

/// Suffix for the decrypted copy, e.g. `.onnx` for `model.onnx.enc`
fn staged_suffix(path: &Path) -> String {
    path.file_stem()
        .map(Path::new)
        .and_then(Path::extension)
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

/// Decrypted model bytes on disk
struct StagedArtifact {
    file: NamedTempFile,
}

impl StagedArtifact {
    fn write(plaintext: &[u8], suffix: &str) -> Result<Self, PipelineError> {
        let to_load_error =
            |e: std::io::Error| PipelineError::ModelLoad(format!("failed to stage model: {}", e));

        let mut file = tempfile::Builder::new()
            .prefix("argus-model-")
            .suffix(suffix)
            .tempfile()
            .map_err(to_load_error)?;

        file.write_all(plaintext).map_err(to_load_error)?;
        file.as_file().sync_all().map_err(to_load_error)?;

        debug!(path = %file.path().display(), "Staged decrypted model");
        Ok(Self { file })
    }

    fn path(&self) -> &Path {
        self.file.path()
    }

    fn remove(self) {
        let path = self.file.path().to_path_buf();
        match self.file.close() {
            Ok(()) => debug!(path = %path.display(), "Removed decrypted model"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove decrypted model"),
        }
    }
}
