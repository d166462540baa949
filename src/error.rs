use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The primary error type for all operations in the `mftar` crate.
///
/// Every variant is fatal to the run: nothing is retried and nothing is
/// silently downgraded. The only intentional non-error drops are `exclude`
/// matches and directory-policy discards, which never surface here.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A mode expression failed the chmod grammar. Carries the whole
    /// offending expression, never a partially applied one.
    #[error("invalid mode expression `{0}`")]
    Grammar(String),

    /// A JSON value in the manifest stream could not be decoded. The offset
    /// is absolute from the start of the whole stream, not the current chunk.
    #[error("manifest decode error at offset {offset}: {message}")]
    ManifestDecode { offset: u64, message: String },

    /// The manifest asked for something structurally impossible: multiple
    /// special-type markers, `recursive` combined with transformed content,
    /// a missing required `source`, and friends.
    #[error("{0}")]
    Schema(String),

    /// An I/O error tied to a specific filesystem path.
    #[error("I/O error on path `{path}`: {source}")]
    Filesystem { source: io::Error, path: PathBuf },

    /// An external filter command exited with a non-zero status.
    #[error("filter command {command:?} exited with status {status}")]
    FilterProcess { command: Vec<String>, status: i32 },

    /// Invalid configuration: unknown directory policy, a malformed
    /// definitions file, an undefined `${variable}`, a bad `exclude` regex.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error on the output stream itself.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BuildError {
    /// Attach a path to a bare I/O error.
    pub fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BuildError::Filesystem { source, path: path.into() }
    }
}
