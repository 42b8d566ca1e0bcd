//! Secret store seam for database credentials
//!
//! References are `scheme:location` strings. [`LocalSecretStore`] understands
//! `file:<path>` and `env:<VARIABLE>`; deployments backed by a managed secret
//! service plug in their own [`SecretStore`].

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Unsupported secret reference '{0}': expected file:<path> or env:<VARIABLE>")]
    Unsupported(String),

    #[error("Failed to read secret file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Secret environment variable {0} is not set")]
    MissingEnv(String),

    #[error("Secret is not valid credential JSON: {0}")]
    Invalid(String),
}

/// Fetches the raw secret payload for a reference
pub trait SecretStore {
    fn fetch(&self, reference: &str) -> Result<String, SecretError>;
}

/// Reads secrets from mounted files and environment variables
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSecretStore;

impl SecretStore for LocalSecretStore {
    fn fetch(&self, reference: &str) -> Result<String, SecretError> {
        match reference.split_once(':') {
            Some(("file", path)) if !path.is_empty() => {
                let path = PathBuf::from(path);
                std::fs::read_to_string(&path).map_err(|source| SecretError::Io { path, source })
            }
            Some(("env", name)) if !name.is_empty() => {
                std::env::var(name).map_err(|_| SecretError::MissingEnv(name.to_string()))
            }
            _ => Err(SecretError::Unsupported(reference.to_string())),
        }
    }
}
