//! Path conversion between the host and guest filesystem namespaces.

use std::path::PathBuf;

use super::{QueryError, run_output};

/// Undo gpgconf's percent-escaping of the drive-letter colon.
pub fn decode_gpgconf_path(raw: &str) -> String {
    raw.replacen("%3a", ":", 1).trim().to_string()
}

/// Converts paths reported by the host into paths usable locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathTranslator {
    /// Both sides share one namespace.
    Identity,
    /// Host paths are Windows paths, translated with `wslpath -a`.
    Wsl { program: String },
}

impl PathTranslator {
    pub fn wsl(program: impl Into<String>) -> Self {
        Self::Wsl {
            program: program.into(),
        }
    }

    pub async fn translate(&self, path: &str) -> Result<PathBuf, QueryError> {
        match self {
            Self::Identity => Ok(PathBuf::from(path)),
            Self::Wsl { program } => {
                let output = run_output(program, &["-a", path]).await?;
                Ok(PathBuf::from(output.trim()))
            }
        }
    }
}
