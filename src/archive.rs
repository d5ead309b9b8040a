use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use bytes::Bytes;

/// Flat directory of recorded response bodies, one file per matcher, named by
/// the matcher's artifact name. Contents are written once and never modified.
#[derive(Debug, Clone)]
pub struct ResponseArchive {
    dir: PathBuf,
}

#[derive(Debug)]
pub enum ArchiveError {
    /// A matcher references this artifact but the backing file is gone or
    /// unreadable: persisted state is corrupt.
    Missing {
        artifact_name: String,
        source: io::Error,
    },
    /// The artifact name would escape the archive directory.
    InvalidName { artifact_name: String },
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing {
                artifact_name,
                source,
            } => write!(f, "read stored artifact `{artifact_name}`: {source}"),
            Self::InvalidName { artifact_name } => {
                write!(f, "artifact name `{artifact_name}` contains path separators")
            }
        }
    }
}

impl std::error::Error for ArchiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Missing { source, .. } => Some(source),
            Self::InvalidName { .. } => None,
        }
    }
}

impl ResponseArchive {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create responses dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Exact bytes previously recorded under `artifact_name`. A missing file
    /// is an integrity error, never an empty body.
    pub fn read(&self, artifact_name: &str) -> Result<Bytes, ArchiveError> {
        let path = self.artifact_path(artifact_name)?;
        match fs::read(path) {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(source) => Err(ArchiveError::Missing {
                artifact_name: artifact_name.to_owned(),
                source,
            }),
        }
    }

    pub fn write(&self, artifact_name: &str, body: &[u8]) -> anyhow::Result<()> {
        let path = self.artifact_path(artifact_name)?;
        fs::write(&path, body)
            .with_context(|| format!("write artifact {}", path.display()))?;
        Ok(())
    }

    // Generated names are already sanitized; this guards against hand-edited
    // matcher documents.
    fn artifact_path(&self, artifact_name: &str) -> Result<PathBuf, ArchiveError> {
        if artifact_name.is_empty()
            || artifact_name.contains('/')
            || artifact_name.contains('\\')
            || artifact_name == "."
            || artifact_name == ".."
        {
            return Err(ArchiveError::InvalidName {
                artifact_name: artifact_name.to_owned(),
            });
        }
        Ok(self.dir.join(artifact_name))
    }
}
