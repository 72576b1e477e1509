use itertools::Itertools;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

const STAGING_EXTENSION: &str = "dat";

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Failed to access staging file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Directory {0:?} is empty or contains a ',' and can't be staged")]
    InvalidPath(PathBuf),
}

/// Kind of directory list a staging file carries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StagingTag {
    /// directories a node creates and populates
    Create,
    /// directories a node removes
    Delete,
}

impl StagingTag {
    fn suffix(self) -> &'static str {
        match self {
            Self::Create => "C",
            Self::Delete => "D",
        }
    }
}

/// Directory holding one flat file per node, used to hand directory lists to
/// remotely launched workers that only receive the staging directory
#[derive(Clone, Debug)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<stagedir>/<host>_<tag>.dat`
    pub fn path(&self, host: &str, tag: StagingTag) -> PathBuf {
        self.dir
            .join(format!("{host}_{}.{STAGING_EXTENSION}", tag.suffix()))
    }

    /// replace the staging file of `host` with the comma joined `dirs`
    pub fn write(&self, host: &str, tag: StagingTag, dirs: &[PathBuf]) -> Result<(), StagingError> {
        let path = self.path(host, tag);

        if let Some(invalid) = dirs
            .iter()
            .find(|dir| dir.as_os_str().is_empty() || dir.to_string_lossy().contains(','))
        {
            return Err(StagingError::InvalidPath(invalid.clone()));
        }

        let content = dirs.iter().map(|dir| dir.to_string_lossy()).join(",");

        fs::write(&path, content).map_err(|source| StagingError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(path = ?path, count = dirs.len(), "Wrote staging file");

        Ok(())
    }

    /// the entries are taken verbatim, surrounding whitespace is part of a path
    pub fn read(&self, host: &str, tag: StagingTag) -> Result<Vec<PathBuf>, StagingError> {
        let path = self.path(host, tag);
        let content = fs::read_to_string(&path).map_err(|source| StagingError::Io { path, source })?;

        if content.is_empty() {
            return Ok(Vec::new());
        }

        Ok(content.split(',').map(PathBuf::from).collect())
    }

    /// delete every staging file, returns the number of removed files
    pub fn cleanup(&self) -> Result<usize, StagingError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StagingError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut removed = 0;

        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();

            if path.extension().map_or(false, |ext| ext == STAGING_EXTENSION) && path.is_file() {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(error) => warn!(path = ?path, error = ?error, "Failed to remove staging file"),
                }
            }
        }

        debug!(removed = removed, "Cleaned up staging files");

        Ok(removed)
    }
}
