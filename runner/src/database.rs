#[cfg(feature = "rusqlite")]
pub mod sqlite;

use crate::{completion::RunReport, config::DatabaseConfig};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[cfg(feature = "rusqlite")]
    #[error("SQLite error: {0}")]
    SQLite(rusqlite::Error),
    #[error("Storage backend {0} was not compiled in")]
    Unavailable(&'static str),
}

/// Where finished run reports end up
#[derive(Debug)]
pub enum StorageAdapters {
    /// reports are only logged
    Null,
    #[cfg(feature = "rusqlite")]
    SQLite(sqlite::SharedConnection),
}

impl StorageAdapters {
    pub fn load(config: Option<&DatabaseConfig>) -> Result<Self, ConnectionError> {
        match config {
            None => Ok(Self::Null),
            #[cfg(feature = "rusqlite")]
            Some(config) => Ok(Self::SQLite(sqlite::SharedConnection::load(&config.path)?)),
            #[cfg(not(feature = "rusqlite"))]
            Some(_) => Err(ConnectionError::Unavailable("sqlite")),
        }
    }

    pub fn store(&self, report: &RunReport) -> Result<(), ConnectionError> {
        match self {
            Self::Null => {
                debug!(name = %report.name, "No database configured, dropping report");

                Ok(())
            }
            #[cfg(feature = "rusqlite")]
            Self::SQLite(connection) => connection.store(report).map(|_| ()),
        }
    }

    pub fn close(self) -> Result<(), ConnectionError> {
        match self {
            Self::Null => Ok(()),
            #[cfg(feature = "rusqlite")]
            Self::SQLite(connection) => connection.close(),
        }
    }
}
