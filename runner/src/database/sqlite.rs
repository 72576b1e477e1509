use crate::{completion::RunReport, database::ConnectionError};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection};
use std::{fmt::Debug, path::Path, sync::Arc};
use tracing::{debug, error, info};
use tracing_unwrap::ResultExt;

#[derive(Debug)]
/// Transparent, thread safe wrapper over `InnerConnection`
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
}

impl From<rusqlite::Error> for ConnectionError {
    fn from(error: rusqlite::Error) -> Self {
        ConnectionError::SQLite(error)
    }
}

impl SharedConnection {
    pub fn new(inner_connection: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner_connection)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    pub fn close(self) -> Result<(), ConnectionError> {
        Arc::try_unwrap(self.0).unwrap_or_log().into_inner().close()
    }

    pub fn load(path: &Path) -> Result<Self, ConnectionError> {
        let mut inner = InnerConnection::load(path)?;
        inner.init()?;

        Ok(Self::new(inner))
    }

    pub fn store(&self, report: &RunReport) -> Result<i64, ConnectionError> {
        self.lock().store(report)
    }
}

impl InnerConnection {
    pub fn load(path: &Path) -> Result<Self, ConnectionError> {
        let connection = Connection::open(path)?;

        info!(path = ?path, "Opened SQLite database");

        Ok(Self { connection })
    }

    pub fn init(&mut self) -> Result<(), ConnectionError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(ConnectionError::SQLite(error));
                }
            };

            counter += 1;
        }

        Ok(())
    }

    pub fn close(mut self) -> Result<(), ConnectionError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!("Giving up on closing the SQLite connection");

                return Err(ConnectionError::SQLite(error));
            }
        }

        info!("Closed SQLite connection");

        Ok(())
    }

    /// insert the run and one row per worker in a single transaction, returns the run id
    pub fn store(&self, report: &RunReport) -> Result<i64, ConnectionError> {
        // NOTE: only one connection exists per process, so no nested transactions
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

        let run: i64 = tx
            .prepare_cached(
                "insert into runs
                 (name, host, success, workers, detached)
                 values (?, ?, ?, ?, ?) returning id",
            )?
            .query_row(
                params![
                    report.name.as_str(),
                    report.host.as_str(),
                    report.success(),
                    report.outcomes.len() as i64,
                    report.detached.len() as i64
                ],
                |row| row.get(0),
            )?;

        for outcome in report.outcomes.iter() {
            tx.prepare_cached(
                "insert into workers
                 (run, slot, label, pid, kind, code, elapsed_ms)
                 values (?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                run,
                outcome.slot as i64,
                outcome.label.as_str(),
                outcome.pid as i64,
                outcome.kind as i8,
                outcome.code,
                outcome.elapsed_ms as i64
            ])?;
        }
        tx.commit()?;

        debug!(id = run, workers = report.outcomes.len(), "Stored run");

        Ok(run)
    }
}

pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists runs (
    id integer primary key,
    name text not null,
    host text not null,
    success boolean not null,
    workers integer not null,
    detached integer not null,
    recorded_at integer not null default (strftime('%s', 'now'))
);",
    "create table if not exists workers (
    id integer primary key,
    run integer not null references runs (id),
    slot integer not null,
    label text not null,
    pid integer not null,
    kind tinyint not null,
    code integer,
    elapsed_ms integer not null
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
