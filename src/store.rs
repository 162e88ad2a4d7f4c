use std::collections::BTreeSet;

use anyhow::{Context, Result};
use scylla::frame::types::Consistency;
use scylla::statement::prepared_statement::PreparedStatement;
use scylla::transport::errors::{DbError, QueryError};
use scylla::{Session, SessionBuilder};
use tracing::info;

use crate::dispatcher::{StoreClient, StoreError, StoreErrorKind};
use crate::workload::{Request, RequestKind};

const TABLE: &str = "ycsb.usertable";
const KEY_COLUMN: &str = "y_id";

/// Store client backed by a Scylla/Cassandra session, with the multi-key
/// read and the single-row insert prepared once up front.
pub struct ScyllaStore {
    session: Session,
    fields: Vec<String>,
    read_stmt: PreparedStatement,
    write_stmt: PreparedStatement,
}

impl ScyllaStore {
    pub async fn connect(
        nodes: &[String],
        fields: &[String],
        consistency: Consistency,
    ) -> Result<Self> {
        let session = SessionBuilder::new()
            .known_nodes(nodes)
            .build()
            .await
            .with_context(|| format!("Failed to connect to {}", nodes.join(",")))?;
        info!(nodes = %nodes.join(","), "Connected to cluster");

        // Requests carry their fields in sorted order; bind markers follow suit.
        let fields: Vec<String> = fields
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut read_stmt = session
            .prepare(read_statement(&fields).as_str())
            .await
            .context("Failed to prepare the read statement")?;
        read_stmt.set_consistency(consistency);

        let mut write_stmt = session
            .prepare(write_statement(&fields).as_str())
            .await
            .context("Failed to prepare the write statement")?;
        write_stmt.set_consistency(consistency);

        Ok(Self {
            session,
            fields,
            read_stmt,
            write_stmt,
        })
    }
}

#[async_trait]
impl StoreClient for ScyllaStore {
    async fn execute(&self, request: &Request) -> Result<(), StoreError> {
        if !request.fields().iter().eq(self.fields.iter()) {
            return Err(StoreError::new(
                StoreErrorKind::Validation,
                "request fields do not match the prepared statements",
            ));
        }
        let result = match request.kind() {
            RequestKind::Read => {
                let keys: Vec<String> = request.keys().iter().cloned().collect();
                let limit = keys.len() as i32;
                self.session
                    .execute(&self.read_stmt, (keys, limit))
                    .await
                    .map(|_| ())
            }
            RequestKind::Write => {
                let mut row: Vec<String> = Vec::with_capacity(request.values().len() + 1);
                row.extend(request.keys().iter().cloned());
                row.extend(
                    request
                        .values()
                        .values()
                        .map(|value| String::from_utf8_lossy(value).into_owned()),
                );
                self.session
                    .execute(&self.write_stmt, row)
                    .await
                    .map(|_| ())
            }
        };
        result.map_err(|err| StoreError::new(classify(&err), err.to_string()))
    }
}

fn read_statement(fields: &[String]) -> String {
    format!(
        "SELECT {} FROM {} WHERE {} IN ? LIMIT ?",
        fields.join(", "),
        TABLE,
        KEY_COLUMN
    )
}

fn write_statement(fields: &[String]) -> String {
    let markers = vec!["?"; fields.len() + 1].join(", ");
    format!(
        "INSERT INTO {} ({}, {}) VALUES ({})",
        TABLE,
        KEY_COLUMN,
        fields.join(", "),
        markers
    )
}

/// Maps driver errors to the classes the latency recorder cares about.
pub fn classify(err: &QueryError) -> StoreErrorKind {
    match err {
        QueryError::DbError(db_error, _) => match db_error {
            DbError::Unavailable { .. } => StoreErrorKind::Unavailable,
            DbError::Overloaded { .. } => StoreErrorKind::Overloaded,
            DbError::IsBootstrapping { .. } => StoreErrorKind::Bootstrapping,
            DbError::Unprepared { .. } => StoreErrorKind::Unprepared,
            DbError::SyntaxError { .. }
            | DbError::Invalid { .. }
            | DbError::AlreadyExists { .. }
            | DbError::Unauthorized { .. }
            | DbError::ConfigError { .. } => StoreErrorKind::Validation,
            _ => StoreErrorKind::Other,
        },
        QueryError::BadQuery(_) => StoreErrorKind::Validation,
        _ => StoreErrorKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_list_fields_in_bind_order() {
        let fields = vec!["field0".to_owned(), "field1".to_owned()];
        assert_eq!(
            read_statement(&fields),
            "SELECT field0, field1 FROM ycsb.usertable WHERE y_id IN ? LIMIT ?"
        );
        assert_eq!(
            write_statement(&fields),
            "INSERT INTO ycsb.usertable (y_id, field0, field1) VALUES (?, ?, ?)"
        );
    }

    #[test]
    fn classifies_coordinator_fast_paths() {
        let db = |e| QueryError::DbError(e, "test".to_owned());
        assert_eq!(classify(&db(DbError::Overloaded)), StoreErrorKind::Overloaded);
        assert_eq!(
            classify(&db(DbError::IsBootstrapping)),
            StoreErrorKind::Bootstrapping
        );
        assert_eq!(classify(&db(DbError::SyntaxError)), StoreErrorKind::Validation);
        assert_eq!(classify(&db(DbError::ServerError)), StoreErrorKind::Other);
    }
}
