//! Database-specific error types and conversions.

use tiae_core::error::TiaeError;

/// Database-layer error type.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("record not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("invalid database configuration: {0}")]
    Config(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("a tenant is already attached to this context")]
    TenantAlreadyAttached,

    #[error("no tenant attached to this context")]
    NoTenant,
}

impl From<DbError> for TiaeError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { entity, id } => TiaeError::NotFound { entity, id },
            DbError::Sqlx(e) => sqlx_to_tiae(e),
            other => TiaeError::Internal(other.to_string()),
        }
    }
}

fn sqlx_to_tiae(err: sqlx::Error) -> TiaeError {
    if is_unique_violation(&err) {
        return TiaeError::AlreadyExists {
            entity: constraint_entity(&err),
        };
    }
    if is_transient(&err) {
        return TiaeError::Transient(err.to_string());
    }
    match err {
        sqlx::Error::RowNotFound => TiaeError::NotFound {
            entity: "row".into(),
            id: String::new(),
        },
        other => TiaeError::Internal(format!("database error: {other}")),
    }
}

/// Postgres SQLSTATE `23505`.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().map(|code| code == "23505").unwrap_or(false);
    }
    false
}

/// Failures where retrying the same statement may succeed.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Tls(_) | sqlx::Error::WorkerCrashed => true,
        // serialization_failure, deadlock_detected, query_canceled (statement timeout)
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some("40001") | Some("40P01") | Some("57014")
        ),
        _ => false,
    }
}

fn constraint_entity(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .table()
            .or(db_err.constraint())
            .unwrap_or("record")
            .trim_end_matches('s')
            .to_string(),
        _ => "record".into(),
    }
}

/// Map a write error, reporting unique violations as `AlreadyExists` for
/// `entity`.
pub(crate) fn unique_as(entity: &'static str) -> impl FnOnce(sqlx::Error) -> TiaeError {
    move |err| {
        if is_unique_violation(&err) {
            TiaeError::already_exists(entity)
        } else {
            DbError::from(err).into()
        }
    }
}

pub(crate) fn db_err(err: sqlx::Error) -> TiaeError {
    DbError::from(err).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiae_core::error::ErrorKind;

    #[test]
    fn pool_timeouts_are_transient() {
        let err: TiaeError = DbError::from(sqlx::Error::PoolTimedOut).into();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn cancellation_is_internal() {
        let err: TiaeError = DbError::Cancelled.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("request cancelled"));
    }

    #[test]
    fn not_found_is_preserved() {
        let err: TiaeError = DbError::NotFound {
            entity: "tenant".into(),
            id: "acme".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn unique_as_passes_other_errors_through() {
        let err = unique_as("tenant")(sqlx::Error::PoolClosed);
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
