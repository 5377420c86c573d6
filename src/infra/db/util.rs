use crate::application::repos::RepoError;

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => RepoError::Duplicate {
            constraint: db.constraint().unwrap_or("unknown").to_string(),
        },
        sqlx::Error::Database(db)
            if db.is_foreign_key_violation() || db.message().contains("invalid input syntax") =>
        {
            RepoError::InvalidInput {
                message: db.message().to_string(),
            }
        }
        sqlx::Error::Database(db) if db.message().contains("violates") => RepoError::Integrity {
            message: db.message().to_string(),
        },
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to user request") =>
        {
            RepoError::Timeout
        }
        sqlx::Error::PoolTimedOut => RepoError::Timeout,
        other => RepoError::from_persistence(other),
    }
}

/// Cast applied to a bound key part for `column`. Key parts travel as text.
pub(super) fn key_cast(column: &str) -> &'static str {
    match column {
        "kind" => "::domain_permission_kind",
        "id" => "::uuid",
        other if other.ends_with("_id") => "::uuid",
        _ => "",
    }
}

/// Whether `column` stores local rows as NULL, matched by an empty key part.
pub(super) fn nullable_key(column: &str) -> bool {
    column == "domain"
}
