//! Generic entity store over one table.
//!
//! Statements are assembled at runtime from the entity's column list and the
//! lookup columns its cache declares.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, postgres::PgRow};
use uuid::Uuid;

use super::util::{key_cast, map_sqlx_error, nullable_key};
use crate::application::repos::{EntityStore, RepoError};
use crate::cache::{Cacheable, IndexKey, Lookup};

/// Table mapping for a stored entity.
pub trait PgEntity: Cacheable + for<'r> FromRow<'r, PgRow> + Send + Unpin {
    const TABLE: &'static str;

    /// Persisted columns; `id` first.
    const COLUMNS: &'static [&'static str];

    /// Bind this row's value for `column`.
    fn push_value(&self, column: &str, qb: &mut QueryBuilder<'_, Postgres>)
    -> Result<(), RepoError>;
}

pub(super) fn unknown_column<T: PgEntity>(column: &str) -> RepoError {
    RepoError::invalid_input(format!("unknown column `{column}` on {}", T::TABLE))
}

pub struct PgStore<T> {
    pool: Arc<PgPool>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: PgEntity> PgStore<T> {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            _entity: PhantomData,
        }
    }

    fn select(qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push("SELECT ");
        qb.push(T::COLUMNS.join(", "));
        qb.push(" FROM ");
        qb.push(T::TABLE);
    }

    fn push_key_filter(
        qb: &mut QueryBuilder<'_, Postgres>,
        key: &IndexKey<T::Lookup>,
    ) -> Result<(), RepoError> {
        let columns = key.lookup().columns();
        if columns.len() != key.parts().len() {
            return Err(RepoError::invalid_input(format!(
                "lookup {} expects {} parts, got {}",
                key.lookup().name(),
                columns.len(),
                key.parts().len()
            )));
        }

        qb.push(" WHERE ");
        for (index, (column, part)) in columns.iter().zip(key.parts()).enumerate() {
            if index > 0 {
                qb.push(" AND ");
            }
            qb.push(*column);
            if part.is_empty() && nullable_key(column) {
                qb.push(" IS NULL");
                continue;
            }
            qb.push(" = ");
            qb.push_bind(part.clone());
            qb.push(key_cast(column));
        }
        Ok(())
    }

    fn check_columns(columns: &[&'static str]) -> Result<(), RepoError> {
        match columns.iter().find(|column| !T::COLUMNS.contains(column)) {
            Some(column) => Err(unknown_column::<T>(column)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<T: PgEntity> EntityStore<T> for PgStore<T> {
    async fn get_by(&self, key: &IndexKey<T::Lookup>) -> Result<T, RepoError> {
        let mut qb = QueryBuilder::new("");
        Self::select(&mut qb);
        Self::push_key_filter(&mut qb, key)?;
        qb.push(" LIMIT 1");
        qb.build_query_as::<T>()
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(map_sqlx_error)
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<T>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::new("");
        Self::select(&mut qb);
        qb.push(" WHERE id = ANY(");
        qb.push_bind(ids.to_vec());
        qb.push(")");
        qb.build_query_as::<T>()
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(map_sqlx_error)
    }

    async fn list_by(&self, key: &IndexKey<T::Lookup>) -> Result<Vec<T>, RepoError> {
        let mut qb = QueryBuilder::new("");
        Self::select(&mut qb);
        Self::push_key_filter(&mut qb, key)?;
        qb.push(" ORDER BY id");
        qb.build_query_as::<T>()
            .fetch_all(self.pool.as_ref())
            .await
            .map_err(map_sqlx_error)
    }

    async fn insert(&self, value: &T) -> Result<(), RepoError> {
        let mut qb = QueryBuilder::new("INSERT INTO ");
        qb.push(T::TABLE);
        qb.push(" (");
        qb.push(T::COLUMNS.join(", "));
        qb.push(") VALUES (");
        for (index, column) in T::COLUMNS.iter().enumerate() {
            if index > 0 {
                qb.push(", ");
            }
            value.push_value(column, &mut qb)?;
        }
        qb.push(")");

        qb.build()
            .execute(self.pool.as_ref())
            .await
            .map(|_| ())
            .map_err(map_sqlx_error)
    }

    async fn update(&self, value: &T, columns: &[&'static str]) -> Result<(), RepoError> {
        Self::check_columns(columns)?;
        let columns: Vec<&'static str> = if columns.is_empty() {
            T::COLUMNS.iter().copied().filter(|c| *c != "id").collect()
        } else {
            columns.iter().copied().filter(|c| *c != "id").collect()
        };
        if columns.is_empty() {
            return Ok(());
        }

        let mut qb = QueryBuilder::new("UPDATE ");
        qb.push(T::TABLE);
        qb.push(" SET ");
        for (index, column) in columns.iter().enumerate() {
            if index > 0 {
                qb.push(", ");
            }
            qb.push(*column);
            qb.push(" = ");
            value.push_value(column, &mut qb)?;
        }
        qb.push(" WHERE id = ");
        qb.push_bind(value.id());

        let result = qb
            .build()
            .execute(self.pool.as_ref())
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn delete_many(&self, ids: &[Uuid]) -> Result<u64, RepoError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::new("DELETE FROM ");
        qb.push(T::TABLE);
        qb.push(" WHERE id = ANY(");
        qb.push_bind(ids.to_vec());
        qb.push(")");
        qb.build()
            .execute(self.pool.as_ref())
            .await
            .map(|result| result.rows_affected())
            .map_err(map_sqlx_error)
    }
}
