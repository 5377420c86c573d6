//! Postgres-backed entity stores.

mod entities;
mod store;
mod util;

pub use store::{PgEntity, PgStore};
pub use util::map_sqlx_error;

use std::sync::Arc;

use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    query,
};

use crate::application::repos::Stores;

#[derive(Clone)]
pub struct PostgresStores {
    pool: Arc<PgPool>,
}

impl PostgresStores {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(pool).await
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }

    /// One store per entity table, sharing the pool.
    pub fn stores(&self) -> Stores {
        Stores {
            accounts: Arc::new(PgStore::new(self.pool.clone())),
            follows: Arc::new(PgStore::new(self.pool.clone())),
            blocks: Arc::new(PgStore::new(self.pool.clone())),
            list_entries: Arc::new(PgStore::new(self.pool.clone())),
            emojis: Arc::new(PgStore::new(self.pool.clone())),
            media: Arc::new(PgStore::new(self.pool.clone())),
            statuses: Arc::new(PgStore::new(self.pool.clone())),
            domain_permissions: Arc::new(PgStore::new(self.pool.clone())),
        }
    }
}
