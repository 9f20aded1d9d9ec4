use std::env;

use anyhow::{Context, Result};
use sqlx::{Executor, PgPool};
use uuid::Uuid;

/// Hands out throwaway schemas on a shared Postgres server for sink tests.
pub struct PgFixture {
    admin_url: String,
}

impl PgFixture {
    pub fn from_env() -> Result<Self> {
        let admin_url = env::var("TEST_ADMIN_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .context("TEST_ADMIN_URL or DATABASE_URL must be set for tests")?;
        Ok(Self { admin_url })
    }

    /// Like `from_env`, but yields `None` when no server is configured so a
    /// test can skip itself.
    pub fn try_from_env() -> Option<Self> {
        Self::from_env().ok()
    }

    pub async fn create(&self, prefix: &str) -> Result<SchemaHandle> {
        let schema = format!("{}_{}", prefix, Uuid::new_v4().simple());
        let pool = PgPool::connect(&self.admin_url)
            .await
            .context("connect to test database")?;
        let create_sql = format!("CREATE SCHEMA \"{}\"", schema);
        pool.execute(create_sql.as_str()).await?;
        Ok(SchemaHandle { pool, schema })
    }
}

pub struct SchemaHandle {
    pool: PgPool,
    schema: String,
}

impl SchemaHandle {
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// `schema.table`, suitable for a sink table setting.
    pub fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    pub async fn cleanup(self) -> Result<()> {
        let drop_sql = format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE", self.schema);
        self.pool.execute(drop_sql.as_str()).await?;
        self.pool.close().await;
        Ok(())
    }
}
