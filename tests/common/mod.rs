//! Throwaway PostgreSQL databases for integration tests.

#![allow(dead_code)]

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug)]
pub enum TestDatabaseError {
    MissingUrl,
    Sqlx(sqlx::Error),
}

impl From<sqlx::Error> for TestDatabaseError {
    fn from(err: sqlx::Error) -> Self {
        TestDatabaseError::Sqlx(err)
    }
}

/// A fresh database created on the server named by `TEST_DATABASE_URL`.
pub struct TestDatabase {
    admin: PgConnectOptions,
    name: String,
    pool: PgPool,
}

impl TestDatabase {
    pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
        let url = std::env::var("TEST_DATABASE_URL").map_err(|_| TestDatabaseError::MissingUrl)?;
        let admin = PgConnectOptions::from_str(&url)?;
        let name = format!("identity_import_test_{}", Uuid::new_v4().simple());

        let mut conn = PgConnection::connect_with(&admin).await?;
        sqlx::query(&format!("CREATE DATABASE \"{name}\""))
            .execute(&mut conn)
            .await?;
        conn.close().await?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(admin.clone().database(&name))
            .await?;

        Ok(Self { admin, name, pool })
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }

    pub async fn close(self) -> Result<(), TestDatabaseError> {
        self.pool.close().await;
        let mut conn = PgConnection::connect_with(&self.admin).await?;
        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.name))
            .execute(&mut conn)
            .await?;
        conn.close().await?;
        Ok(())
    }
}

/// Provision a database or return `None` with a skip notice.
pub async fn database_or_skip(test: &str) -> Option<TestDatabase> {
    match TestDatabase::new_from_env().await {
        Ok(db) => Some(db),
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping {test}: TEST_DATABASE_URL not set");
            None
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    }
}
