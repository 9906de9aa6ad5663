//! Postgres fixtures for integration tests. Tests return early unless
//! `APP_METRICS_INTEGRATION_TEST=1` and `APP_METRICS_TEST_DATABASE_URL` are set.

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;

pub struct TestDb {
    pub pool: PgPool,
    database_url: String,
    schema: String,
}

impl TestDb {
    pub async fn open(prefix: &str) -> Result<Option<Self>> {
        if env::var("APP_METRICS_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return Ok(None);
        }
        let database_url = match env::var("APP_METRICS_TEST_DATABASE_URL") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        };

        let schema = format!("{}_{}", prefix, std::process::id());
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&database_url)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .execute(&admin_pool)
            .await?;
        drop(admin_pool);

        let schema_name = schema.clone();
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                let schema = schema_name.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {}, public", schema))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&database_url)
            .await?;

        Ok(Some(Self {
            pool,
            database_url,
            schema,
        }))
    }

    pub async fn drop_schema(self) {
        self.pool.close().await;
        let Ok(admin_pool) = PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.database_url)
            .await
        else {
            return;
        };
        let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema))
            .execute(&admin_pool)
            .await;
    }
}
