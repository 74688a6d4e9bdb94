//! Throwaway Postgres databases for integration tests
//!
//! Each test gets its own database, named after the one in
//! `TEST_DATABASE_URL` plus a random suffix, so tests in different binaries
//! can run side by side.

use std::env;

use sqlx::PgPool;
use uuid::Uuid;

fn split_db_url(url: &str) -> Result<(String, String, Option<String>), String> {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base.to_string(), Some(query.to_string())),
        None => (url.to_string(), None),
    };

    let db_start = base
        .rfind('/')
        .ok_or_else(|| "invalid database url".to_string())?;
    if db_start + 1 >= base.len() {
        return Err("database name is empty".to_string());
    }

    Ok((base[..db_start + 1].to_string(), base[db_start + 1..].to_string(), query))
}

fn with_query(url: String, query: &Option<String>) -> String {
    match query {
        Some(query) => format!("{url}?{query}"),
        None => url,
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub struct TestDb {
    pub pool: PgPool,
    admin_url: String,
    name: String,
}

pub async fn init_test_db() -> TestDb {
    dotenvy::dotenv().ok();
    let test_url = env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
    let (server, base_name, query) =
        split_db_url(&test_url).expect("invalid TEST_DATABASE_URL format");

    let name = format!("{}_{}", base_name, Uuid::new_v4().simple());
    let admin_url = with_query(format!("{server}postgres"), &query);

    let admin_pool = PgPool::connect(&admin_url).await.expect("connect admin db");
    sqlx::query(&format!("CREATE DATABASE {}", quote_identifier(&name)))
        .execute(&admin_pool)
        .await
        .expect("create test db");
    admin_pool.close().await;

    let pool = PgPool::connect(&with_query(format!("{server}{name}"), &query))
        .await
        .expect("connect test db");
    shipmail_shared::run_migrations(&pool).await.expect("migrations");

    TestDb {
        pool,
        admin_url,
        name,
    }
}

impl TestDb {
    pub async fn cleanup(self) {
        self.pool.close().await;
        let admin_pool = PgPool::connect(&self.admin_url)
            .await
            .expect("connect admin db");
        let _ = sqlx::query(&format!(
            "DROP DATABASE IF EXISTS {} WITH (FORCE)",
            quote_identifier(&self.name)
        ))
        .execute(&admin_pool)
        .await;
        admin_pool.close().await;
    }
}
