use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ItemId, NewItem, ShoppingItem};

/// Durable CRUD over the `shopping_items` table.
///
/// Every call is a single statement. Listing is always newest first
/// (descending id). Updates and deletes that match no row are not errors;
/// the returned flag only reports whether a row was touched.
#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn list_all(&self) -> Result<Vec<ShoppingItem>>;
    async fn insert(&self, item: NewItem) -> Result<ShoppingItem>;
    /// Inserts with a caller-supplied id, replacing any existing row with that id.
    async fn insert_with_id(&self, item: ShoppingItem) -> Result<ShoppingItem>;
    async fn update(&self, item: &ShoppingItem) -> Result<bool>;
    async fn delete(&self, id: ItemId) -> Result<bool>;
    async fn find(&self, id: ItemId) -> Result<Option<ShoppingItem>>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite database url '{database_url}'"))?
            .create_if_missing(true);
        let pool_options = if sqlite_path(database_url).is_none() {
            // An in-memory database lives and dies with its connection; keep exactly one forever.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to apply shopping_items migrations")?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn item_from_row(row: &SqliteRow) -> Result<ShoppingItem> {
    Ok(ShoppingItem {
        id: ItemId(row.try_get::<i64, _>("id")?),
        name: row.try_get::<String, _>("name")?,
        is_bought: row.try_get::<bool, _>("isBought")?,
    })
}

#[async_trait]
impl ItemStore for Storage {
    async fn list_all(&self) -> Result<Vec<ShoppingItem>> {
        let rows = sqlx::query(r#"SELECT id, name, "isBought" FROM shopping_items ORDER BY id DESC"#)
            .fetch_all(&self.pool)
            .await
            .context("failed to list shopping items")?;

        rows.iter().map(item_from_row).collect()
    }

    async fn insert(&self, item: NewItem) -> Result<ShoppingItem> {
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO shopping_items (name, "isBought") VALUES (?, ?) RETURNING id"#,
        )
        .bind(item.name.as_str())
        .bind(item.is_bought)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert shopping item")?;

        Ok(item.with_id(ItemId(id)))
    }

    async fn insert_with_id(&self, item: ShoppingItem) -> Result<ShoppingItem> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO shopping_items (id, name, "isBought") VALUES (?, ?, ?)"#,
        )
        .bind(item.id.0)
        .bind(item.name.as_str())
        .bind(item.is_bought)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to replace shopping item {}", item.id.0))?;

        Ok(item)
    }

    async fn update(&self, item: &ShoppingItem) -> Result<bool> {
        let result = sqlx::query(r#"UPDATE shopping_items SET name = ?, "isBought" = ? WHERE id = ?"#)
            .bind(item.name.as_str())
            .bind(item.is_bought)
            .bind(item.id.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to update shopping item {}", item.id.0))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: ItemId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM shopping_items WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete shopping item {}", id.0))?;

        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, id: ItemId) -> Result<Option<ShoppingItem>> {
        let row = sqlx::query(r#"SELECT id, name, "isBought" FROM shopping_items WHERE id = ?"#)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load shopping item {}", id.0))?;

        row.as_ref().map(item_from_row).transpose()
    }
}

pub fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() || path == ":memory:" {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
