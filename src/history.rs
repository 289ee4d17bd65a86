use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::models::Product;
use crate::utils::error::Result;

/// SQLite price/stock history behind the graph renderer.
///
/// A history row is appended only when the latest stored value differs from
/// the current one, so the tables stay change-logs rather than run-logs.
/// History failures are run-level warnings, never fatal.
pub struct HistoryDb {
    pool: SqlitePool,
}

impl HistoryDb {
    pub async fn connect(db_path: &str) -> Result<Self> {
        let options = if db_path == ":memory:" {
            SqliteConnectOptions::new().filename(":memory:")
        } else {
            SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true)
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = HistoryDb { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS products (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                product_key TEXT UNIQUE NOT NULL,
                url TEXT NOT NULL,
                name TEXT NOT NULL,
                capacity_ah INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stock_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                product_id INTEGER NOT NULL,
                timestamp DATETIME NOT NULL,
                in_stock_qty INTEGER,
                preorder_qty INTEGER,
                status TEXT,
                FOREIGN KEY (product_id) REFERENCES products (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                product_id INTEGER NOT NULL,
                timestamp DATETIME NOT NULL,
                price REAL NOT NULL,
                FOREIGN KEY (product_id) REFERENCES products (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Upsert the product roster.
    pub async fn sync_products(&self, products: &[Product]) -> Result<()> {
        for product in products {
            sqlx::query(
                r#"
                INSERT INTO products (product_key, url, name, capacity_ah)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(product_key) DO UPDATE SET
                    url = excluded.url,
                    name = excluded.name,
                    capacity_ah = excluded.capacity_ah
                "#,
            )
            .bind(product.key())
            .bind(&product.url)
            .bind(&product.name)
            .bind(product.capacity_ah.map(|c| c as i64))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Append stock/price rows for products whose latest stored values
    /// differ. Returns (stock rows, price rows) written.
    pub async fn record_changes(
        &self,
        products: &[Product],
        at: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let mut stock_rows = 0;
        let mut price_rows = 0;

        for product in products {
            let Some(product_id) = self.product_id(&product.key()).await? else {
                continue;
            };

            let quantity = product
                .real_stock
                .and_then(|level| level.count())
                .unwrap_or(0) as i64;
            let (in_stock_qty, preorder_qty) = match product.availability {
                crate::models::Availability::InStock => (quantity, 0),
                crate::models::Availability::Preorder => (0, quantity),
                _ => (0, 0),
            };
            let status = product.availability.as_str();

            let last_stock = sqlx::query(
                r#"
                SELECT in_stock_qty, preorder_qty, status
                FROM stock_history
                WHERE product_id = ?
                ORDER BY timestamp DESC, id DESC
                LIMIT 1
                "#,
            )
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?;

            let stock_changed = match &last_stock {
                Some(row) => {
                    row.try_get::<i64, _>("in_stock_qty")? != in_stock_qty
                        || row.try_get::<i64, _>("preorder_qty")? != preorder_qty
                        || row.try_get::<String, _>("status")? != status
                }
                None => true,
            };

            if stock_changed {
                sqlx::query(
                    r#"
                    INSERT INTO stock_history
                        (product_id, in_stock_qty, preorder_qty, status, timestamp)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(product_id)
                .bind(in_stock_qty)
                .bind(preorder_qty)
                .bind(status)
                .bind(at)
                .execute(&self.pool)
                .await?;
                stock_rows += 1;
            }

            let Some(price) = product.price.and_then(|p| p.to_f64()) else {
                continue;
            };

            let last_price: Option<f64> = sqlx::query(
                r#"
                SELECT price FROM price_history
                WHERE product_id = ?
                ORDER BY timestamp DESC, id DESC
                LIMIT 1
                "#,
            )
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.try_get("price"))
            .transpose()?;

            let price_changed = match last_price {
                Some(last) => (last - price).abs() > 0.001,
                None => true,
            };

            if price_changed {
                sqlx::query(
                    "INSERT INTO price_history (product_id, price, timestamp) VALUES (?, ?, ?)",
                )
                .bind(product_id)
                .bind(price)
                .bind(at)
                .execute(&self.pool)
                .await?;
                price_rows += 1;
            }
        }

        if stock_rows > 0 || price_rows > 0 {
            tracing::info!(stock_rows, price_rows, "history updated");
        }
        Ok((stock_rows, price_rows))
    }

    async fn product_id(&self, product_key: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT id FROM products WHERE product_key = ?")
            .bind(product_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get("id")).transpose().map_err(Into::into)
    }
}
