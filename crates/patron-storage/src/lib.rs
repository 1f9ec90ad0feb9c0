//! SQLite-backed persistence gateway for reconciled sponsors.

use std::str::FromStr;

use chrono::Utc;
use patron_core::NewSponsor;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

pub const CRATE_NAME: &str = "patron-storage";

const WATERMARK_KEY: &str = "last_sync_time";

/// One persisted sponsor row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SponsorRow {
    pub user_id: String,
    pub name: String,
    pub avatar: Option<String>,
    pub all_sum_amount: String,
    pub create_time: i64,
    pub first_pay_time: Option<i64>,
    pub last_pay_time: Option<i64>,
    pub updated_at: i64,
}

/// Store owning the sponsors table and the sync watermark. Cheap to clone;
/// clones share the underlying pool.
#[derive(Debug, Clone)]
pub struct SponsorStore {
    pool: SqlitePool,
}

impl SponsorStore {
    /// Open (and create, if missing) the database at `database_url`.
    ///
    /// A single connection keeps in-memory databases coherent across calls;
    /// SQLite serializes writers regardless.
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables, indexes and the seeded watermark row. Idempotent.
    pub async fn setup_schema(&self) -> Result<(), sqlx::Error> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS sponsors (
                user_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                avatar TEXT,
                all_sum_amount TEXT NOT NULL DEFAULT '0.00',
                create_time INTEGER NOT NULL,
                first_pay_time INTEGER,
                last_pay_time INTEGER,
                updated_at INTEGER NOT NULL DEFAULT 0
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sponsors_create_time ON sponsors(create_time)",
            "CREATE INDEX IF NOT EXISTS idx_sponsors_last_pay_time ON sponsors(last_pay_time)",
            r#"
            CREATE TABLE IF NOT EXISTS sync_metadata (
                key TEXT PRIMARY KEY,
                value TEXT,
                updated_at INTEGER NOT NULL DEFAULT 0
            )
            "#,
            "INSERT OR IGNORE INTO sync_metadata (key, value) VALUES ('last_sync_time', '0')",
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("database schema ready");
        Ok(())
    }

    /// Insert or update one sponsor keyed by `user_id`.
    ///
    /// On conflict every column is overwritten with the incoming value
    /// except `first_pay_time`, which keeps the existing value whenever the
    /// incoming one is NULL, so a first-seen timestamp never regresses to
    /// NULL once set.
    pub async fn upsert(&self, sponsor: &NewSponsor) -> Result<(), sqlx::Error> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO sponsors (
                user_id, name, avatar, all_sum_amount, create_time,
                first_pay_time, last_pay_time, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                name = excluded.name,
                avatar = excluded.avatar,
                all_sum_amount = excluded.all_sum_amount,
                create_time = excluded.create_time,
                first_pay_time = COALESCE(excluded.first_pay_time, sponsors.first_pay_time),
                last_pay_time = excluded.last_pay_time,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&sponsor.user_id)
        .bind(&sponsor.name)
        .bind(sponsor.avatar.as_deref())
        .bind(&sponsor.all_sum_amount)
        .bind(sponsor.create_time)
        .bind(sponsor.first_pay_time)
        .bind(sponsor.last_pay_time)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_user_id(&self, user_id: &str) -> Result<Option<SponsorRow>, sqlx::Error> {
        sqlx::query_as::<_, SponsorRow>("SELECT * FROM sponsors WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// One page of sponsors, most recent pay first. Page numbers past the
    /// end of the table yield an empty page; the offset saturates instead of
    /// overflowing for extreme inputs.
    pub async fn find_page(&self, page: i64, per_page: i64) -> Result<Vec<SponsorRow>, sqlx::Error> {
        sqlx::query_as::<_, SponsorRow>(
            "SELECT * FROM sponsors ORDER BY last_pay_time DESC LIMIT ? OFFSET ?",
        )
        .bind(per_page)
        .bind(page.saturating_sub(1).saturating_mul(per_page))
        .fetch_all(&self.pool)
        .await
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM sponsors")
            .fetch_one(&self.pool)
            .await
    }

    /// When the most recent sync attempt finished, in Unix seconds.
    pub async fn last_sync_time(&self) -> Result<Option<i64>, sqlx::Error> {
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM sync_metadata WHERE key = ?")
                .bind(WATERMARK_KEY)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.flatten().and_then(|v| v.parse().ok()))
    }

    pub async fn set_last_sync_time(&self, timestamp: i64) -> Result<(), sqlx::Error> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(WATERMARK_KEY)
        .bind(timestamp.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SponsorStore {
        let store = SponsorStore::connect("sqlite::memory:")
            .await
            .expect("in-memory store");
        store.setup_schema().await.expect("schema");
        store
    }

    fn sponsor(
        user_id: &str,
        name: &str,
        first_pay: Option<i64>,
        last_pay: i64,
        amount: &str,
    ) -> NewSponsor {
        NewSponsor {
            user_id: user_id.to_string(),
            name: name.to_string(),
            avatar: None,
            all_sum_amount: amount.to_string(),
            create_time: first_pay.unwrap_or(last_pay),
            first_pay_time: first_pay,
            last_pay_time: Some(last_pay),
        }
    }

    #[tokio::test]
    async fn upsert_then_find() {
        let store = store().await;
        store
            .upsert(&sponsor("u1", "Alice", Some(1000), 2000, "5.00"))
            .await
            .expect("upsert");

        let row = store
            .find_by_user_id("u1")
            .await
            .expect("query")
            .expect("row exists");
        assert_eq!(row.name, "Alice");
        assert_eq!(row.first_pay_time, Some(1000));
        assert_eq!(row.last_pay_time, Some(2000));
        assert!(row.updated_at > 0);
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = store().await;
        let record = sponsor("u1", "Alice", Some(1000), 2000, "5.00");
        store.upsert(&record).await.expect("first upsert");
        store.upsert(&record).await.expect("second upsert");

        assert_eq!(store.count().await.expect("count"), 1);
        let row = store
            .find_by_user_id("u1")
            .await
            .expect("query")
            .expect("row exists");
        assert_eq!(row.all_sum_amount, "5.00");
        assert_eq!(row.first_pay_time, Some(1000));
    }

    #[tokio::test]
    async fn resync_preserves_first_pay_time() {
        let store = store().await;
        store
            .upsert(&sponsor("u1", "A", Some(1000), 2000, "5.00"))
            .await
            .expect("initial upsert");
        store
            .upsert(&sponsor("u1", "A2", None, 3000, "9.00"))
            .await
            .expect("resync upsert");

        let row = store
            .find_by_user_id("u1")
            .await
            .expect("query")
            .expect("row exists");
        assert_eq!(row.name, "A2");
        assert_eq!(row.first_pay_time, Some(1000));
        assert_eq!(row.last_pay_time, Some(3000));
        assert_eq!(row.all_sum_amount, "9.00");
    }

    #[tokio::test]
    async fn first_pay_backfills_once_known() {
        let store = store().await;
        store
            .upsert(&sponsor("u1", "A", None, 2000, "1.00"))
            .await
            .expect("upsert without first pay");
        store
            .upsert(&sponsor("u1", "A", Some(500), 2500, "2.00"))
            .await
            .expect("upsert with first pay");

        let row = store
            .find_by_user_id("u1")
            .await
            .expect("query")
            .expect("row exists");
        assert_eq!(row.first_pay_time, Some(500));
    }

    #[tokio::test]
    async fn pages_order_by_last_pay_desc() {
        let store = store().await;
        store
            .upsert(&sponsor("u1", "A", Some(10), 10, "1.00"))
            .await
            .expect("upsert u1");
        store
            .upsert(&sponsor("u2", "B", Some(30), 30, "2.00"))
            .await
            .expect("upsert u2");
        store
            .upsert(&sponsor("u3", "C", Some(20), 20, "3.00"))
            .await
            .expect("upsert u3");

        let first = store.find_page(1, 2).await.expect("first page");
        let ids: Vec<_> = first.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(ids, ["u2", "u3"]);

        let second = store.find_page(2, 2).await.expect("second page");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].user_id, "u1");

        assert_eq!(store.count().await.expect("count"), 3);
    }

    #[tokio::test]
    async fn find_page_tolerates_extreme_page_numbers() {
        let store = store().await;
        store
            .upsert(&sponsor("u1", "A", Some(10), 10, "1.00"))
            .await
            .expect("upsert");

        let rows = store.find_page(i64::MAX, 100).await.expect("query");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn watermark_is_seeded_and_updatable() {
        let store = store().await;
        assert_eq!(store.last_sync_time().await.expect("seeded"), Some(0));

        store.set_last_sync_time(1234).await.expect("set watermark");
        assert_eq!(store.last_sync_time().await.expect("read"), Some(1234));

        // Re-running schema setup never rewinds the watermark.
        store.setup_schema().await.expect("schema rerun");
        assert_eq!(store.last_sync_time().await.expect("read"), Some(1234));
    }
}
