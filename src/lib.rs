pub mod config;
pub mod db;
pub mod error;
pub mod loader;
pub mod models;
pub mod retry;

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Install the process logger once; `RUST_LOG` overrides the default filter.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info,sqlx=warn")).init();
    });
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::db::{Database, run_migrations};
    use crate::loader::transaction::TransactionCoordinator;
    use crate::models::BootstrapConfig;
    use sqlx::Sqlite;
    use sqlx::pool::PoolConnection;

    /// Migrated private in-memory database for one test.
    pub struct TestDatabase {
        db: Database,
    }

    impl TestDatabase {
        pub async fn new() -> Self {
            let db = Database::in_memory()
                .await
                .expect("in-memory database opens");
            run_migrations(db.pool()).await.expect("migrations apply");
            Self { db }
        }

        /// Handle sharing this database's pool and transaction coordinator.
        pub fn database(&self) -> Database {
            self.db.clone()
        }

        pub fn coordinator(&self) -> &TransactionCoordinator {
            self.db.coordinator()
        }

        /// The only pooled connection; drop it before starting a transaction.
        pub async fn acquire(&self) -> PoolConnection<Sqlite> {
            self.db.acquire().await.expect("connection is available")
        }
    }

    /// Read-side helpers for asserting on loaded rows.
    pub struct TestFixtures<'a> {
        db: &'a TestDatabase,
    }

    impl<'a> TestFixtures<'a> {
        pub fn new(db: &'a TestDatabase) -> Self {
            Self { db }
        }

        pub async fn count_rows(&self, table: &str) -> i64 {
            let mut conn = self.db.acquire().await;
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{table}\""))
                .fetch_one(&mut *conn)
                .await
                .expect("count query runs")
        }

        /// Stored value of setting `key` for the event with `slug`.
        pub async fn setting(&self, slug: &str, key: &str) -> Option<String> {
            let mut conn = self.db.acquire().await;
            sqlx::query_scalar(
                "SELECT s.value FROM event_settings s JOIN events e ON e.id = s.event_id \
                 WHERE e.slug = ? AND s.key = ?",
            )
            .bind(slug)
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .expect("setting query runs")
        }

        pub async fn execute(&self, sql: &str) -> u64 {
            let mut conn = self.db.acquire().await;
            sqlx::query(sql)
                .execute(&mut *conn)
                .await
                .expect("statement runs")
                .rows_affected()
        }
    }

    /// Two events, three ticket types, defaults plus overrides, and one wildcard grant.
    pub fn sample_config() -> BootstrapConfig {
        serde_json::from_value(sample_config_json()).expect("sample configuration parses")
    }

    pub fn sample_config_json() -> serde_json::Value {
        serde_json::json!({
            "version": "2026.1",
            "environment": "test",
            "events": [
                {
                    "slug": "summer-fest",
                    "name": "Summer Fest",
                    "type": "festival",
                    "status": "published",
                    "dates": {"start": "2026-07-01", "end": "2026-07-03", "doors": "16:00"},
                    "venue": {"name": "Riverside Park", "capacity": 20000},
                    "settings": {
                        "checkout": {"currency": "GBP"},
                        "wallet": {"pass_types": ["apple", "google"]}
                    },
                    "ticket_types": [
                        {"name": "General", "price": 59.0, "capacity": 15000},
                        {"name": "VIP", "price": 149.0, "capacity": 500, "perks": ["lounge"]}
                    ]
                },
                {
                    "slug": "winter-lights",
                    "name": "Winter Lights",
                    "type": "exhibition",
                    "dates": {"start": "2026-12-01", "end": "2026-12-31"},
                    "ticket_types": [{"name": "Entry", "price": 12.5}]
                }
            ],
            "defaults": {
                "settings": {
                    "checkout": {"currency": "EUR", "max_tickets_per_order": 6},
                    "features": {"waitlist": true}
                }
            },
            "admin_access": [
                {"email": "ops@example.com", "role": "admin"},
                {"email": "promoter@example.com", "role": "editor", "events": ["summer-fest"]}
            ]
        })
    }
}
