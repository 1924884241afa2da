use std::sync::Arc;

use diesel::RunQueryDsl;

use crate::config::DatabaseConfig;
use crate::db::sqlite::{
    establish_connection, SqliteAppointmentStore, SqliteCustomerStore, SqlitePaymentStore,
    SqliteSyncAttemptStore,
};
use crate::db::{
    AppointmentStore, CustomerStore, DatabaseError, PaymentStore, SyncAttemptStore,
};

#[derive(Clone)]
enum Backend {
    Sqlite { path: Arc<String> },
    /// Stores injected from outside; migrations and pings are the injector's
    /// responsibility.
    External,
}

#[derive(Clone)]
pub struct DatabaseManager {
    backend: Backend,
    appointment_store: Arc<dyn AppointmentStore>,
    customer_store: Arc<dyn CustomerStore>,
    payment_store: Arc<dyn PaymentStore>,
    sync_attempt_store: Arc<dyn SyncAttemptStore>,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let path = config.sqlite_path().ok_or_else(|| {
            DatabaseError::Connection("no sqlite database path configured".to_string())
        })?;
        let path = Arc::new(path);

        Ok(Self {
            backend: Backend::Sqlite { path: path.clone() },
            appointment_store: Arc::new(SqliteAppointmentStore::new(path.clone())),
            customer_store: Arc::new(SqliteCustomerStore::new(path.clone())),
            payment_store: Arc::new(SqlitePaymentStore::new(path.clone())),
            sync_attempt_store: Arc::new(SqliteSyncAttemptStore::new(path)),
        })
    }

    /// Build a manager from externally provided stores. Used when the engine
    /// is embedded against another persistence layer.
    pub fn from_stores(
        appointment_store: Arc<dyn AppointmentStore>,
        customer_store: Arc<dyn CustomerStore>,
        payment_store: Arc<dyn PaymentStore>,
        sync_attempt_store: Arc<dyn SyncAttemptStore>,
    ) -> Self {
        Self {
            backend: Backend::External,
            appointment_store,
            customer_store,
            payment_store,
            sync_attempt_store,
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        match &self.backend {
            Backend::Sqlite { path } => Self::migrate_sqlite(path.clone()).await,
            Backend::External => Ok(()),
        }
    }

    async fn migrate_sqlite(path: Arc<String>) -> Result<(), DatabaseError> {
        tokio::task::spawn_blocking(move || {
            let mut conn =
                establish_connection(&path).map_err(|e| DatabaseError::Migration(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS appointments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    customer_id INTEGER,
                    artist_id INTEGER NOT NULL,
                    start_time TEXT NOT NULL,
                    duration_minutes INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    external_booking_id TEXT,
                    notes TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS customers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    email TEXT NOT NULL,
                    phone TEXT,
                    external_customer_id TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS payments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    amount_cents BIGINT NOT NULL,
                    currency TEXT NOT NULL,
                    status TEXT NOT NULL,
                    method TEXT NOT NULL,
                    external_payment_id TEXT,
                    reference_id TEXT,
                    raw_payload TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS sync_attempts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    action TEXT NOT NULL,
                    target_id TEXT NOT NULL,
                    outcome TEXT NOT NULL,
                    error_detail TEXT,
                    payload TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                )
                "#,
                // One local appointment per external booking, and an O(1)
                // reverse lookup for reconciliation.
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_appointments_external_booking ON appointments(external_booking_id)",
                "CREATE INDEX IF NOT EXISTS idx_appointments_customer ON appointments(customer_id)",
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_customers_external ON customers(external_customer_id)",
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_payments_external ON payments(external_payment_id)",
                "CREATE INDEX IF NOT EXISTS idx_sync_attempts_action ON sync_attempts(action, created_at)",
                "CREATE INDEX IF NOT EXISTS idx_sync_attempts_created ON sync_attempts(created_at)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    /// Cheap connectivity probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), DatabaseError> {
        match &self.backend {
            Backend::Sqlite { path } => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || {
                    let mut conn = establish_connection(&path)?;
                    diesel::sql_query("SELECT 1")
                        .execute(&mut conn)
                        .map_err(|e| DatabaseError::Query(e.to_string()))?;
                    Ok(())
                })
                .await
                .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
            }
            Backend::External => Ok(()),
        }
    }

    pub fn appointment_store(&self) -> Arc<dyn AppointmentStore> {
        self.appointment_store.clone()
    }

    pub fn customer_store(&self) -> Arc<dyn CustomerStore> {
        self.customer_store.clone()
    }

    pub fn payment_store(&self) -> Arc<dyn PaymentStore> {
        self.payment_store.clone()
    }

    pub fn sync_attempt_store(&self) -> Arc<dyn SyncAttemptStore> {
        self.sync_attempt_store.clone()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use tempfile::NamedTempFile;

    use super::DatabaseManager;
    use crate::config::DatabaseConfig;
    use crate::db::models::{actions, Appointment, AppointmentStatus, Customer, SyncAttempt};

    async fn temp_manager() -> (DatabaseManager, NamedTempFile) {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = DatabaseConfig {
            url: None,
            filename: Some(file.path().to_string_lossy().to_string()),
        };
        let manager = DatabaseManager::new(&config).await.expect("db manager");
        manager.migrate().await.expect("migrate");
        (manager, file)
    }

    fn appointment() -> Appointment {
        let now = Utc::now();
        Appointment {
            id: 0,
            customer_id: Some(1),
            artist_id: 7,
            start_time: now + Duration::hours(2),
            duration_minutes: 90,
            status: AppointmentStatus::Scheduled,
            external_booking_id: None,
            notes: Some("first session".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn appointment_external_linkage_roundtrip() {
        let (manager, _file) = temp_manager().await;
        let store = manager.appointment_store();

        let id = store.create_appointment(&appointment()).await.expect("create");
        assert!(id > 0);

        store
            .set_external_booking_id(id, Some("booking-1"))
            .await
            .expect("link");

        let linked = store
            .get_by_external_booking_id("booking-1")
            .await
            .expect("lookup")
            .expect("appointment exists");
        assert_eq!(linked.id, id);
        assert_eq!(linked.external_booking_id.as_deref(), Some("booking-1"));

        // Setting the same id again is harmless.
        store
            .set_external_booking_id(id, Some("booking-1"))
            .await
            .expect("relink");

        store
            .set_external_booking_id(id, None)
            .await
            .expect("unlink");
        let unlinked = store
            .get_by_external_booking_id("booking-1")
            .await
            .expect("lookup after unlink");
        assert!(unlinked.is_none());
    }

    #[tokio::test]
    async fn customer_external_id_persists() {
        let (manager, _file) = temp_manager().await;
        let store = manager.customer_store();

        let now = Utc::now();
        let id = store
            .create_customer(&Customer {
                id: 0,
                name: "Ada Lovelace".to_string(),
                email: "ada@example.com".to_string(),
                phone: None,
                external_customer_id: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("create customer");

        store
            .set_external_customer_id(id, "ext-cust-1")
            .await
            .expect("set external id");

        let loaded = store
            .get_customer(id)
            .await
            .expect("get customer")
            .expect("customer exists");
        assert_eq!(loaded.external_customer_id.as_deref(), Some("ext-cust-1"));
    }

    #[tokio::test]
    async fn sync_attempts_append_query_and_prune() {
        let (manager, _file) = temp_manager().await;
        let store = manager.sync_attempt_store();

        let mut old = SyncAttempt::success(actions::RECONCILE_STARTED, "window");
        old.created_at = Utc::now() - Duration::days(90);
        store.append(&old).await.expect("append old");

        store
            .append(&SyncAttempt::failure(
                actions::RECONCILE_FAILED,
                "window",
                "provider unreachable",
            ))
            .await
            .expect("append failure");

        let latest = store
            .latest_by_actions(&[actions::RECONCILE_STARTED, actions::RECONCILE_FAILED], 10)
            .await
            .expect("query");
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].action, actions::RECONCILE_FAILED);

        let pruned = store
            .prune_older_than(Utc::now() - Duration::days(30))
            .await
            .expect("prune");
        assert_eq!(pruned, 1);

        let remaining = store
            .latest_by_actions(&[actions::RECONCILE_STARTED, actions::RECONCILE_FAILED], 10)
            .await
            .expect("query after prune");
        assert_eq!(remaining.len(), 1);
    }
}
