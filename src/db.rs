pub use self::error::DatabaseError;
pub use self::manager::DatabaseManager;
pub use self::models::{
    actions, Appointment, AppointmentStatus, Customer, Payment, SyncAttempt, SyncOutcomeKind,
};
pub use self::stores::{AppointmentStore, CustomerStore, PaymentStore, SyncAttemptStore};

pub mod error;
pub mod manager;
pub mod models;
pub mod schema;
pub mod sqlite;
pub mod stores;
