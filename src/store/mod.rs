//! One stable persistence interface with three implementations.
//!
//! Everything above this module (probe, migration, orchestrator) talks to
//! [`EntityStore`] and never to a concrete driver. Tests inject doubles
//! through [`StoreFactory`].

use async_trait::async_trait;

use crate::profile::ProfileId;
use crate::{AppError, AppResult};

pub use crate::settings::SettingsMap;

pub mod firestore;
pub mod mysql;
pub mod record;
pub mod sql;
pub mod sqlite;

pub use record::{
    BookRecord, CategoryRecord, EntityKind, EntityRecord, OrderItemRecord, OrderRecord,
    UserRecord, VideoRecord,
};

/// Why a liveness probe failed. Auth rejections are final; everything
/// else may be retried.
#[derive(Debug, Clone)]
pub enum PingError {
    Transient(AppError),
    Auth(AppError),
}

impl PingError {
    pub fn is_auth(&self) -> bool {
        matches!(self, PingError::Auth(_))
    }

    pub fn into_app_error(self) -> AppError {
        match self {
            PingError::Transient(err) | PingError::Auth(err) => err,
        }
    }
}

/// Whether the expected tables or collections exist on a reachable backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaPresence {
    Present,
    Absent { missing: Vec<String> },
}

/// What an idempotent write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Write failures split by blast radius: a `Row` error poisons one record
/// and the migration keeps going, a `Fatal` error means the store itself
/// is gone and the run must stop.
#[derive(Debug, Clone)]
pub enum WriteError {
    Row(String),
    Fatal(AppError),
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    fn profile(&self) -> ProfileId;

    /// Cheap liveness check against the live backend.
    async fn ping(&self) -> Result<(), PingError>;

    /// Reports which expected tables or collections are missing.
    /// Only meaningful once `ping` succeeds.
    async fn schema_presence(&self) -> AppResult<SchemaPresence>;

    /// Creates the expected schema. Safe to call when parts already exist.
    async fn apply_schema(&self) -> AppResult<()>;

    /// Streams every row of one entity in canonical form. Rows that exist
    /// but cannot be canonicalized come back as `Err` entries so the
    /// caller can count them without losing the rest of the table.
    async fn read_all(&self, entity: EntityKind) -> AppResult<Vec<Result<EntityRecord, String>>>;

    /// Insert-or-update by natural key.
    async fn upsert(&self, record: &EntityRecord) -> Result<UpsertOutcome, WriteError>;

    async fn count(&self, entity: EntityKind) -> AppResult<i64>;
}

/// Builds a live store for a profile from its validated settings.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn open(
        &self,
        profile: ProfileId,
        settings: &SettingsMap,
    ) -> AppResult<Box<dyn EntityStore>>;
}

/// Production factory: firebase, sqlite and mysql map onto their real
/// drivers.
pub struct DefaultStoreFactory;

#[async_trait]
impl StoreFactory for DefaultStoreFactory {
    async fn open(
        &self,
        profile: ProfileId,
        settings: &SettingsMap,
    ) -> AppResult<Box<dyn EntityStore>> {
        match profile {
            ProfileId::Firebase => Ok(Box::new(firestore::FirestoreStore::new(settings)?)),
            ProfileId::Sqlite => Ok(Box::new(sqlite::SqliteStore::open(settings).await?)),
            ProfileId::Mysql => Ok(Box::new(mysql::MysqlStore::connect(settings)?)),
        }
    }
}
