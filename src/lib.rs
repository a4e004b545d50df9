use config::EngineConfig;
use database::models::{GroupId, MatchId};
use database::{Database, PgDatabase};
use storage::{HttpObjectStore, ObjectStore};
use utils::lock::KeyedLocks;

/// Settings loaded from the environment.
pub mod config;
/// Traits and types used for interacting with the database.
pub mod database;
/// Contains functions for logging.
pub mod log;
/// The object store that replay files are kept in.
pub mod storage;
/// Match reconciliation and game recording.
///
/// Everything here is a method on [`Engine`], except the pure pairing and diffing functions the
/// methods are built on.
pub mod tournament;

pub mod utils;

pub use utils::error::EngineError;

/// Runs tournament operations against a database and an object store.
///
/// Holds the per-group and per-match locks, so one engine should be shared by everything that
/// serves admin actions.
#[derive(Debug)]
pub struct Engine<DB, S> {
    database: DB,
    storage: S,
    config: EngineConfig,
    group_locks: KeyedLocks<GroupId>,
    match_locks: KeyedLocks<MatchId>,
}

impl<DB, S> Engine<DB, S>
where
    DB: Database,
    S: ObjectStore,
{
    /// Create a new engine with a given database and object store.
    pub fn new(database: DB, storage: S, config: EngineConfig) -> Self {
        Self {
            database,
            storage,
            config,
            group_locks: KeyedLocks::new(),
            match_locks: KeyedLocks::new(),
        }
    }

    pub fn database(&self) -> &DB {
        &self.database
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Convenience type for the production engine with generics filled in.
pub type PgEngine = Engine<PgDatabase, HttpObjectStore>;
