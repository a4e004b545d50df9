use futures::future::join_all;

use crate::database::Database;
use crate::log::cleanup_failed;
use crate::storage::{bounded, ObjectStore};
use crate::Engine;

/// Round-robin pair generation.
pub mod pairing;
/// Keeps a group's matches in line with its participants.
pub mod reconcile;
/// Records game results and promotes replay files.
pub mod recorder;

impl<DB, S> Engine<DB, S>
where
    DB: Database,
    S: ObjectStore,
{
    /// Deletes objects without letting a failure reach the caller.
    ///
    /// Failures are logged. Used wherever a leftover object is an acceptable leak: files the admin
    /// unlinked, temp uploads that were promoted, replays of replaced or deleted games.
    pub(crate) async fn remove_objects(&self, keys: &[String], purpose: &str) {
        let timeout = self.config.storage_timeout;
        let results = join_all(
            keys.iter()
                .map(|key| bounded(timeout, key, self.storage.delete(key))),
        )
        .await;

        for (key, result) in keys.iter().zip(results) {
            if let Err(e) = result {
                cleanup_failed(purpose, key, &e);
            }
        }
    }
}
