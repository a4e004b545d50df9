use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{ObjectMetadata, ObjectStore};
use crate::utils::error::StorageError;

/// Object store operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Upload,
    Download,
    Copy,
    Delete,
    Exists,
}

/// An object store held in process memory, for development and tests.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, (Vec<u8>, ObjectMetadata)>>,
    faults: Mutex<Vec<(StorageOp, usize)>>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `op` fail once, after letting `skip` calls through.
    pub fn fail_at(&self, op: StorageOp, skip: usize) {
        lock(&self.faults).push((op, skip));
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.objects).contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    async fn enter(&self, op: StorageOp, key: &str) -> Result<(), StorageError> {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut faults = lock(&self.faults);
        let Some(index) = faults.iter().position(|(o, _)| *o == op) else {
            return Ok(());
        };
        if faults[index].1 > 0 {
            faults[index].1 -= 1;
            return Ok(());
        }
        faults.remove(index);
        Err(StorageError::Unavailable(format!("{:?} of {} failed", op, key)))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ObjectStore for MemoryObjectStore {
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: &ObjectMetadata,
    ) -> Result<(), StorageError> {
        self.enter(StorageOp::Upload, key).await?;
        lock(&self.objects).insert(key.to_string(), (bytes, metadata.clone()));
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.enter(StorageOp::Download, key).await?;
        lock(&self.objects)
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<(), StorageError> {
        self.enter(StorageOp::Copy, source).await?;
        let mut objects = lock(&self.objects);
        let object = objects
            .get(source)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(source.to_string()))?;
        objects.insert(destination.to_string(), object);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.enter(StorageOp::Delete, key).await?;
        lock(&self.objects).remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.enter(StorageOp::Exists, key).await?;
        Ok(lock(&self.objects).contains_key(key))
    }
}
