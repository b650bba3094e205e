//! Labelled locks
//!
//! A [`Door`] is an async reader/writer lock that remembers who holds it: every
//! acquisition names the operation, and the current writer's label can be read
//! back while the lock is held, which is what you want when a task is stuck.
//! Doors are not reentrant; a task must not re-acquire a door it already holds.
//!
//! [`FileDoor`] is the exclusive, synchronous variant guarding open file handles.
//! It is only ever taken for the span of a blocking read or write.

use crate::storage::error::{StorageError, StorageResult};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Proof that a door guard is alive. Disk helpers demand one so that the
/// owning chunk is always locked before its files.
pub trait DoorHeld {
    fn door_name(&self) -> &str;
}

/// Named async reader/writer lock
pub struct Door<T> {
    name: String,
    lock: RwLock<T>,
    writer: Mutex<Option<&'static str>>,
    readers: AtomicUsize,
}

impl<T> Door<T> {
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self {
            name: name.into(),
            lock: RwLock::new(value),
            writer: Mutex::new(None),
            readers: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared access.
    pub async fn read(&self, label: &'static str) -> DoorReadGuard<'_, T> {
        let guard = self.lock.read().await;
        self.readers.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(door = %self.name, label, "read lock acquired");
        DoorReadGuard { door: self, guard }
    }

    /// Exclusive access.
    pub async fn write(&self, label: &'static str) -> DoorWriteGuard<'_, T> {
        let guard = self.lock.write().await;
        self.set_writer(Some(label));
        tracing::trace!(door = %self.name, label, "write lock acquired");
        DoorWriteGuard { door: self, guard }
    }

    /// Exclusive access if nobody holds the door right now.
    pub fn try_write(&self, label: &'static str) -> Option<DoorWriteGuard<'_, T>> {
        let guard = self.lock.try_write().ok()?;
        self.set_writer(Some(label));
        Some(DoorWriteGuard { door: self, guard })
    }

    /// Label of the current exclusive holder.
    pub fn writer(&self) -> Option<&'static str> {
        self.writer.lock().ok().and_then(|w| *w)
    }

    /// Number of shared holders.
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    fn set_writer(&self, label: Option<&'static str>) {
        if let Ok(mut writer) = self.writer.lock() {
            *writer = label;
        }
    }
}

impl<T> std::fmt::Debug for Door<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Door")
            .field("name", &self.name)
            .field("writer", &self.writer())
            .field("readers", &self.readers())
            .finish()
    }
}

pub struct DoorReadGuard<'a, T> {
    door: &'a Door<T>,
    guard: RwLockReadGuard<'a, T>,
}

impl<T> Deref for DoorReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for DoorReadGuard<'_, T> {
    fn drop(&mut self) {
        self.door.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T> DoorHeld for DoorReadGuard<'_, T> {
    fn door_name(&self) -> &str {
        &self.door.name
    }
}

pub struct DoorWriteGuard<'a, T> {
    door: &'a Door<T>,
    guard: RwLockWriteGuard<'a, T>,
}

impl<T> Deref for DoorWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for DoorWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for DoorWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.door.set_writer(None);
    }
}

impl<T> DoorHeld for DoorWriteGuard<'_, T> {
    fn door_name(&self) -> &str {
        &self.door.name
    }
}

/// Exclusive synchronous lock with a holder label
pub struct FileDoor<T> {
    name: String,
    inner: Mutex<T>,
    holder: Mutex<Option<&'static str>>,
}

impl<T> FileDoor<T> {
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(value),
            holder: Mutex::new(None),
        }
    }

    pub fn lock(&self, label: &'static str) -> StorageResult<FileDoorGuard<'_, T>> {
        let guard = self.inner.lock().map_err(|_| {
            StorageError::Lock(format!(
                "file door {} poisoned (last holder {:?})",
                self.name,
                self.holder()
            ))
        })?;
        if let Ok(mut holder) = self.holder.lock() {
            *holder = Some(label);
        }
        tracing::trace!(door = %self.name, label, "file door acquired");
        Ok(FileDoorGuard { door: self, guard })
    }

    pub fn holder(&self) -> Option<&'static str> {
        self.holder.lock().ok().and_then(|h| *h)
    }
}

pub struct FileDoorGuard<'a, T> {
    door: &'a FileDoor<T>,
    guard: std::sync::MutexGuard<'a, T>,
}

impl<T> Deref for FileDoorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for FileDoorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for FileDoorGuard<'_, T> {
    fn drop(&mut self) {
        if let Ok(mut holder) = self.door.holder.lock() {
            *holder = None;
        }
    }
}
