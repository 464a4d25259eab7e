//! Durable bounded FIFO backed by one file per item
//!
//! Items live under `<root>/items/<index>`. The on-disk directory is the
//! source of truth across restarts; the in-memory index set mirrors it.
//! Two credit pools gate producers and consumers: `slots` counts free
//! capacity, `items` counts stored entries. At quiescence the two always
//! sum to the store capacity.

mod credits;

use std::collections::BTreeSet;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

pub use credits::Credits;

use crate::error::StoreError;
use crate::{Error, Result};

/// Mode for the store root and items directory
const DIR_MODE: u32 = 0o755;

/// Mode for item files
const ITEM_MODE: u32 = 0o600;

/// Items sub-directory name
const ITEMS_DIR: &str = "items";

/// Bounded, crash-safe FIFO of byte blobs
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    configured_capacity: usize,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    capacity: usize,
    read_idx: u64,
    write_idx: u64,
    indexes: BTreeSet<u64>,
    slots: Arc<Credits>,
    items: Arc<Credits>,
}

impl FileStore {
    /// Open (or create) a store rooted at `root`
    ///
    /// Existing items are recovered. If more items are on disk than
    /// `capacity`, the capacity grows to fit them.
    ///
    /// # Errors
    ///
    /// Returns error on I/O failure or a zero capacity
    pub fn new(root: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("store capacity must be at least 1".to_string()));
        }

        let root = root.into();
        let state = load(&root, capacity)?;

        tracing::debug!(
            root = %root.display(),
            capacity = state.capacity,
            items = state.indexes.len(),
            "opened file store"
        );

        Ok(Self {
            root,
            configured_capacity: capacity,
            state: Mutex::new(state),
        })
    }

    /// Store root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Effective capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Number of stored items
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().indexes.len()
    }

    /// Whether the store holds no items
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free slot credits
    #[must_use]
    pub fn slots_available(&self) -> usize {
        self.lock().slots.available()
    }

    /// Stored item credits
    #[must_use]
    pub fn items_available(&self) -> usize {
        self.lock().items.available()
    }

    /// Indexes currently mapped in memory, in order
    #[must_use]
    pub fn indexes(&self) -> Vec<u64> {
        self.lock().indexes.iter().copied().collect()
    }

    /// Append `blob`, waiting for a free slot
    ///
    /// # Errors
    ///
    /// Returns `NilItem` for an empty blob, `Cancelled` if `cancel` fires
    /// before a slot frees up, or the underlying I/O error
    pub async fn enqueue(&self, blob: &[u8], cancel: &CancellationToken) -> Result<()> {
        if blob.is_empty() {
            return Err(StoreError::NilItem.into());
        }

        let slots = self.lock().slots.clone();
        slots.acquire(cancel).await?;

        self.push_back(blob).inspect_err(|_| slots.release(1))
    }

    /// Append `blob` without waiting
    ///
    /// # Errors
    ///
    /// Returns `Full` when no slot is free, `NilItem` for an empty blob
    pub fn try_enqueue(&self, blob: &[u8]) -> Result<()> {
        if blob.is_empty() {
            return Err(StoreError::NilItem.into());
        }

        let slots = self.lock().slots.clone();
        if !slots.try_acquire() {
            return Err(StoreError::Full.into());
        }

        self.push_back(blob).inspect_err(|_| slots.release(1))
    }

    /// Remove and return the front item, waiting until one exists
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires first, or the I/O error
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let items = self.lock().items.clone();
        items.acquire(cancel).await?;

        self.pop_front()
    }

    /// Remove and return the front item without waiting
    ///
    /// # Errors
    ///
    /// Returns `Empty` when the store holds no items
    pub fn try_dequeue(&self) -> Result<Vec<u8>> {
        let items = self.lock().items.clone();
        if !items.try_acquire() {
            return Err(StoreError::Empty.into());
        }

        self.pop_front()
    }

    /// Read the front item without removing it
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the front item cannot be read
    pub fn peek(&self) -> Result<Option<Vec<u8>>> {
        let state = self.lock();
        let Some(front) = state.front() else {
            return Ok(None);
        };

        Ok(Some(fs::read(self.item_path(front))?))
    }

    /// Drop the front item without consuming an item credit
    ///
    /// Pair with [`FileStore::wait_non_empty`], which reserves the credit.
    ///
    /// # Errors
    ///
    /// Returns `Empty` when the store holds no items
    pub fn pop(&self) -> Result<()> {
        let mut state = self.lock();
        let front = state.front().ok_or(StoreError::Empty)?;

        self.remove_front(&mut state, front)
    }

    /// Reserve an item credit for a later `peek` + `pop`
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires before an item is available
    pub async fn wait_non_empty(&self, cancel: &CancellationToken) -> Result<()> {
        let items = self.lock().items.clone();
        items.acquire(cancel).await?;
        Ok(())
    }

    /// Erase every item and start over
    ///
    /// Tasks blocked on the old credit pools wake up with `Reset`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the directory cannot be removed or recreated
    pub fn reset(&self) -> Result<()> {
        let mut state = self.lock();

        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        state.slots.close();
        state.items.close();
        *state = load(&self.root, self.configured_capacity)?;

        tracing::info!(root = %self.root.display(), "file store reset");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn items_dir(&self) -> PathBuf {
        self.root.join(ITEMS_DIR)
    }

    fn item_path(&self, idx: u64) -> PathBuf {
        self.items_dir().join(idx.to_string())
    }

    fn push_back(&self, blob: &[u8]) -> Result<()> {
        let mut state = self.lock();

        if state.indexes.len() >= state.capacity {
            return Err(StoreError::Full.into());
        }

        let idx = state.write_idx;
        write_item(&self.items_dir(), idx, blob)?;

        state.indexes.insert(idx);
        state.write_idx = idx + 1;
        state.items.release(1);

        tracing::trace!(idx, len = blob.len(), "item stored");
        Ok(())
    }

    /// Read and remove the front item; the caller holds one item credit
    ///
    /// Items whose file vanished are dropped and the next one is tried. On
    /// any other failure the credit goes back to the pool.
    fn pop_front(&self) -> Result<Vec<u8>> {
        let mut state = self.lock();
        loop {
            let front = state.front().ok_or(StoreError::Empty)?;

            let blob = match fs::read(self.item_path(front)) {
                Ok(blob) => blob,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if let Err(e) = self.remove_front(&mut state, front) {
                        state.items.release(1);
                        return Err(e);
                    }
                    // the held credit went with the lost item
                    if !state.items.try_acquire() {
                        return Err(StoreError::Empty.into());
                    }
                    continue;
                }
                Err(e) => {
                    state.items.release(1);
                    return Err(e.into());
                }
            };

            if let Err(e) = self.remove_front(&mut state, front) {
                state.items.release(1);
                return Err(e);
            }
            return Ok(blob);
        }
    }

    fn remove_front(&self, state: &mut State, front: u64) -> Result<()> {
        match fs::remove_file(self.item_path(front)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(idx = front, "store item already missing on disk");
            }
            Err(e) => return Err(e.into()),
        }

        state.indexes.remove(&front);
        state.read_idx = front + 1;
        state.slots.release(1);

        tracing::trace!(idx = front, "item removed");
        Ok(())
    }
}

impl State {
    /// Lowest mapped index at or past the read index
    fn front(&self) -> Option<u64> {
        self.indexes.range(self.read_idx..).next().copied()
    }
}

fn load(root: &Path, configured_capacity: usize) -> Result<State> {
    let items_dir = root.join(ITEMS_DIR);
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(&items_dir)?;

    let mut indexes = BTreeSet::new();
    for entry in fs::read_dir(&items_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if name.starts_with('.') && name.ends_with(".tmp") {
            tracing::debug!(file = %name, "removing partially written store item");
            let _ = fs::remove_file(entry.path());
            continue;
        }

        let Ok(idx) = name.parse::<u64>() else {
            tracing::warn!(
                dir = %items_dir.display(),
                file = %name,
                "skipping unrecognized file in store"
            );
            continue;
        };

        indexes.insert(idx);
    }

    let count = indexes.len();
    let capacity = configured_capacity.max(count);
    let read_idx = indexes.first().copied().unwrap_or(0);
    let write_idx = indexes.last().map_or(0, |last| last + 1);

    Ok(State {
        capacity,
        read_idx,
        write_idx,
        indexes,
        slots: Arc::new(Credits::new(capacity - count)),
        items: Arc::new(Credits::new(count)),
    })
}

/// Write an item through a temporary file so a torn write never surfaces
fn write_item(dir: &Path, idx: u64, blob: &[u8]) -> Result<()> {
    let tmp = dir.join(format!(".{idx}.tmp"));
    let path = dir.join(idx.to_string());

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(ITEM_MODE)
        .open(&tmp)?;
    file.write_all(blob)?;
    file.sync_data()?;
    drop(file);

    fs::rename(&tmp, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn on_disk(store: &FileStore) -> Vec<u64> {
        let mut found: Vec<u64> = fs::read_dir(store.items_dir())
            .unwrap()
            .filter_map(|e| e.unwrap().file_name().to_str()?.parse().ok())
            .collect();
        found.sort_unstable();
        found
    }

    fn assert_balanced(store: &FileStore) {
        assert_eq!(
            store.slots_available() + store.items_available(),
            store.capacity()
        );
        assert_eq!(on_disk(store), store.indexes());
    }

    #[test]
    fn test_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), 10).unwrap();

        for i in 0u8..5 {
            store.try_enqueue(&[i, i + 1]).unwrap();
            assert_balanced(&store);
        }
        for i in 0u8..5 {
            assert_eq!(store.try_dequeue().unwrap(), vec![i, i + 1]);
            assert_balanced(&store);
        }
        assert!(matches!(
            store.try_dequeue(),
            Err(Error::Store(StoreError::Empty))
        ));
    }

    #[test]
    fn test_rejects_empty_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), 2).unwrap();
        assert!(matches!(
            store.try_enqueue(&[]),
            Err(Error::Store(StoreError::NilItem))
        ));
        assert_balanced(&store);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileStore::new(dir.path(), 0).is_err());
    }

    #[test]
    fn test_file_modes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("q");
        let store = FileStore::new(&root, 2).unwrap();
        store.try_enqueue(b"x").unwrap();

        let item_mode = fs::metadata(store.item_path(0)).unwrap().permissions().mode();
        assert_eq!(item_mode & 0o777, ITEM_MODE);
        let dir_mode = fs::metadata(&root).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, DIR_MODE);
    }

    #[test]
    fn test_recovery_skips_holes_and_junk() {
        let dir = tempfile::tempdir().unwrap();
        let items = dir.path().join(ITEMS_DIR);
        fs::create_dir_all(&items).unwrap();
        fs::write(items.join("3"), b"three").unwrap();
        fs::write(items.join("7"), b"seven").unwrap();
        fs::write(items.join("README"), b"junk").unwrap();
        fs::write(items.join(".8.tmp"), b"torn").unwrap();

        let store = FileStore::new(dir.path(), 1).unwrap();
        assert_eq!(store.capacity(), 2);
        assert_eq!(store.indexes(), vec![3, 7]);
        assert!(!items.join(".8.tmp").exists());

        assert_eq!(store.try_dequeue().unwrap(), b"three");
        assert_eq!(store.try_dequeue().unwrap(), b"seven");
        assert_balanced(&store);

        store.try_enqueue(b"next").unwrap();
        assert_eq!(store.indexes(), vec![8]);
    }

    #[test]
    fn test_missing_file_tolerated_on_pop() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), 4).unwrap();
        store.try_enqueue(b"a").unwrap();
        store.try_enqueue(b"b").unwrap();

        fs::remove_file(store.item_path(0)).unwrap();
        store.pop().unwrap();
        assert_eq!(store.peek().unwrap().unwrap(), b"b");
    }

    #[test]
    fn test_dequeue_skips_vanished_item() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), 4).unwrap();
        store.try_enqueue(b"a").unwrap();
        store.try_enqueue(b"b").unwrap();

        fs::remove_file(store.item_path(0)).unwrap();
        assert_eq!(store.try_dequeue().unwrap(), b"b");
        assert_balanced(&store);
        assert!(store.is_empty());
        assert!(matches!(
            store.try_dequeue(),
            Err(Error::Store(StoreError::Empty))
        ));

        store.try_enqueue(b"c").unwrap();
        assert_eq!(store.try_dequeue().unwrap(), b"c");
        assert_balanced(&store);
    }

    #[test]
    fn test_dequeue_of_only_vanished_item_keeps_balance() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), 2).unwrap();
        store.try_enqueue(b"a").unwrap();

        fs::remove_file(store.item_path(0)).unwrap();
        assert!(matches!(
            store.try_dequeue(),
            Err(Error::Store(StoreError::Empty))
        ));
        assert_balanced(&store);
        assert_eq!(store.slots_available(), 2);
    }

    #[test]
    fn test_unreadable_item_returns_credit() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), 2).unwrap();
        store.try_enqueue(b"a").unwrap();

        // a directory in place of the item file fails the read
        fs::remove_file(store.item_path(0)).unwrap();
        fs::create_dir(store.item_path(0)).unwrap();
        assert!(store.try_dequeue().is_err());
        assert_eq!(store.items_available(), 1);
        assert_eq!(store.slots_available() + store.items_available(), store.capacity());

        fs::remove_dir(store.item_path(0)).unwrap();
        fs::write(store.item_path(0), b"a").unwrap();
        assert_eq!(store.try_dequeue().unwrap(), b"a");
    }

    #[test]
    fn test_reset_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), 3).unwrap();
        store.try_enqueue(b"a").unwrap();
        store.try_enqueue(b"b").unwrap();

        store.reset().unwrap();
        assert!(store.is_empty());
        assert_eq!(store.slots_available(), 3);
        assert_eq!(store.items_available(), 0);
        assert_balanced(&store);
    }

    #[tokio::test]
    async fn test_wait_non_empty_then_peek_pop() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), 3).unwrap();
        let cancel = CancellationToken::new();

        store.enqueue(b"result", &cancel).await.unwrap();
        store.wait_non_empty(&cancel).await.unwrap();
        assert_eq!(store.peek().unwrap().unwrap(), b"result");
        assert_eq!(store.peek().unwrap().unwrap(), b"result");
        store.pop().unwrap();

        assert!(store.is_empty());
        assert_balanced(&store);
    }
}
