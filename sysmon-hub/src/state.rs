use crate::models::MergedSnapshot;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// A snapshot together with the change token it was stored under.
#[derive(Debug)]
pub struct VersionedSnapshot {
    pub version: u64,
    pub snapshot: MergedSnapshot,
}

pub type StoreSlot = Option<Arc<VersionedSnapshot>>;

/// Single holder of the latest merged sample.
///
/// Writes replace the whole slot and bump the version by one, so versions are
/// strictly increasing no matter what the wall clock does. Readers either take
/// a copy with [`StateStore::read`] or follow writes through
/// [`StateStore::subscribe`]; neither side can hold up the writer.
#[derive(Clone)]
pub struct StateStore {
    slot: Arc<watch::Sender<StoreSlot>>,
}

impl StateStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { slot: Arc::new(tx) }
    }

    /// Last-writer-wins overwrite. Returns the version assigned to `snapshot`.
    pub fn write(&self, snapshot: MergedSnapshot) -> u64 {
        let mut assigned = 0;
        self.slot.send_modify(|slot| {
            assigned = slot.as_ref().map_or(1, |current| current.version + 1);
            *slot = Some(Arc::new(VersionedSnapshot { version: assigned, snapshot }));
        });
        assigned
    }

    pub fn read(&self) -> StoreSlot {
        self.slot.borrow().clone()
    }

    /// Version of the current snapshot, 0 before the first write.
    pub fn version(&self) -> u64 {
        self.slot.borrow().as_ref().map_or(0, |current| current.version)
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreSlot> {
        self.slot.subscribe()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
