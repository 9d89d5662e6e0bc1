//! Cross-process connection queue
//!
//! A fixed-capacity circular buffer in one well-known segment. Slots hold the
//! block ids of freshly created channels, never channel data. The queue lock
//! covers only head/tail/count and the slot array; channel segments are
//! created and attached with the lock released.

use crate::{
    BlockId, Block, BlockStore, Channel, PlatformUtils, Result, SharedLock, SharedLockGuard,
    SharedRecord, ShmError, WaitOptions,
};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

/// Number of slots in the queue segment
pub const MAX_QUEUE_LEN: usize = 100;

/// Well-known name of the server's queue segment
pub const DEFAULT_QUEUE_NAME: &str = "srv_conn_channel";

/// Queue record magic ("CONQ")
pub const QUEUE_MAGIC: u32 = 0x434F4E51;

/// Queue record layout version
pub const QUEUE_LAYOUT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct QueueState {
    head: u32,
    tail: u32,
    count: u32,
    _reserved: u32,
    nodes: [u64; MAX_QUEUE_LEN],
}

/// Layout of the queue segment
#[repr(C)]
pub struct QueueRecord {
    magic: AtomicU32,
    version: AtomicU32,
    capacity: AtomicU32,
    _reserved: u32,
    /// Source of unique channel names
    next_seq: AtomicU64,
    lock: SharedLock,
    state: UnsafeCell<QueueState>,
}

// `state` is only touched while holding `lock`.
unsafe impl Sync for QueueRecord {}
unsafe impl SharedRecord for QueueRecord {}

/// Handle on the connection queue segment
pub struct ConnectionQueue {
    store: BlockStore,
    block: Block,
    capacity: usize,
    options: WaitOptions,
}

impl std::fmt::Debug for ConnectionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionQueue")
            .field("name", &self.block.name())
            .field("id", &self.block.id())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl ConnectionQueue {
    /// Create (or re-initialize) the queue segment named `name`
    pub fn create(store: &BlockStore, name: &str, capacity: usize, options: WaitOptions) -> Result<Self> {
        if capacity == 0 || capacity > MAX_QUEUE_LEN {
            return Err(ShmError::Allocation(format!(
                "queue capacity {} must be within 1..={}",
                capacity, MAX_QUEUE_LEN
            )));
        }

        store.create_if_absent(name)?;
        let block = store.attach_by_name(name, std::mem::size_of::<QueueRecord>())?;
        let record = block.view::<QueueRecord>()?;

        record.magic.store(0, Ordering::Release);
        record.lock.init();
        // Not yet valid for other processes: magic is still zero.
        unsafe {
            *record.state.get() = QueueState {
                head: 0,
                tail: 0,
                count: 0,
                _reserved: 0,
                nodes: [0; MAX_QUEUE_LEN],
            };
        }
        record.capacity.store(capacity as u32, Ordering::Relaxed);
        record.next_seq.store(PlatformUtils::now_nanos(), Ordering::Relaxed);
        record.version.store(QUEUE_LAYOUT_VERSION, Ordering::Relaxed);
        record.magic.store(QUEUE_MAGIC, Ordering::Release);

        info!("Created connection queue {} (capacity {})", name, capacity);
        Ok(Self { store: store.clone(), block, capacity, options })
    }

    /// Attach to a queue created by another process
    pub fn open(store: &BlockStore, name: &str, options: WaitOptions) -> Result<Self> {
        let block = store.attach_by_id(BlockStore::block_id_for(name))?;
        let record = block.view::<QueueRecord>()?;

        if record.magic.load(Ordering::Acquire) != QUEUE_MAGIC {
            return Err(ShmError::Allocation(format!("segment {} is not an initialized queue", name)));
        }
        let version = record.version.load(Ordering::Relaxed);
        if version != QUEUE_LAYOUT_VERSION {
            return Err(ShmError::Allocation(format!(
                "queue {} has layout version {}, expected {}",
                name, version, QUEUE_LAYOUT_VERSION
            )));
        }
        let capacity = record.capacity.load(Ordering::Relaxed) as usize;
        if capacity == 0 || capacity > MAX_QUEUE_LEN {
            return Err(ShmError::Allocation(format!("queue {} has corrupt capacity {}", name, capacity)));
        }

        debug!("Opened connection queue {}", name);
        Ok(Self { store: store.clone(), block, capacity, options })
    }

    pub fn name(&self) -> &str {
        self.block.name()
    }

    pub fn block_id(&self) -> BlockId {
        self.block.id()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    /// Create a channel for `owner` and enqueue it.
    ///
    /// A full queue returns `Capacity` without touching any slot.
    pub fn post(&self, owner: &str) -> Result<Channel> {
        let record = self.record();

        {
            let guard = self.lock()?;
            if guard.state().count as usize >= self.capacity {
                warn!("Connection queue {} is full, rejecting {}", self.name(), owner);
                return Err(ShmError::Capacity { capacity: self.capacity });
            }
        }

        let seq = record.next_seq.fetch_add(1, Ordering::Relaxed);
        let channel = Channel::create(&self.store, &channel_name(self.name(), seq), owner, self.options)?;

        match self.publish(channel.id()) {
            Ok(()) => {
                debug!("Posted channel {} for {}", channel.name(), owner);
                Ok(channel)
            }
            Err(e) => {
                // Filled up (or lock timed out) while the channel was being built.
                if let Err(release_err) = channel.release() {
                    warn!("Failed to release unpublished channel: {}", release_err);
                }
                if let ShmError::Capacity { .. } = e {
                    warn!("Connection queue {} is full, rejecting {}", self.name(), owner);
                }
                Err(e)
            }
        }
    }

    /// Take the oldest channel off the queue and attach it. An entry whose
    /// segment cannot be attached is still consumed, and its segment released.
    pub fn dequeue(&self) -> Result<Channel> {
        let id = {
            let mut guard = self.lock()?;
            let capacity = self.capacity as u32;
            let state = guard.state_mut();
            if state.count == 0 {
                trace!("Connection queue {} is empty", self.name());
                return Err(ShmError::Empty);
            }

            let id = state.nodes[state.head as usize];
            state.head = (state.head + 1) % capacity;
            state.count -= 1;
            BlockId(id)
        };

        Channel::attach(&self.store, id, self.options).map_err(|e| {
            // The entry is gone from the queue; nobody else will reclaim it.
            warn!("Dropping unusable channel {}: {}", id, e);
            if let Err(release_err) = self.store.release(id) {
                warn!("Failed to release channel {}: {}", id, release_err);
            }
            e
        })
    }

    /// Attach the oldest channel without removing it
    pub fn peek(&self) -> Result<Channel> {
        let id = {
            let guard = self.lock()?;
            let state = guard.state();
            if state.count == 0 {
                trace!("Connection queue {} is empty", self.name());
                return Err(ShmError::Empty);
            }
            BlockId(state.nodes[state.head as usize])
        };

        Channel::attach(&self.store, id, self.options)
    }

    /// Drop every queued entry without releasing their segments.
    /// Returns the number of entries dropped.
    pub fn reset(&self) -> Result<usize> {
        let mut guard = self.lock()?;
        let state = guard.state_mut();
        let dropped = state.count as usize;
        state.count = 0;
        state.head = state.tail;

        if dropped > 0 {
            warn!("Reset connection queue {}, dropped {} entries", self.name(), dropped);
        }
        Ok(dropped)
    }

    /// Ids of queued channels, oldest first
    pub fn pending(&self) -> Result<Vec<BlockId>> {
        let guard = self.lock()?;
        let state = guard.state();
        Ok((0..state.count as usize)
            .map(|i| BlockId(state.nodes[(state.head as usize + i) % self.capacity]))
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.state().count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Unlink the queue segment. Queued channels are not touched.
    pub fn destroy(self) -> Result<()> {
        info!("Destroying connection queue {}", self.name());
        self.store.release(self.block.id())
    }

    fn publish(&self, id: BlockId) -> Result<()> {
        let mut guard = self.lock()?;
        let capacity = self.capacity as u32;
        let state = guard.state_mut();
        if state.count >= capacity {
            return Err(ShmError::Capacity { capacity: self.capacity });
        }

        state.nodes[state.tail as usize] = id.0;
        state.tail = (state.tail + 1) % capacity;
        state.count += 1;
        Ok(())
    }

    fn record(&self) -> &QueueRecord {
        // Validated by `create`/`open`.
        unsafe { &*(self.block.as_ptr() as *const QueueRecord) }
    }

    fn lock(&self) -> Result<QueueGuard<'_>> {
        let record = self.record();
        let guard = record.lock.acquire(self.options.lock_timeout, self.options.backoff_cap)?;
        if guard.recovered() {
            warn!("Connection queue {} lock recovered from a dead holder", self.name());
        }
        Ok(QueueGuard { record, _guard: guard })
    }
}

struct QueueGuard<'a> {
    record: &'a QueueRecord,
    _guard: SharedLockGuard<'a>,
}

impl QueueGuard<'_> {
    fn state(&self) -> &QueueState {
        unsafe { &*self.record.state.get() }
    }

    fn state_mut(&mut self) -> &mut QueueState {
        unsafe { &mut *self.record.state.get() }
    }
}

/// Segment name of the channel posted with sequence number `seq`
pub fn channel_name(queue_name: &str, seq: u64) -> String {
    format!("{}.chan.{:016x}", queue_name, seq)
}
