//! Per-connection request/response channel
//!
//! A channel segment carries one request and one response plus a stage
//! marker. Client and worker take turns: the client may only move the stage
//! to `RequestPending`, the worker may only move it out of `RequestPending`.
//! Every read and write of the records happens under the channel's own
//! [`SharedLock`]; the stage is additionally an atomic so the waiting side can
//! poll it without taking the lock.

use crate::{
    wait, BlockId, Block, BlockStore, PlatformUtils, Result, SharedLock, SharedLockGuard,
    SharedRecord, ShmError, WaitOptions,
};
use shm_compute_core::{OwnerName, RawRequest, RawResponse, Request, RequestKind, Response};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Channel record magic ("CHAN")
pub const CHANNEL_MAGIC: u32 = 0x4348414E;

/// Channel record layout version
pub const CHANNEL_LAYOUT_VERSION: u32 = shm_compute_core::RECORD_LAYOUT_VERSION;

/// Lifecycle stage of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Stage {
    Init = 0,
    RequestPending = 1,
    ResponseReady = 2,
    Closed = 3,
}

impl TryFrom<u32> for Stage {
    type Error = ShmError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Stage::Init),
            1 => Ok(Stage::RequestPending),
            2 => Ok(Stage::ResponseReady),
            3 => Ok(Stage::Closed),
            other => Err(ShmError::Protocol(format!("invalid channel stage {}", other))),
        }
    }
}

/// Side of the conversation driving a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Worker,
}

/// Reject every transition outside the stage machine
pub fn check_transition(role: Role, from: Stage, to: Stage) -> Result<()> {
    let legal = matches!(
        (role, from, to),
        (Role::Client, Stage::Init | Stage::ResponseReady, Stage::RequestPending)
            | (Role::Worker, Stage::RequestPending, Stage::ResponseReady | Stage::Closed)
    );

    if legal {
        Ok(())
    } else {
        Err(ShmError::Protocol(format!(
            "{:?} may not move channel from {:?} to {:?}",
            role, from, to
        )))
    }
}

/// Layout of a channel segment
#[repr(C)]
pub struct ChannelRecord {
    magic: AtomicU32,
    version: AtomicU32,
    stage: AtomicU32,
    _reserved: u32,
    last_activity_ms: AtomicU64,
    lock: SharedLock,
    /// Written once before the channel is published
    owner: UnsafeCell<OwnerName>,
    request: UnsafeCell<RawRequest>,
    response: UnsafeCell<RawResponse>,
}

// Cells are only touched while holding `lock`.
unsafe impl Sync for ChannelRecord {}
unsafe impl SharedRecord for ChannelRecord {}

impl ChannelRecord {
    /// Lock guarding the request and response cells
    pub fn lock(&self) -> &SharedLock {
        &self.lock
    }

    fn stage(&self) -> Result<Stage> {
        Stage::try_from(self.stage.load(Ordering::Acquire))
    }

    fn touch(&self) {
        self.last_activity_ms.store(PlatformUtils::monotonic_millis(), Ordering::Release);
    }
}

/// What the worker did with one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    /// Response written, stage is `ResponseReady`
    Responded(Response),
    /// `Unregister` acknowledged, stage is `Closed`
    Closed,
}

/// One side's view of a channel segment
pub struct Channel {
    store: BlockStore,
    block: Block,
    options: WaitOptions,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.block.id())
            .field("name", &self.block.name())
            .field("owner", &self.owner_name())
            .finish()
    }
}

impl Channel {
    /// Create and initialize a channel segment
    pub fn create(store: &BlockStore, name: &str, owner: &str, options: WaitOptions) -> Result<Self> {
        store.create_if_absent(name)?;
        let block = store.attach_by_name(name, std::mem::size_of::<ChannelRecord>())?;
        let record = block.view::<ChannelRecord>()?;

        record.magic.store(0, Ordering::Release);
        record.lock.init();
        // Nobody else can reach the segment until its id is published.
        unsafe {
            *record.owner.get() = OwnerName::new(owner);
            *record.request.get() = RawRequest::default();
            *record.response.get() = RawResponse::default();
        }
        record.stage.store(Stage::Init as u32, Ordering::Relaxed);
        record.touch();
        record.version.store(CHANNEL_LAYOUT_VERSION, Ordering::Relaxed);
        record.magic.store(CHANNEL_MAGIC, Ordering::Release);

        debug!("Created channel {} for {}", name, owner);
        Ok(Self { store: store.clone(), block, options })
    }

    /// Attach to a channel created by another process
    pub fn attach(store: &BlockStore, id: BlockId, options: WaitOptions) -> Result<Self> {
        let block = store.attach_by_id(id)?;
        let record = block.view::<ChannelRecord>()?;

        if record.magic.load(Ordering::Acquire) != CHANNEL_MAGIC {
            return Err(ShmError::Allocation(format!("block {} is not a channel", id)));
        }
        let version = record.version.load(Ordering::Relaxed);
        if version != CHANNEL_LAYOUT_VERSION {
            return Err(ShmError::Allocation(format!(
                "channel {} has layout version {}, expected {}",
                id, version, CHANNEL_LAYOUT_VERSION
            )));
        }

        Ok(Self { store: store.clone(), block, options })
    }

    pub fn id(&self) -> BlockId {
        self.block.id()
    }

    pub fn name(&self) -> &str {
        self.block.name()
    }

    pub fn owner_name(&self) -> String {
        // Immutable after publication.
        unsafe { (*self.record().owner.get()).as_str().to_string() }
    }

    pub fn stage(&self) -> Result<Stage> {
        self.record().stage()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.stage(), Ok(Stage::Closed))
    }

    /// Time since either side last moved the stage
    pub fn idle_for(&self) -> Duration {
        let last = self.record().last_activity_ms.load(Ordering::Acquire);
        Duration::from_millis(PlatformUtils::monotonic_millis().saturating_sub(last))
    }

    pub fn options(&self) -> WaitOptions {
        self.options
    }

    // Client side

    /// Publish a request. Legal from `Init` or `ResponseReady`.
    pub fn submit(&self, request: Request) -> Result<()> {
        self.submit_raw(request.into())
    }

    /// Publish a raw record as-is, discriminant included
    pub fn submit_raw(&self, request: RawRequest) -> Result<()> {
        let guard = self.lock()?;
        let from = self.record().stage()?;
        check_transition(Role::Client, from, Stage::RequestPending)?;

        unsafe { *guard.record.request.get() = request };
        guard.set_stage(Stage::RequestPending);
        Ok(())
    }

    /// Wait for the worker's answer to the last submitted request
    pub fn wait_response(&self, timeout: Duration) -> Result<Response> {
        wait::wait_until(timeout, self.options.backoff_cap, "waiting for response", || {
            match self.record().stage() {
                Ok(Stage::ResponseReady | Stage::Closed) => Some(Ok(())),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        })??;

        let guard = self.lock()?;
        let stage = self.record().stage()?;
        let request = unsafe { *guard.record.request.get() };
        let raw = unsafe { *guard.record.response.get() };
        drop(guard);

        if stage == Stage::Closed && request.kind != RequestKind::Unregister as u32 {
            return Err(ShmError::Protocol(format!("channel {} was closed by the server", self.name())));
        }

        Response::try_from(raw).map_err(|e| ShmError::Protocol(e.to_string()))
    }

    /// Submit and wait for the response
    pub fn call(&self, request: Request, timeout: Duration) -> Result<Response> {
        self.submit(request)?;
        self.wait_response(timeout)
    }

    // Worker side

    /// Wait until a request is pending or the channel is closed
    pub fn wait_request(&self, timeout: Duration) -> Result<Stage> {
        wait::wait_until(timeout, self.options.backoff_cap, "waiting for request", || {
            match self.record().stage() {
                Ok(stage @ (Stage::RequestPending | Stage::Closed)) => Some(Ok(stage)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        })?
    }

    /// Read the pending request, answer it with `handler` and move the stage,
    /// all under one lock hold.
    pub fn serve(&self, handler: impl FnOnce(&RawRequest) -> Response) -> Result<Served> {
        let guard = self.lock()?;
        let from = self.record().stage()?;
        if from != Stage::RequestPending {
            return Err(ShmError::Protocol(format!(
                "worker found channel {} in {:?}, expected RequestPending",
                self.name(),
                from
            )));
        }

        let request = unsafe { *guard.record.request.get() };
        let closing = request.kind == RequestKind::Unregister as u32;
        let to = if closing { Stage::Closed } else { Stage::ResponseReady };
        check_transition(Role::Worker, from, to)?;

        let response = handler(&request);
        unsafe { *guard.record.response.get() = response.into() };
        guard.set_stage(to);

        Ok(if closing { Served::Closed } else { Served::Responded(response) })
    }

    /// Close regardless of stage. A client still waiting sees a failure.
    pub fn force_close(&self) -> Result<()> {
        let guard = self.lock()?;
        if self.record().stage()? != Stage::Closed {
            unsafe { *guard.record.response.get() = Response::failure().into() };
            guard.set_stage(Stage::Closed);
            debug!("Force-closed channel {}", self.name());
        }
        Ok(())
    }

    /// Unlink the backing segment
    pub fn release(self) -> Result<()> {
        self.store.release(self.block.id())
    }

    fn record(&self) -> &ChannelRecord {
        // Validated by `create`/`attach`.
        unsafe { &*(self.block.as_ptr() as *const ChannelRecord) }
    }

    fn lock(&self) -> Result<ChannelGuard<'_>> {
        let record = self.record();
        let guard = record.lock().acquire(self.options.lock_timeout, self.options.backoff_cap)?;
        if guard.recovered() {
            warn!("Channel {} lock recovered from a dead holder", self.name());
        }
        Ok(ChannelGuard { record, _guard: guard })
    }
}

struct ChannelGuard<'a> {
    record: &'a ChannelRecord,
    _guard: SharedLockGuard<'a>,
}

impl ChannelGuard<'_> {
    fn set_stage(&self, stage: Stage) {
        self.record.touch();
        self.record.stage.store(stage as u32, Ordering::Release);
    }
}
