//! Client side of a connection: post a channel, then talk over it

use crate::config::Config;
use shm_compute_core::{Request, Response};
use shm_compute_shared_memory::{BlockId, BlockStore, Channel, ConnectionQueue, Result, ShmError};
use std::thread;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Delay before the first retry on a full queue, grown linearly per attempt
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// A registered connection to the server
#[derive(Debug)]
pub struct Client {
    channel: Channel,
    response_timeout: Duration,
}

impl Client {
    /// Open the server's queue as described by `config` and register under
    /// `owner`, or a generated name when `None`
    pub fn connect(config: &Config, owner: Option<&str>) -> Result<Self> {
        let store = BlockStore::new(&config.store_root)?;
        let queue = ConnectionQueue::open(&store, &config.queue_name, config.wait_options())?;
        let owner = owner.map(str::to_string).unwrap_or_else(default_owner);

        Self::connect_via(&queue, &owner, config.connect_retries, config.response_timeout())
    }

    /// Register on an already opened queue, retrying up to `retries` times
    /// while it is full
    #[instrument(skip(queue, response_timeout), fields(queue = %queue.name()))]
    pub fn connect_via(
        queue: &ConnectionQueue,
        owner: &str,
        retries: u32,
        response_timeout: Duration,
    ) -> Result<Self> {
        let mut attempt = 0;
        loop {
            match queue.post(owner) {
                Ok(channel) => {
                    debug!("Registered channel {}", channel.name());
                    return Ok(Self { channel, response_timeout });
                }
                Err(e @ ShmError::Capacity { .. }) if attempt < retries => {
                    attempt += 1;
                    warn!("{}, retrying ({}/{})", e, attempt, retries);
                    thread::sleep(RETRY_DELAY * attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn owner(&self) -> String {
        self.channel.owner_name()
    }

    pub fn channel_id(&self) -> BlockId {
        self.channel.id()
    }

    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }

    /// Send any request and wait for its response
    pub fn call(&self, request: Request) -> Result<Response> {
        self.channel.call(request, self.response_timeout)
    }

    pub fn arithmetic(&self, operator: u8, n1: i64, n2: i64) -> Result<Response> {
        self.call(Request::arithmetic(operator, n1, n2))
    }

    pub fn even_or_odd(&self, n: i64) -> Result<Response> {
        self.call(Request::even_or_odd(n))
    }

    pub fn is_prime(&self, n: i64) -> Result<Response> {
        self.call(Request::is_prime(n))
    }

    pub fn is_negative(&self, n: i64) -> Result<Response> {
        self.call(Request::is_negative(n))
    }

    /// End the connection. The server closes the channel and removes it.
    pub fn unregister(self) -> Result<Response> {
        self.call(Request::unregister())
    }
}

fn default_owner() -> String {
    format!("client-{}", uuid::Uuid::new_v4().simple())
}
