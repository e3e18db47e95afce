use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{RemoteChannel, RemoteError, Transport};

/// Number of channels probed at most on initialization.
pub const DEFAULT_PROBE_CEILING: usize = 20;

/// A cache of opened, unused command channels of one connection.
///
/// On creation the pool probes how many channels the remote endpoint allows
/// on one connection and keeps those channels. A channel is owned by exactly
/// one caller once [acquired](Self::acquire); executing a command consumes it.
///
/// The pool never blocks: when it is empty, [acquire](Self::acquire) opens a
/// new channel on demand. It is a cache, not a limit on concurrency.
pub struct SessionPool<T: Transport> {
    transport: T,
    idle: Mutex<Vec<T::Channel>>,
    capacity: usize,
}

impl<T: Transport> SessionPool<T> {
    /// Opens channels until `ceiling` is reached or the endpoint refuses one.
    ///
    /// The capacity of the pool is the number of channels actually opened.
    pub fn probe(transport: T, ceiling: usize) -> Self {
        let mut idle = Vec::with_capacity(ceiling);
        while idle.len() < ceiling {
            match transport.open_channel() {
                Ok(channel) => idle.push(channel),
                Err(e) => {
                    log::debug!(target: "backup::remote", "Channel probe stopped after {} channel(s): {e}", idle.len());
                    break;
                }
            }
        }

        let capacity = idle.len();
        log::info!(target: "backup::remote", "Remote endpoint accepts {capacity} concurrent channel(s)");
        Self {
            transport,
            idle: Mutex::new(idle),
            capacity,
        }
    }

    /// Maximum number of channels kept in the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of channels currently available in the pool.
    pub fn idle(&self) -> usize {
        self.lock().len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Takes an idle channel or opens a new one if the pool is empty.
    pub fn acquire(&self) -> Result<T::Channel, RemoteError> {
        if let Some(channel) = self.lock().pop() {
            return Ok(channel);
        }

        log::trace!(target: "backup::remote", "Channel pool exhausted, opening an unpooled channel");
        self.transport.open_channel()
    }

    /// Returns an unused channel, closing it if the pool is full.
    pub fn release(&self, channel: T::Channel) {
        let mut idle = self.lock();
        if idle.len() < self.capacity {
            idle.push(channel);
        } else {
            drop(idle);
            channel.close();
        }
    }

    /// Closes every idle channel and returns how many were closed.
    pub fn drain(&self) -> usize {
        let channels = mem::take(&mut *self.lock());
        let closed = channels.len();
        channels.into_iter().for_each(RemoteChannel::close);
        closed
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T::Channel>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
