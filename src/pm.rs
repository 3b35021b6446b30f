//! Power-management bridge
//!
//! The system power manager asks every driver whether a state transition is
//! acceptable (`prepare`) and then tells it the transition happened
//! (`notify`). The display owns a small bridge forwarding both calls to the
//! clients registered through it, early registrants (input devices) first
//! and the rest after, so that they can defer clock gating while a frame or
//! transfer is in flight.

use alloc::sync::Arc;

use heapless::Vec;

use crate::errors::{Error, Result};
use crate::mutex::Mutex;

/// Number of early registrant slots.
pub const EARLY_SLOTS: usize = 1;

/// Number of regular registrant slots.
pub const LATE_SLOTS: usize = 1;

/// Power states, from the most to the least power hungry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PmState {
    #[default]
    Normal = 0,
    Idle = 1,
    Standby = 2,
    Sleep = 3,
}

impl PmState {
    /// Decodes a stored state. Unknown values map to `Sleep`.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => PmState::Normal,
            1 => PmState::Idle,
            2 => PmState::Standby,
            _ => PmState::Sleep,
        }
    }
}

/// Callbacks of a power-managed client.
pub trait PmCallback: Send + Sync {
    /// Asked before a transition to `state`. Returning an error vetoes it.
    /// Transitions to a higher power state must always be accepted.
    fn prepare(&self, domain: u8, state: PmState) -> Result<()>;

    /// Called once every client has accepted the transition to `state`.
    fn notify(&self, domain: u8, state: PmState);
}

impl<T> PmCallback for Arc<T>
where
    T: PmCallback + ?Sized,
{
    fn prepare(&self, domain: u8, state: PmState) -> Result<()> {
        (**self).prepare(domain, state)
    }

    fn notify(&self, domain: u8, state: PmState) {
        (**self).notify(domain, state)
    }
}

pub type PmClient = Arc<dyn PmCallback>;

struct Registry {
    early: Vec<PmClient, EARLY_SLOTS>,
    late: Vec<PmClient, LATE_SLOTS>,
    state: PmState,
}

impl Registry {
    /// Registrants in forward order: early ones first.
    fn forward(&self) -> impl DoubleEndedIterator<Item = &PmClient> {
        self.early.iter().chain(self.late.iter())
    }
}

pub struct PmBridge {
    registry: Mutex<Registry>,
}

impl PmBridge {
    pub const fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                early: Vec::new(),
                late: Vec::new(),
                state: PmState::Normal,
            }),
        }
    }

    /// Registers a client called before the regular ones when leaving
    /// normal power.
    ///
    /// # Errors
    ///
    /// * `Busy` - every early slot is taken
    pub fn register_early(&self, client: PmClient) -> Result<()> {
        self.registry
            .lock()
            .early
            .push(client)
            .map_err(|_| Error::Busy)
    }

    /// Registers a regular client.
    ///
    /// # Errors
    ///
    /// * `Busy` - every regular slot is taken
    pub fn register(&self, client: PmClient) -> Result<()> {
        self.registry
            .lock()
            .late
            .push(client)
            .map_err(|_| Error::Busy)
    }

    /// Removes `client` wherever it was registered. Unknown clients are
    /// ignored.
    pub fn unregister(&self, client: &PmClient) {
        let mut registry = self.registry.lock();

        if let Some(pos) = registry.early.iter().position(|c| Arc::ptr_eq(c, client)) {
            registry.early.remove(pos);
        } else if let Some(pos) = registry.late.iter().position(|c| Arc::ptr_eq(c, client)) {
            registry.late.remove(pos);
        }
    }

    pub fn registered(&self) -> usize {
        let registry = self.registry.lock();
        registry.early.len() + registry.late.len()
    }

    /// Asks every client about the transition to `state`. Every client is
    /// asked even after a veto; the first veto is returned.
    ///
    /// Returning from standby to normal asks the clients in reverse order.
    pub fn prepare(&self, domain: u8, state: PmState) -> Result<()> {
        let registry = self.registry.lock();
        let resuming = registry.state == PmState::Standby && state == PmState::Normal;

        let ask = |result: Result<()>, client: &PmClient| {
            let answer = client.prepare(domain, state);
            result.and(answer)
        };

        let result = if resuming {
            registry.forward().rev().fold(Ok(()), ask)
        } else {
            registry.forward().fold(Ok(()), ask)
        };

        if let Err(e) = result {
            log::debug!("pm: transition to {state:?} vetoed: {e}");
        }

        result
    }

    /// Tells every client the transition to `state` happened and caches it.
    ///
    /// Entering normal power notifies the clients in reverse order.
    pub fn notify(&self, domain: u8, state: PmState) {
        let mut registry = self.registry.lock();

        if state == PmState::Normal {
            registry
                .forward()
                .rev()
                .for_each(|client| client.notify(domain, state));
        } else {
            registry
                .forward()
                .for_each(|client| client.notify(domain, state));
        }

        registry.state = state;
    }

    /// State of the last completed transition.
    pub fn state(&self) -> PmState {
        self.registry.lock().state
    }
}

impl Default for PmBridge {
    fn default() -> Self {
        Self::new()
    }
}
