//! Pool lifecycle states.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of one pool: `Closed → Starting → Running → Draining → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Closed,
    Starting,
    Running,
    Draining,
}

impl PoolState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PoolState::Starting,
            2 => PoolState::Running,
            3 => PoolState::Draining,
            _ => PoolState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PoolState::Closed => 0,
            PoolState::Starting => 1,
            PoolState::Running => 2,
            PoolState::Draining => 3,
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolState::Closed => "closed",
            PoolState::Starting => "starting",
            PoolState::Running => "running",
            PoolState::Draining => "draining",
        };
        f.write_str(name)
    }
}

/// Lock-free cell holding a [`PoolState`].
#[derive(Debug)]
pub(crate) struct AtomicPoolState(AtomicU8);

impl AtomicPoolState {
    pub fn new(state: PoolState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub fn get(&self) -> PoolState {
        PoolState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: PoolState) {
        self.0.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Move from `from` to `to`; fails if the current state isn't `from`.
    pub fn transition(&self, from: PoolState, to: PoolState) -> Result<(), PoolState> {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(PoolState::from_u8)
    }
}
