//! Team barriers
//!
//! Barrier implementations are selected by the `barrier` configuration
//! string. Only the centralized barrier ships today; tree and dissemination
//! variants plug in through the same trait.

use parking_lot::{Condvar, Mutex};

use crate::{Result, RuntimeError};

/// A reusable barrier for a fixed-size team
pub trait TeamBarrier: Send + Sync {
    /// Block until every team member has arrived
    fn wait(&self);

    /// Number of participants
    fn parties(&self) -> usize;
}

struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// Single counter + condvar barrier
pub struct CentralizedBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    release: Condvar,
}

impl CentralizedBarrier {
    /// Create a barrier for `parties` members
    #[must_use]
    pub fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            release: Condvar::new(),
        }
    }
}

impl TeamBarrier for CentralizedBarrier {
    fn wait(&self) {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            drop(state);
            self.release.notify_all();
            return;
        }
        while state.generation == generation {
            self.release.wait(&mut state);
        }
    }

    fn parties(&self) -> usize {
        self.parties
    }
}

/// Instantiate a barrier by its configuration name
pub fn create_barrier(name: &str, parties: usize) -> Result<Box<dyn TeamBarrier>> {
    match name {
        "centralized" => Ok(Box::new(CentralizedBarrier::new(parties))),
        other => Err(RuntimeError::UnknownBarrier(other.to_string())),
    }
}
