//! The coordination boundary.  The coordinator runs the same collective calls in lockstep on
//! every rank; this trait is what a host dispatch plugs its communicator into.  [Solo] covers a
//! single process and [LocalGroup] fans one process out over threads, which is how the collective
//! paths are exercised in tests.

use std::sync::{Arc, Condvar, Mutex};

use zerror_core::ErrorCore;

use crate::Error;

/////////////////////////////////////////////// Group //////////////////////////////////////////////

/// A group of ranks executing the coordinator in lockstep.
pub trait Group {
    /// This process's rank, in `0..size()`.
    fn rank(&self) -> usize;
    /// The number of ranks in the group.
    fn size(&self) -> usize;
    /// Block until every rank arrives.
    fn barrier(&self) -> Result<(), Error>;
    /// Replace `data` on every rank with root's `data`.
    fn broadcast(&self, root: usize, data: &mut Vec<u8>) -> Result<(), Error>;
    /// The maximum of every rank's value.
    fn allreduce_max(&self, value: u64) -> Result<u64, Error>;
}

/////////////////////////////////////////////// Solo ///////////////////////////////////////////////

/// The one-rank group.
#[derive(Clone, Copy, Debug, Default)]
pub struct Solo;

impl Group for Solo {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), Error> {
        Ok(())
    }

    fn broadcast(&self, _root: usize, _data: &mut Vec<u8>) -> Result<(), Error> {
        Ok(())
    }

    fn allreduce_max(&self, value: u64) -> Result<u64, Error> {
        Ok(value)
    }
}

//////////////////////////////////////////// LocalGroup ////////////////////////////////////////////

struct Cell {
    generation: u64,
    arrived: usize,
    max: u64,
    payload: Vec<u8>,
    result_max: u64,
    result_payload: Vec<u8>,
}

struct Shared {
    size: usize,
    cell: Mutex<Cell>,
    wake: Condvar,
}

impl Shared {
    // Contribute to the current round and wait for the whole group.  The last rank to arrive
    // publishes the result and opens the next round.
    fn round<F: FnOnce(&mut Cell)>(&self, contribute: F) -> (u64, Option<Vec<u8>>) {
        let mut cell = self.cell.lock().unwrap();
        let generation = cell.generation;
        contribute(&mut cell);
        cell.arrived += 1;
        if cell.arrived == self.size {
            cell.arrived = 0;
            cell.generation += 1;
            cell.result_max = cell.max;
            cell.result_payload = std::mem::take(&mut cell.payload);
            cell.max = 0;
            self.wake.notify_all();
        } else {
            while cell.generation == generation {
                cell = self.wake.wait(cell).unwrap();
            }
        }
        (cell.result_max, Some(cell.result_payload.clone()))
    }
}

/// A group of ranks sharing one process, one rank per thread.
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Create a group of `size` ranks.  Hand one element to each thread.
    pub fn create(size: usize) -> Vec<LocalGroup> {
        assert!(size > 0);
        let shared = Arc::new(Shared {
            size,
            cell: Mutex::new(Cell {
                generation: 0,
                arrived: 0,
                max: 0,
                payload: Vec::new(),
                result_max: 0,
                result_payload: Vec::new(),
            }),
            wake: Condvar::new(),
        });
        (0..size)
            .map(|rank| LocalGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Group for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) -> Result<(), Error> {
        self.shared.round(|_| {});
        Ok(())
    }

    fn broadcast(&self, root: usize, data: &mut Vec<u8>) -> Result<(), Error> {
        if root >= self.shared.size {
            return Err(Error::LogicError {
                core: ErrorCore::default(),
                context: format!("broadcast root {} out of range", root),
            });
        }
        let contribution = if self.rank == root {
            Some(data.clone())
        } else {
            None
        };
        let (_, payload) = self.shared.round(|cell| {
            if let Some(bytes) = contribution {
                cell.payload = bytes;
            }
        });
        if self.rank != root {
            if let Some(payload) = payload {
                *data = payload;
            }
        }
        Ok(())
    }

    fn allreduce_max(&self, value: u64) -> Result<u64, Error> {
        let (max, _) = self.shared.round(|cell| {
            cell.max = std::cmp::max(cell.max, value);
        });
        Ok(max)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
