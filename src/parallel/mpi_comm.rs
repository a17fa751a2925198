//! MPI-backed communication for distributed-memory runs.
//!
//! Wraps the world communicator and implements the collective reductions plus
//! the pairwise gather-scatter exchange. The exchange plan is built once per
//! session from an allgather of each rank's sorted unique global ids; per-call
//! traffic is one packed message per neighbor.

use mpi::collective::SystemOperation;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use super::{Comm, ExchangePlan, Neighbor, ReduceOp};

pub struct MpiComm {
    pub world: SimpleCommunicator,
    pub rank: usize,
    pub size: usize,
}

impl MpiComm {
    /// Initializes MPI and wraps the world communicator.
    ///
    /// # Panics
    /// Panics if MPI initialization fails.
    pub fn new() -> Self {
        let universe = mpi::initialize().unwrap();
        let world = universe.world();
        let rank = world.rank() as usize;
        let size = world.size() as usize;
        MpiComm { world, rank, size }
    }

    fn reduce_into(&self, x: f64, op: SystemOperation) -> f64 {
        let mut y = x;
        self.world.all_reduce_into(&x, &mut y, &op);
        y
    }
}

impl Comm for MpiComm {
    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }
    fn barrier(&self) {
        self.world.barrier();
    }
    fn all_reduce_sum(&self, x: f64) -> f64 {
        self.reduce_into(x, SystemOperation::sum())
    }
    fn all_reduce_min(&self, x: f64) -> f64 {
        self.reduce_into(x, SystemOperation::min())
    }
    fn all_reduce_max(&self, x: f64) -> f64 {
        self.reduce_into(x, SystemOperation::max())
    }
    fn abort(&self, code: i32) -> ! {
        self.world.abort(code)
    }

    fn build_exchange(&self, ids: &[u64]) -> ExchangePlan {
        // Pad every rank's id list to the global maximum so a plain allgather
        // suffices; u64::MAX marks padding.
        let n_max = self.all_reduce_max(ids.len() as f64) as usize;
        if n_max == 0 {
            return ExchangePlan::default();
        }
        let mut send = vec![u64::MAX; n_max];
        send[..ids.len()].copy_from_slice(ids);
        let mut recv = vec![u64::MAX; n_max * self.size];
        self.world.all_gather_into(&send[..], &mut recv[..]);

        let mut neighbors = Vec::new();
        for r in 0..self.size {
            if r == self.rank {
                continue;
            }
            let theirs = &recv[r * n_max..(r + 1) * n_max];
            // Two-pointer intersection; both lists are sorted ascending.
            let mut links = Vec::new();
            let (mut i, mut j) = (0usize, 0usize);
            while i < ids.len() && j < theirs.len() && theirs[j] != u64::MAX {
                if ids[i] < theirs[j] {
                    i += 1;
                } else if ids[i] > theirs[j] {
                    j += 1;
                } else {
                    links.push(i as u32);
                    i += 1;
                    j += 1;
                }
            }
            if !links.is_empty() {
                neighbors.push(Neighbor { rank: r, links });
            }
        }
        ExchangePlan { neighbors }
    }

    fn exchange(&self, plan: &ExchangePlan, vals: &mut [f64], op: ReduceOp) {
        // Pack every send buffer before combining anything, so each neighbor
        // receives this rank's own contribution only.
        let sends: Vec<Vec<f64>> = plan
            .neighbors
            .iter()
            .map(|nb| nb.links.iter().map(|&l| vals[l as usize]).collect())
            .collect();
        let mut recvs: Vec<Vec<f64>> = Vec::with_capacity(plan.neighbors.len());
        for (nb, sendbuf) in plan.neighbors.iter().zip(&sends) {
            let mut recvbuf = vec![0.0f64; sendbuf.len()];
            let peer = self.world.process_at_rank(nb.rank as i32);
            // Rank-ordered send/recv keeps the pairwise exchange deadlock-free.
            if self.rank < nb.rank {
                peer.send(&sendbuf[..]);
                peer.receive_into(&mut recvbuf[..]);
            } else {
                peer.receive_into(&mut recvbuf[..]);
                peer.send(&sendbuf[..]);
            }
            recvs.push(recvbuf);
        }
        for (nb, recvbuf) in plan.neighbors.iter().zip(&recvs) {
            for (&l, &rv) in nb.links.iter().zip(recvbuf.iter()) {
                let v = &mut vals[l as usize];
                match op {
                    ReduceOp::Sum => *v += rv,
                    ReduceOp::Min => *v = v.min(rv),
                }
            }
        }
    }

    fn all_gather_var(&self, local: &[f64], out: &mut Vec<f64>) {
        let n_max = self.all_reduce_max(local.len() as f64) as usize;
        let mut counts = vec![0.0f64; self.size];
        self.world
            .all_gather_into(&(local.len() as f64), &mut counts[..]);
        let mut send = vec![0.0f64; n_max];
        send[..local.len()].copy_from_slice(local);
        let mut recv = vec![0.0f64; n_max * self.size];
        self.world.all_gather_into(&send[..], &mut recv[..]);
        out.clear();
        for r in 0..self.size {
            let n_r = counts[r] as usize;
            out.extend_from_slice(&recv[r * n_max..r * n_max + n_r]);
        }
    }
}

impl Default for MpiComm {
    fn default() -> Self {
        Self::new()
    }
}
