//! Krylov solver core and the assembled-operator view it drives.

use std::sync::Arc;

use crate::bc::MaskSet;
use crate::gs::{GatherScatter, GsOp};
use crate::operator::EllipticOperator;
use crate::utils::convergence::SolveStats;

pub mod fgmres;
pub mod pcg;

pub use fgmres::FgmresSolver;
pub use pcg::PcgSolver;

/// One field system: the local matrix-free evaluator together with the
/// consistency layer and masks that make its action a valid global
/// operator. Krylov solvers and multigrid levels both drive this.
pub struct EllSystem {
    pub op: EllipticOperator,
    pub gs: Arc<GatherScatter>,
    pub mask: MaskSet,
    /// Elements feeding rank-shared dofs; evaluated before the exchange
    /// starts.
    pub shared_elems: Vec<usize>,
    pub interior_elems: Vec<usize>,
    /// Overlap the exchange with interior-element evaluation.
    pub overlap: bool,
    /// Project out the constant nullspace (pure-Neumann Poisson systems).
    pub nullspace: bool,
    elems_all: Vec<usize>,
}

impl EllSystem {
    pub fn new(
        op: EllipticOperator,
        gs: Arc<GatherScatter>,
        mask: MaskSet,
        shared_elems: Vec<usize>,
        interior_elems: Vec<usize>,
        overlap: bool,
        nullspace: bool,
    ) -> Self {
        let mut elems_all = Vec::with_capacity(shared_elems.len() + interior_elems.len());
        elems_all.extend_from_slice(&shared_elems);
        elems_all.extend_from_slice(&interior_elems);
        Self { op, gs, mask, shared_elems, interior_elems, overlap, nullspace, elems_all }
    }
    pub fn nfields(&self) -> usize {
        self.op.nfields
    }

    pub fn field_offset(&self) -> usize {
        self.op.field_offset
    }

    /// Total storage length of one field vector (all components, padded).
    pub fn len(&self) -> usize {
        self.op.nfields * self.op.field_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nlocal(&self) -> usize {
        self.op.nlocal()
    }

    /// Assembled, masked operator action `y = A x`. The input is expected to
    /// be masked and consistent (as every Krylov iterate is); only `y` is
    /// written.
    pub fn apply(&self, x: &[f64], y: &mut [f64]) {
        let nf = self.nfields();
        let off = self.field_offset();
        if self.overlap && !self.shared_elems.is_empty() {
            self.op.apply_local(&self.shared_elems, x, y);
            let pendings = self.gs.start_fields(y, nf, off, GsOp::Sum);
            self.op.apply_local(&self.interior_elems, x, y);
            self.gs.finish_fields(y, off, pendings);
        } else {
            self.op.apply_local(&self.elems_all, x, y);
            self.gs.sync_fields(y, nf, off, GsOp::Sum);
        }
        self.mask.apply(y);
    }

    /// Reduced-precision operator action used by preconditioner smoothers;
    /// assembly and masking still run in f64.
    pub fn apply_pfloat(&self, x: &[f64], y: &mut [f64]) {
        let x32: Vec<f32> = x.iter().map(|&v| v as f32).collect();
        let mut y32 = vec![0.0f32; y.len()];
        self.op.apply_local_f32(&self.elems_all, &x32, &mut y32);
        for (yo, &yi) in y.iter_mut().zip(y32.iter()) {
            *yo = yi as f64;
        }
        self.gs.sync_fields(y, self.nfields(), self.field_offset(), GsOp::Sum);
        self.mask.apply(y);
    }

    /// Weighted global inner product over all field components: every unique
    /// dof counts once; one collective reduction.
    pub fn dot(&self, a: &[f64], b: &[f64]) -> f64 {
        let off = self.field_offset();
        let nl = self.nlocal();
        let mut local = 0.0;
        for f in 0..self.nfields() {
            let lo = f * off;
            local += self.gs.weighted_dot_local(&a[lo..lo + nl], &b[lo..lo + nl]);
        }
        self.gs.comm().all_reduce_sum(local)
    }

    pub fn norm(&self, a: &[f64]) -> f64 {
        self.dot(a, a).sqrt()
    }

    /// Remove the global mean of each component. A no-op unless the system
    /// carries the constant nullspace.
    pub fn project_nullspace(&self, x: &mut [f64]) {
        if !self.nullspace {
            return;
        }
        let off = self.field_offset();
        let nl = self.nlocal();
        let n_global = self.gs.n_global();
        for f in 0..self.nfields() {
            let lo = f * off;
            let local: f64 = x[lo..lo + nl]
                .iter()
                .zip(self.gs.inv_degree())
                .map(|(&v, &w)| v * w)
                .sum();
            let mean = self.gs.comm().all_reduce_sum(local) / n_global;
            for v in x[lo..lo + nl].iter_mut() {
                *v -= mean;
            }
        }
    }

    pub fn apply_mask(&self, x: &mut [f64]) {
        self.mask.apply(x);
    }
}

/// Per-solve report: one entry for a block solve, one per component for
/// component-wise solving.
#[derive(Clone, Debug)]
pub struct SolveReport {
    pub stats: Vec<SolveStats>,
}

impl SolveReport {
    pub fn converged(&self) -> bool {
        self.stats.iter().all(|s| s.converged())
    }

    pub fn iterations(&self) -> usize {
        self.stats.iter().map(|s| s.iterations).max().unwrap_or(0)
    }
}
