//! Element-overlapping additive Schwarz preconditioner.
//!
//! One dense block per (field, element): the element stiffness corrected by
//! the assembled-vs-local diagonal difference, so each block is a
//! nonsingular surrogate of the assembled operator's principal submatrix.
//! Blocks are LU-factored once at setup; the apply solves all blocks,
//! scatters the overlapping solutions back, and reconciles them through the
//! gather-scatter layer. The restricted variant weights each contribution
//! by inverse multiplicity before the reconciliation.

use std::sync::Arc;

use faer::linalg::solvers::{FullPivLu, SolveCore};
use faer::{Conj, Mat, MatMut};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::error::EllError;
use crate::gs::GsOp;
use crate::preconditioner::Preconditioner;
use crate::solver::EllSystem;

pub struct AdditiveSchwarz {
    sys: Arc<EllSystem>,
    /// Weight block contributions by inverse multiplicity before summing.
    pub restricted: bool,
    /// One factorization per (field, element), field-major.
    lus: Vec<FullPivLu<f64>>,
}

impl AdditiveSchwarz {
    pub fn new(sys: Arc<EllSystem>, restricted: bool) -> Result<Self, EllError> {
        if sys.op.stress_form {
            return Err(EllError::Unsupported("additive Schwarz with stress-form coupling"));
        }
        let np3 = sys.op.np3();
        let nel = sys.op.nel();
        let nf = sys.nfields();
        let off = sys.field_offset();

        // Assembled diagonal (unpinned) for the block correction.
        let mut adiag = sys.op.assemble_diagonal();
        sys.gs.sync_fields(&mut adiag, nf, off, GsOp::Sum);

        // Masked slots bucketed per element block.
        let mut masked_by_block: Vec<Vec<usize>> = vec![Vec::new(); nf * nel];
        for c in 0..nf {
            for &s in &sys.mask.ids[c] {
                let e = s as usize / np3;
                masked_by_block[c * nel + e].push(s as usize - e * np3);
            }
        }

        let mut lus = Vec::with_capacity(nf * nel);
        for f in 0..nf {
            for e in 0..nel {
                let mut m = sys.op.element_matrix(f, e);
                for q in 0..np3 {
                    let slot = f * off + e * np3 + q;
                    m[q * np3 + q] += adiag[slot] - m[q * np3 + q];
                }
                for &q in &masked_by_block[f * nel + e] {
                    for j in 0..np3 {
                        m[q * np3 + j] = 0.0;
                        m[j * np3 + q] = 0.0;
                    }
                    m[q * np3 + q] = 1.0;
                }
                let mat = Mat::from_fn(np3, np3, |i, j| m[i * np3 + j]);
                lus.push(FullPivLu::new(mat.as_ref()));
            }
        }
        Ok(Self { sys, restricted, lus })
    }
}

impl Preconditioner for AdditiveSchwarz {
    fn apply(&mut self, r: &[f64], z: &mut [f64]) -> Result<(), EllError> {
        let sys = &self.sys;
        let np3 = sys.op.np3();
        let nel = sys.op.nel();
        let nf = sys.nfields();
        let off = sys.field_offset();

        let solve_block = |idx: usize| -> (usize, Vec<f64>) {
            let (f, e) = (idx / nel, idx % nel);
            let lo = f * off + e * np3;
            let mut x = r[lo..lo + np3].to_vec();
            let x_mat = MatMut::from_column_major_slice_mut(&mut x, np3, 1);
            self.lus[idx].solve_in_place_with_conj(Conj::No, x_mat);
            (idx, x)
        };
        #[cfg(feature = "rayon")]
        let blocks: Vec<(usize, Vec<f64>)> = (0..nf * nel).into_par_iter().map(solve_block).collect();
        #[cfg(not(feature = "rayon"))]
        let blocks: Vec<(usize, Vec<f64>)> = (0..nf * nel).map(solve_block).collect();

        z.iter_mut().for_each(|v| *v = 0.0);
        for (idx, x) in blocks {
            let (f, e) = (idx / nel, idx % nel);
            let lo = f * off + e * np3;
            z[lo..lo + np3].copy_from_slice(&x);
        }
        if self.restricted {
            let nl = sys.nlocal();
            for f in 0..nf {
                let base = f * off;
                for (s, &w) in sys.gs.inv_degree().iter().enumerate().take(nl) {
                    z[base + s] *= w;
                }
            }
        }
        sys.gs.sync_fields(z, nf, off, GsOp::Sum);
        sys.apply_mask(z);
        Ok(())
    }
}
