// Damped Jacobi preconditioner / smoother

use crate::error::EllError;
use crate::preconditioner::Preconditioner;
use crate::solver::EllSystem;

/// Jacobi preconditioner: z = omega D^{-1} r, with D the assembled operator
/// diagonal. `omega = 1` for plain preconditioning; damped (2/3 by default)
/// when used as a multigrid smoother.
pub struct Jacobi {
    inv_diag: Vec<f64>,
    omega: f64,
}

impl Jacobi {
    pub fn new(sys: &EllSystem) -> Self {
        Self::damped(sys, 1.0)
    }

    pub fn damped(sys: &EllSystem, omega: f64) -> Self {
        let mut diag = sys.op.assemble_diagonal();
        sys.gs
            .sync_fields(&mut diag, sys.nfields(), sys.field_offset(), crate::gs::GsOp::Sum);
        // Pin masked rows so the smoother leaves Dirichlet dofs untouched.
        for c in 0..sys.mask.ncomp {
            let base = c * sys.field_offset();
            for &s in &sys.mask.ids[c] {
                diag[base + s as usize] = 1.0;
            }
        }
        let inv_diag = diag
            .into_iter()
            .map(|d| if d != 0.0 { 1.0 / d } else { 0.0 })
            .collect();
        Self { inv_diag, omega }
    }

    pub fn inv_diag(&self) -> &[f64] {
        &self.inv_diag
    }
}

impl Preconditioner for Jacobi {
    fn apply(&mut self, r: &[f64], z: &mut [f64]) -> Result<(), EllError> {
        for i in 0..r.len() {
            z[i] = self.omega * self.inv_diag[i] * r[i];
        }
        Ok(())
    }
}
