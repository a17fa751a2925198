//! Preconditioners for the elliptic Krylov solvers.
//!
//! All of them approximate the inverse of the assembled operator of an
//! [`crate::solver::EllSystem`]. `apply` must never mutate its input
//! residual; `&mut self` only covers internal scratch reuse, so a fixed
//! preconditioner stays a fixed linear operator across iterations. The
//! multigrid V-cycle with down-leveled smoothing is the one implementation
//! whose action may vary slightly iteration to iteration; pair it with the
//! flexible GMRES variant when that matters.

use crate::error::EllError;

pub trait Preconditioner {
    /// z = M^{-1} r.
    fn apply(&mut self, r: &[f64], z: &mut [f64]) -> Result<(), EllError>;
}

/// No preconditioning: z = r.
pub struct Identity;

impl Preconditioner for Identity {
    fn apply(&mut self, r: &[f64], z: &mut [f64]) -> Result<(), EllError> {
        z.copy_from_slice(r);
        Ok(())
    }
}

pub mod chebyshev;
pub mod jacobi;
pub mod multigrid;
pub mod schwarz;

pub use chebyshev::ChebyshevSmoother;
pub use jacobi::Jacobi;
pub use multigrid::Multigrid;
pub use schwarz::AdditiveSchwarz;
