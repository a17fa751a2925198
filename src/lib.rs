//! ellax: matrix-free spectral-element elliptic solves
//!
//! This crate provides the linear-elliptic-solve machinery shared by the
//! pressure and scalar equations of a spectral-element PDE code: boundary
//! classification and masking, a distributed gather-scatter layer, a
//! matrix-free Helmholtz operator, a p-multigrid/Schwarz/Jacobi
//! preconditioner hierarchy, Krylov solvers with nullspace handling, and
//! warm-start subspace projection across timesteps.

pub mod parallel;

pub mod arena;
pub mod basis;
pub mod bc;
pub mod config;
pub mod error;
pub mod gs;
pub mod mesh;
pub mod operator;
pub mod preconditioner;
pub mod projection;
pub mod session;
pub mod solver;
pub mod utils;

// Re-exports for convenience
pub use config::*;
pub use error::*;
pub use session::*;

// Re-export SolveStats at the crate root for convenience
pub use utils::convergence::{SolveStats, SolveStatus};
