//! Fatal-configuration paths: every unsupported combination must surface at
//! setup, deterministically, before any solve is attempted.

use std::sync::Arc;

use ellax::bc::BoundaryTable;
use ellax::error::EllError;
use ellax::mesh::HexMesh;
use ellax::operator::CoeffField;
use ellax::parallel::SerialComm;
use ellax::session::Session;
use ellax::{PreconKind, SmootherKind, SolverKind, SolverOptions};

fn mesh() -> Arc<HexMesh> {
    Arc::new(HexMesh::box_mesh(2, 2, 2, 3, [1.0, 1.0, 1.0]))
}

fn table(field: &str, condition: &str) -> BoundaryTable {
    let mut t = BoundaryTable::new();
    for bid in 1..=6 {
        t.set(bid, field, condition);
    }
    t
}

fn try_create(opts: SolverOptions) -> Result<Session, EllError> {
    let m = mesh();
    let t = table(&opts.field, "dirichlet");
    let coeff = CoeffField::constant(1.0, 0.0, opts.nfields, m.field_offset());
    Session::try_create(m, &t, opts, coeff, Arc::new(SerialComm))
}

#[test]
fn block_solver_with_multigrid_aborts_setup() {
    let mut opts = SolverOptions::new("velocity");
    opts.nfields = 3;
    opts.poisson = true;
    opts.solver = SolverKind::PcgBlock;
    opts.precon = PreconKind::Multigrid;
    let err = try_create(opts).err().expect("block + multigrid must be rejected");
    assert!(matches!(err, EllError::Config(_)), "unexpected error: {err:?}");
}

#[test]
fn empty_solver_name_is_fatal() {
    let opts = SolverOptions::new("");
    assert!(try_create(opts).is_err());
}

#[test]
fn non_poisson_multigrid_needs_jacobi_type_smoother() {
    let mut opts = SolverOptions::new("scalar00");
    opts.poisson = false;
    opts.coarse_solve = false;
    opts.precon = PreconKind::Multigrid;
    opts.smoother = SmootherKind::Schwarz;
    assert!(try_create(opts).is_err());
}

#[test]
fn multigrid_coarse_solve_requires_poisson() {
    let mut opts = SolverOptions::new("scalar00");
    opts.poisson = false;
    opts.precon = PreconKind::Multigrid;
    opts.coarse_solve = true;
    assert!(try_create(opts).is_err());
}

#[test]
fn coarse_direct_solve_needs_linear_coarsest_level() {
    let mut opts = SolverOptions::new("pressure");
    opts.poisson = true;
    opts.precon = PreconKind::Multigrid;
    opts.coarse_solve = true;
    opts.mg_schedule = Some(vec![3, 2]);
    let err = try_create(opts).err().expect("degree-2 coarse direct solve must be rejected");
    assert!(matches!(err, EllError::Config(_)));
}

#[test]
fn undersized_scratch_pool_is_fatal() {
    let mut opts = SolverOptions::new("pressure");
    opts.poisson = true;
    opts.scratch_budget = Some(16);
    let err = try_create(opts).err().expect("tiny scratch budget must fail");
    assert!(matches!(err, EllError::ArenaExhausted(_)));
}

#[test]
fn unaligned_scalar_mode_is_rejected_at_classification() {
    // zero-normal boundaries on a scalar field cannot be expressed at all.
    let m = mesh();
    let t = table("pressure", "zero-normal");
    let opts = SolverOptions::new("pressure");
    let coeff = CoeffField::constant(1.0, 0.0, 1, m.field_offset());
    assert!(Session::try_create(m, &t, opts, coeff, Arc::new(SerialComm)).is_err());
}

#[test]
fn valid_setup_still_passes() {
    let mut opts = SolverOptions::new("pressure");
    opts.poisson = true;
    opts.precon = PreconKind::Multigrid;
    opts.coarse_solve = true;
    assert!(try_create(opts).is_ok());
}
