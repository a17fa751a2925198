//! Solver session: one per distinct PDE field group.
//!
//! The session is the explicit state object every operation goes through;
//! there is no hidden per-module state. Construction classifies boundaries,
//! builds the gather-scatter handles, the matrix-free operator(s), the
//! preconditioner and the Krylov state, and validates the configuration
//! exhaustively before any solve is attempted. Setup-time misconfiguration
//! is fatal for the whole process group: `create` logs on the lowest rank
//! and aborts; `try_create` surfaces the same checks as a `Result` for
//! callers (and tests) that want them.

use std::sync::Arc;
use std::time::Instant;

use log::{error, info};

use crate::arena::{Buffer, ScratchArena};
use crate::bc::{BcState, BoundaryTable, classify};
use crate::config::{PreconKind, SolverKind, SolverOptions};
use crate::error::EllError;
use crate::gs::{GatherScatter, GsOp};
use crate::mesh::{ElementKind, HexMesh};
use crate::operator::{CoeffField, EllipticOperator};
use crate::preconditioner::multigrid::MgOptions;
use crate::preconditioner::{AdditiveSchwarz, Identity, Jacobi, Multigrid, Preconditioner};
use crate::projection::SolutionProjection;
use crate::solver::{EllSystem, FgmresSolver, PcgSolver, SolveReport};
use crate::utils::convergence::Convergence;

enum Krylov {
    Pcg(PcgSolver),
    Fgmres(FgmresSolver),
}

pub struct Session {
    pub options: SolverOptions,
    mesh: Arc<HexMesh>,
    /// One system for block/scalar solving, one per component otherwise.
    systems: Vec<Arc<EllSystem>>,
    precons: Vec<Box<dyn Preconditioner>>,
    solvers: Vec<Krylov>,
    projections: Vec<Option<SolutionProjection>>,
    rhs_work: Buffer,
    #[allow(dead_code)]
    arena: ScratchArena,
    nullspace: bool,
}

impl Session {
    /// Build a session or abort the whole process group on a configuration
    /// error (diagnostic on the lowest rank only).
    pub fn create(
        mesh: Arc<HexMesh>,
        table: &BoundaryTable,
        options: SolverOptions,
        coeff: CoeffField,
        comm: Arc<dyn crate::parallel::Comm>,
    ) -> Session {
        let comm_err = comm.clone();
        match Self::try_create(mesh, table, options, coeff, comm) {
            Ok(s) => s,
            Err(e) => {
                if comm_err.rank() == 0 {
                    error!("fatal elliptic setup error: {e}");
                }
                comm_err.abort(1)
            }
        }
    }

    pub fn try_create(
        mesh: Arc<HexMesh>,
        table: &BoundaryTable,
        options: SolverOptions,
        coeff: CoeffField,
        comm: Arc<dyn crate::parallel::Comm>,
    ) -> Result<Session, EllError> {
        let t_start = Instant::now();
        if options.name.is_empty() {
            return Err(EllError::Config("empty elliptic solver name".into()));
        }
        if mesh.kind != ElementKind::Hex {
            return Err(EllError::Config("elliptic solver only supports hex elements".into()));
        }
        let nf = options.nfields;
        if nf != 1 && nf != 3 {
            return Err(EllError::Config(format!("unsupported field count {nf}")));
        }
        if options.stress_form && nf != 3 {
            return Err(EllError::Config("stress form requires a 3-component field".into()));
        }

        let gs = Arc::new(GatherScatter::build(&mesh.global_ids, comm.clone())?);
        let bcs = classify(&mesh, table, &options.field, nf, &gs)?;

        Self::check_config(&options, &bcs)?;

        let nullspace = options.poisson && bcs.all_neumann;
        if comm.rank() == 0 {
            info!(
                "elliptic session {:?}: {} field(s), solver {:?}, preconditioner {:?}",
                options.name, nf, options.solver, options.precon
            );
            if nullspace {
                info!("non-trivial nullspace detected");
            }
        }

        let off = mesh.field_offset();
        let block_mode = nf == 1 || options.solver != SolverKind::Pcg;
        let (interior, shared) = mesh.split_elements(gs.shared_slots());

        let mut systems: Vec<Arc<EllSystem>> = Vec::new();
        if block_mode {
            let op = EllipticOperator::new(&mesh, coeff, nf, options.stress_form);
            systems.push(Arc::new(EllSystem::new(
                op,
                gs.clone(),
                bcs.mask,
                shared,
                interior,
                options.gs_overlap,
                nullspace,
            )));
        } else {
            // Component-wise: independent scalar systems sharing the
            // gather-scatter plan.
            let masks = bcs.mask.split_components();
            for (c, mask_c) in masks.into_iter().enumerate() {
                let op = EllipticOperator::new(&mesh, coeff.component(c, off), 1, false);
                systems.push(Arc::new(EllSystem::new(
                    op,
                    gs.clone(),
                    mask_c,
                    shared.clone(),
                    interior.clone(),
                    options.gs_overlap,
                    nullspace,
                )));
            }
        }

        // Scratch pool: solver state plus the assembled-rhs buffer, carved
        // once; an explicitly undersized budget is fatal.
        let len_total = nf * off;
        let len_sys = systems[0].len();
        let per_solver = match options.solver {
            SolverKind::Fgmres => (2 * options.fgmres_restart + 2) * len_sys,
            _ => 4 * len_sys,
        };
        let required = len_total + per_solver * systems.len();
        let budget = options.scratch_budget.unwrap_or(required);
        let mut arena = ScratchArena::with_budget(budget);
        let rhs_work = arena.alloc("rhs", len_total)?;

        let conv = Convergence {
            tol_rel: options.tol,
            tol_abs: options.tol_abs,
            max_iters: options.max_iters,
            div_factor: options.div_factor,
        };
        let mut precons: Vec<Box<dyn Preconditioner>> = Vec::new();
        let mut solvers = Vec::new();
        let mut projections = Vec::new();
        for (c, sys) in systems.iter().enumerate() {
            let pc: Box<dyn Preconditioner> = match options.precon {
                PreconKind::None => Box::new(Identity),
                PreconKind::Jacobi => Box::new(Jacobi::new(sys)),
                PreconKind::Schwarz { restricted } => {
                    Box::new(AdditiveSchwarz::new(sys.clone(), restricted)?)
                }
                PreconKind::Multigrid => Box::new(Multigrid::new(
                    sys.clone(),
                    &mesh,
                    table,
                    &options.field,
                    &MgOptions {
                        schedule: options.mg_schedule.clone(),
                        smoother: options.smoother,
                        cheby_degree: options.cheby_degree,
                        coarse_solve: options.coarse_solve,
                        reduced_precision: options.reduced_precision_smoother,
                    },
                )?),
            };
            precons.push(pc);
            let tag = format!("{}.{}", options.name, c);
            solvers.push(match options.solver {
                SolverKind::Fgmres => Krylov::Fgmres(FgmresSolver::new(
                    conv,
                    options.fgmres_restart,
                    &mut arena,
                    &tag,
                    sys.len(),
                )?),
                _ => Krylov::Pcg(PcgSolver::new(conv, &mut arena, &tag, sys.len())?),
            });
            projections.push(options.projection.map(|p| {
                SolutionProjection::new(p.kind, p.n_vecs, p.start_step, sys.len())
            }));
        }

        if comm.rank() == 0 {
            info!("elliptic session {:?} ready ({:.2?})", options.name, t_start.elapsed());
        }
        Ok(Session {
            options,
            mesh,
            systems,
            precons,
            solvers,
            projections,
            rhs_work,
            arena,
            nullspace,
        })
    }

    /// Exhaustive setup-time compatibility checks; everything here is fatal
    /// before the first solve.
    fn check_config(options: &SolverOptions, bcs: &BcState) -> Result<(), EllError> {
        let block_solver = options.nfields > 1 && options.solver != SolverKind::Pcg;
        if bcs.has_unaligned && !block_solver {
            return Err(EllError::Config("unaligned boundaries require the block solver".into()));
        }
        if options.precon == PreconKind::Multigrid {
            if options.nfields != 1 {
                return Err(EllError::Config(
                    "block solver does not support the multigrid preconditioner".into(),
                ));
            }
            if !options.poisson && options.smoother == crate::config::SmootherKind::Schwarz {
                return Err(EllError::Config(
                    "non-Poisson systems require a Jacobi-type multigrid smoother".into(),
                ));
            }
            if options.coarse_solve && !options.poisson {
                return Err(EllError::Config(
                    "multigrid coarse solve is only supported for Poisson-type systems".into(),
                ));
            }
        }
        if options.stress_form && matches!(options.precon, PreconKind::Schwarz { .. }) {
            return Err(EllError::Unsupported("additive Schwarz with stress-form coupling"));
        }
        Ok(())
    }

    pub fn nullspace(&self) -> bool {
        self.nullspace
    }

    /// Total field vector length (components x padded stride).
    pub fn len(&self) -> usize {
        self.options.nfields * self.mesh.field_offset()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Solve `A x = b` for one timestep.
    ///
    /// `b` is the locally integrated (unassembled) right-hand side; the
    /// session assembles and masks it. `x` carries the initial guess in and
    /// the solution out. Component-wise sessions return one stats entry per
    /// component; reaching the iteration cap is reported, not fatal.
    pub fn solve(&mut self, b: &[f64], x: &mut [f64]) -> Result<SolveReport, EllError> {
        let len = self.len();
        if b.len() != len || x.len() != len {
            return Err(EllError::Solve(format!(
                "field length mismatch: expected {len}, got rhs {} / solution {}",
                b.len(),
                x.len()
            )));
        }
        let off = self.mesh.field_offset();
        let mut rhs = self.rhs_work.borrow_mut();
        rhs.copy_from_slice(b);

        let mut stats = Vec::with_capacity(self.systems.len());
        for (c, sys) in self.systems.iter().enumerate() {
            let lo = c * sys.len();
            let hi = lo + sys.len();
            let rhs_c = &mut rhs[lo..hi];
            let x_c = &mut x[lo..hi];
            sys.gs.sync_fields(rhs_c, sys.nfields(), off, GsOp::Sum);
            sys.mask.apply(rhs_c);
            sys.project_nullspace(rhs_c);
            sys.mask.apply(x_c);
            sys.project_nullspace(x_c);

            // Anchor the tolerance to the assembled rhs before any warm-start
            // deflation shrinks the initial residual.
            let target_abs = self.options.tol_abs.max(self.options.tol * sys.norm(rhs_c));
            match &mut self.solvers[c] {
                Krylov::Pcg(k) => k.conv.tol_abs = target_abs,
                Krylov::Fgmres(k) => k.conv.tol_abs = target_abs,
            }

            let pc = self.precons[c].as_mut();
            if let Some(proj) = &mut self.projections[c] {
                proj.pre_solve(sys, rhs_c, x_c);
            }
            let s = match &mut self.solvers[c] {
                Krylov::Pcg(k) => k.solve(sys, pc, rhs_c, x_c)?,
                Krylov::Fgmres(k) => k.solve(sys, pc, rhs_c, x_c)?,
            };
            if let Some(proj) = &mut self.projections[c] {
                proj.post_solve(sys, x_c);
            }
            stats.push(s);
        }
        Ok(SolveReport { stats })
    }

    /// Per-component residual histories of the most recent solves.
    pub fn residual_history(&self, component: usize) -> &[f64] {
        match &self.solvers[component] {
            Krylov::Pcg(k) => &k.residual_history,
            Krylov::Fgmres(k) => &k.residual_history,
        }
    }

    pub fn clear_history(&mut self) {
        for s in &mut self.solvers {
            match s {
                Krylov::Pcg(k) => k.clear_history(),
                Krylov::Fgmres(k) => k.clear_history(),
            }
        }
    }
}
