//! Preconditioned Conjugate Gradient on an assembled elliptic system.
//!
//! One instance drives either a block solve (all field components coupled
//! under a single convergence test, vector inner products) or one component
//! of a component-wise solve (the session runs an independent instance per
//! component, in identical order on every rank).
//!
//! For a nullspace-bearing (pure-Neumann) system the residual and every
//! preconditioner output are mean-projected each iteration; skipping this
//! stalls or diverges the iteration. Residual growth beyond the configured
//! factor of the initial norm is a hard failure rather than a silent crawl
//! to the iteration cap.

use log::debug;

use crate::arena::{Buffer, ScratchArena};
use crate::error::EllError;
use crate::preconditioner::Preconditioner;
use crate::solver::EllSystem;
use crate::utils::convergence::{Convergence, SolveStats, SolveStatus};

pub struct PcgSolver {
    pub conv: Convergence,
    pub monitor: Option<Box<dyn FnMut(usize, f64)>>,
    pub residual_history: Vec<f64>,
    r: Buffer,
    z: Buffer,
    p: Buffer,
    ap: Buffer,
}

impl PcgSolver {
    /// Scratch is carved from the session arena under `name`.
    pub fn new(
        conv: Convergence,
        arena: &mut ScratchArena,
        name: &str,
        len: usize,
    ) -> Result<Self, EllError> {
        Ok(Self {
            conv,
            monitor: None,
            residual_history: Vec::new(),
            r: arena.alloc(&format!("{name}.r"), len)?,
            z: arena.alloc(&format!("{name}.z"), len)?,
            p: arena.alloc(&format!("{name}.p"), len)?,
            ap: arena.alloc(&format!("{name}.ap"), len)?,
        })
    }

    pub fn with_monitor<F>(mut self, f: F) -> Self
    where
        F: FnMut(usize, f64) + 'static,
    {
        self.monitor = Some(Box::new(f));
        self
    }

    pub fn clear_history(&mut self) {
        self.residual_history.clear();
    }

    /// Solve `A x = b` for an assembled, masked right-hand side, starting
    /// from the initial guess in `x`. Reaching the iteration cap is a soft
    /// failure: the best iterate stays in `x` and the stats say `MaxIt`.
    pub fn solve(
        &mut self,
        sys: &EllSystem,
        pc: &mut dyn Preconditioner,
        b: &[f64],
        x: &mut [f64],
    ) -> Result<SolveStats, EllError> {
        let n = sys.len();
        debug_assert_eq!(b.len(), n);
        let mut r = self.r.borrow_mut();
        let mut z = self.z.borrow_mut();
        let mut p = self.p.borrow_mut();
        let mut ap = self.ap.borrow_mut();

        sys.apply(x, &mut ap);
        for i in 0..n {
            r[i] = b[i] - ap[i];
        }
        sys.project_nullspace(&mut r);

        let res0 = sys.norm(&r);
        self.residual_history.push(res0);
        if let Some(m) = &mut self.monitor {
            m(0, res0);
        }
        if res0 == 0.0 || res0 <= self.conv.tol_abs {
            return Ok(SolveStats {
                iterations: 0,
                initial_residual: res0,
                final_residual: res0,
                status: SolveStatus::Converged,
            });
        }

        let mut rz = 0.0;
        for iter in 1..=self.conv.max_iters {
            pc.apply(&r, &mut z)?;
            sys.project_nullspace(&mut z);
            let rz_new = sys.dot(&r, &z);
            if rz_new < 0.0 {
                return Err(EllError::IndefinitePreconditioner);
            }
            if iter == 1 {
                p.copy_from_slice(&z);
            } else {
                let beta = rz_new / rz;
                for i in 0..n {
                    p[i] = z[i] + beta * p[i];
                }
            }
            sys.apply(&p, &mut ap);
            let pap = sys.dot(&p, &ap);
            if pap <= 0.0 {
                return Err(EllError::IndefiniteOperator);
            }
            let alpha = rz_new / pap;
            for i in 0..n {
                x[i] += alpha * p[i];
            }
            for i in 0..n {
                r[i] -= alpha * ap[i];
            }
            sys.project_nullspace(&mut r);

            let res = sys.norm(&r);
            self.residual_history.push(res);
            if let Some(m) = &mut self.monitor {
                m(iter, res);
            }
            debug!("pcg it {iter}: res {res:.3e} (rel {:.3e})", res / res0);
            // A warm-started solve can begin with a tiny residual; judge
            // divergence against the tolerance floor as well.
            self.conv.guard(res, res0.max(self.conv.tol_abs))?;
            let (stop, stats) = self.conv.check(res, res0, iter);
            if stop {
                return Ok(stats);
            }
            rz = rz_new;
        }
        unreachable!("convergence check stops at max_iters");
    }
}
