//! Flexible GMRES on an assembled elliptic system.
//!
//! Right-preconditioned, restarted GMRES that stores the preconditioned
//! basis, so the preconditioner may change its action from iteration to
//! iteration (variable multigrid smoothing, for instance). Modified
//! Gram-Schmidt orthogonalization with happy-breakdown detection; inner
//! products run through the system's weighted global reduction.

use log::debug;

use crate::arena::{Buffer, ScratchArena};
use crate::error::EllError;
use crate::preconditioner::Preconditioner;
use crate::solver::EllSystem;
use crate::utils::convergence::{Convergence, SolveStats, SolveStatus};

pub struct FgmresSolver {
    pub conv: Convergence,
    pub restart: usize,
    /// Happy-breakdown tolerance on the new basis vector's norm.
    pub haptol: f64,
    pub monitor: Option<Box<dyn FnMut(usize, f64)>>,
    pub residual_history: Vec<f64>,
    v: Vec<Buffer>,
    zb: Vec<Buffer>,
    w: Buffer,
}

impl FgmresSolver {
    pub fn new(
        conv: Convergence,
        restart: usize,
        arena: &mut ScratchArena,
        name: &str,
        len: usize,
    ) -> Result<Self, EllError> {
        let restart = restart.max(1);
        let mut v = Vec::with_capacity(restart + 1);
        for i in 0..=restart {
            v.push(arena.alloc(&format!("{name}.v{i}"), len)?);
        }
        let mut zb = Vec::with_capacity(restart);
        for i in 0..restart {
            zb.push(arena.alloc(&format!("{name}.z{i}"), len)?);
        }
        Ok(Self {
            conv,
            restart,
            haptol: 1e-12,
            monitor: None,
            residual_history: Vec::new(),
            v,
            zb,
            w: arena.alloc(&format!("{name}.w"), len)?,
        })
    }

    pub fn clear_history(&mut self) {
        self.residual_history.clear();
    }

    pub fn solve(
        &mut self,
        sys: &EllSystem,
        pc: &mut dyn Preconditioner,
        b: &[f64],
        x: &mut [f64],
    ) -> Result<SolveStats, EllError> {
        let n = sys.len();
        let m = self.restart;
        let mut w = self.w.borrow_mut();

        // Initial residual.
        sys.apply(x, &mut w);
        {
            let mut v0 = self.v[0].borrow_mut();
            for i in 0..n {
                v0[i] = b[i] - w[i];
            }
            sys.project_nullspace(&mut v0);
        }
        let res0 = sys.norm(&self.v[0].borrow());
        self.residual_history.push(res0);
        if let Some(mon) = &mut self.monitor {
            mon(0, res0);
        }
        if res0 == 0.0 || res0 <= self.conv.tol_abs {
            return Ok(SolveStats {
                iterations: 0,
                initial_residual: res0,
                final_residual: res0,
                status: SolveStatus::Converged,
            });
        }
        let target = self.conv.target(res0);

        let mut total_iters = 0usize;
        let mut beta = res0;
        loop {
            // One restart cycle.
            {
                let mut v0 = self.v[0].borrow_mut();
                for i in 0..n {
                    v0[i] /= beta;
                }
            }
            let mut h = vec![vec![0.0f64; m]; m + 1];
            let mut cs = vec![0.0f64; m];
            let mut sn = vec![0.0f64; m];
            let mut g = vec![0.0f64; m + 1];
            g[0] = beta;
            let mut k_used = 0;
            let mut res = beta;

            for j in 0..m {
                total_iters += 1;
                k_used = j + 1;
                {
                    let vj = self.v[j].borrow();
                    let mut zj = self.zb[j].borrow_mut();
                    pc.apply(&vj, &mut zj)?;
                    sys.project_nullspace(&mut zj);
                    sys.apply(&zj, &mut w);
                }
                sys.project_nullspace(&mut w);
                // Modified Gram-Schmidt against the Arnoldi basis.
                for i in 0..=j {
                    let vi = self.v[i].borrow();
                    let hij = sys.dot(&w, &vi);
                    h[i][j] = hij;
                    for q in 0..n {
                        w[q] -= hij * vi[q];
                    }
                }
                let hnext = sys.norm(&w);
                h[j + 1][j] = hnext;
                let happy = hnext <= self.haptol;
                if !happy {
                    let mut vnext = self.v[j + 1].borrow_mut();
                    for q in 0..n {
                        vnext[q] = w[q] / hnext;
                    }
                }
                // Apply stored Givens rotations, then form the new one.
                for i in 0..j {
                    let t = cs[i] * h[i][j] + sn[i] * h[i + 1][j];
                    h[i + 1][j] = -sn[i] * h[i][j] + cs[i] * h[i + 1][j];
                    h[i][j] = t;
                }
                let denom = (h[j][j] * h[j][j] + h[j + 1][j] * h[j + 1][j]).sqrt();
                if denom == 0.0 {
                    cs[j] = 1.0;
                    sn[j] = 0.0;
                } else {
                    cs[j] = h[j][j] / denom;
                    sn[j] = h[j + 1][j] / denom;
                }
                h[j][j] = cs[j] * h[j][j] + sn[j] * h[j + 1][j];
                h[j + 1][j] = 0.0;
                g[j + 1] = -sn[j] * g[j];
                g[j] *= cs[j];
                res = g[j + 1].abs();

                self.residual_history.push(res);
                if let Some(mon) = &mut self.monitor {
                    mon(total_iters, res);
                }
                debug!("fgmres it {total_iters}: res {res:.3e} (rel {:.3e})", res / res0);
                self.conv.guard(res, res0.max(self.conv.tol_abs))?;
                if res <= target || happy || total_iters >= self.conv.max_iters {
                    break;
                }
            }

            // y = H^{-1} g by back substitution, then x += Z y.
            let mut y = vec![0.0f64; k_used];
            for i in (0..k_used).rev() {
                let mut s = g[i];
                for j in (i + 1)..k_used {
                    s -= h[i][j] * y[j];
                }
                y[i] = s / h[i][i];
            }
            for (j, &yj) in y.iter().enumerate() {
                let zj = self.zb[j].borrow();
                for q in 0..n {
                    x[q] += yj * zj[q];
                }
            }

            // True residual for the restart / exit decision.
            sys.apply(x, &mut w);
            {
                let mut v0 = self.v[0].borrow_mut();
                for i in 0..n {
                    v0[i] = b[i] - w[i];
                }
                sys.project_nullspace(&mut v0);
            }
            beta = sys.norm(&self.v[0].borrow());
            self.conv.guard(beta, res0.max(self.conv.tol_abs))?;
            if beta <= target {
                return Ok(SolveStats {
                    iterations: total_iters,
                    initial_residual: res0,
                    final_residual: beta,
                    status: SolveStatus::Converged,
                });
            }
            if total_iters >= self.conv.max_iters {
                return Ok(SolveStats {
                    iterations: total_iters,
                    initial_residual: res0,
                    final_residual: beta,
                    status: SolveStatus::MaxIt,
                });
            }
        }
    }
}
