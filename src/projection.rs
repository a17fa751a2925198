//! Warm-start subspace projection across timesteps.
//!
//! Keeps a bounded, ordered basis of (solution, operator-image) pairs from
//! prior solves of the same operator. Before a solve the right-hand side is
//! projected onto the basis to build an improved initial guess (and the rhs
//! deflated accordingly); after the solve the new correction is inserted,
//! evicting the oldest pair once the bound is reached. Two variants: a
//! classical projection solving the small Gram system, and an A-conjugate
//! variant that keeps the basis orthonormal in the operator's energy inner
//! product. Purely an accelerator: the solver is correct with this
//! disabled.

use std::collections::VecDeque;

use faer::linalg::solvers::{FullPivLu, SolveCore};
use faer::{Conj, Mat, MatMut};
use log::debug;

use crate::solver::EllSystem;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectionKind {
    Classic,
    AConj,
}

pub struct SolutionProjection {
    kind: ProjectionKind,
    max_vecs: usize,
    start_step: usize,
    solves_seen: usize,
    xs: VecDeque<Vec<f64>>,
    axs: VecDeque<Vec<f64>>,
    xbar: Vec<f64>,
    work: Vec<f64>,
    applied: bool,
}

impl SolutionProjection {
    pub fn new(kind: ProjectionKind, max_vecs: usize, start_step: usize, len: usize) -> Self {
        Self {
            kind,
            max_vecs: max_vecs.max(1),
            start_step,
            solves_seen: 0,
            xs: VecDeque::new(),
            axs: VecDeque::new(),
            xbar: vec![0.0; len],
            work: vec![0.0; len],
            applied: false,
        }
    }

    pub fn basis_size(&self) -> usize {
        self.xs.len()
    }

    fn active(&self) -> bool {
        self.solves_seen >= self.start_step && !self.xs.is_empty()
    }

    /// Projection coefficients of `b` onto the stored basis.
    fn coefficients(&self, sys: &EllSystem, b: &[f64]) -> Vec<f64> {
        let k = self.xs.len();
        let c: Vec<f64> = self.xs.iter().map(|xk| sys.dot(b, xk)).collect();
        match self.kind {
            // A-orthonormal basis: the energy projection is diagonal.
            ProjectionKind::AConj => c,
            // Classic: solve the small Gram system G a = c with
            // G_kj = <x_k, A x_j>.
            ProjectionKind::Classic => {
                let g = Mat::from_fn(k, k, |i, j| sys.dot(&self.xs[i], &self.axs[j]));
                let mut a = c;
                let a_mat = MatMut::from_column_major_slice_mut(&mut a, k, 1);
                FullPivLu::new(g.as_ref()).solve_in_place_with_conj(Conj::No, a_mat);
                a
            }
        }
    }

    /// Deflate the rhs by the projected guess; the Krylov solve then starts
    /// from zero and produces only the correction.
    pub fn pre_solve(&mut self, sys: &EllSystem, b: &mut [f64], x: &mut [f64]) {
        self.applied = false;
        if !self.active() {
            return;
        }
        let alphas = self.coefficients(sys, b);
        self.xbar.iter_mut().for_each(|v| *v = 0.0);
        for (a, (xk, axk)) in alphas.iter().zip(self.xs.iter().zip(self.axs.iter())) {
            for i in 0..b.len() {
                self.xbar[i] += a * xk[i];
                b[i] -= a * axk[i];
            }
        }
        x.iter_mut().for_each(|v| *v = 0.0);
        self.applied = true;
        debug!("projection: deflated rhs against {} basis vectors", self.xs.len());
    }

    /// Fold the projected guess back into the solution and insert the new
    /// (correction, image) pair.
    pub fn post_solve(&mut self, sys: &EllSystem, x: &mut [f64]) {
        self.solves_seen += 1;
        let collect = self.solves_seen >= self.start_step;
        if collect {
            // One fresh operator application for the stored image.
            let mut dx = x.to_vec();
            sys.apply(&dx, &mut self.work);
            let mut w = self.work.clone();
            if self.kind == ProjectionKind::AConj {
                for (xk, axk) in self.xs.iter().zip(self.axs.iter()) {
                    let c = sys.dot(&w, xk);
                    for i in 0..dx.len() {
                        dx[i] -= c * xk[i];
                        w[i] -= c * axk[i];
                    }
                }
                let norm2 = sys.dot(&dx, &w);
                if norm2 > f64::EPSILON {
                    let inv = 1.0 / norm2.sqrt();
                    dx.iter_mut().for_each(|v| *v *= inv);
                    w.iter_mut().for_each(|v| *v *= inv);
                    self.push(dx, w);
                }
            } else {
                let norm2 = sys.dot(&dx, &w);
                if norm2 > f64::EPSILON {
                    self.push(dx, w);
                }
            }
        }
        if self.applied {
            for i in 0..x.len() {
                x[i] += self.xbar[i];
            }
            self.applied = false;
        }
    }

    fn push(&mut self, x: Vec<f64>, ax: Vec<f64>) {
        self.xs.push_back(x);
        self.axs.push_back(ax);
        // Oldest entry goes once the bound is reached.
        while self.xs.len() > self.max_vecs {
            self.xs.pop_front();
            self.axs.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_keeps_the_bound() {
        let mut p = SolutionProjection::new(ProjectionKind::Classic, 2, 0, 4);
        p.push(vec![1.0; 4], vec![1.0; 4]);
        p.push(vec![2.0; 4], vec![2.0; 4]);
        p.push(vec![3.0; 4], vec![3.0; 4]);
        assert_eq!(p.basis_size(), 2);
        assert_eq!(p.xs[0][0], 2.0, "oldest entry is evicted first");
    }

    #[test]
    fn inactive_before_start_step() {
        let p = SolutionProjection::new(ProjectionKind::AConj, 4, 3, 4);
        assert!(!p.active());
    }
}
