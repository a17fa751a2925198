//! Matrix-free elliptic operator evaluator.
//!
//! Computes the local action of the discrete Helmholtz operator
//! `A u = -div(lambda0 grad u) + lambda1 u` (weak form) element by element;
//! no matrix is ever materialized. The result is only a valid action of the
//! global operator after a gather-scatter Sum pass and masking, which the
//! session performs around these local kernels.
//!
//! Evaluation is restricted to a caller-specified element subset so that
//! elements feeding rank-shared dofs can be processed before the exchange
//! starts, overlapping interior work with communication. A reduced-precision
//! (f32) companion path serves the preconditioner smoothers.

use std::sync::Arc;

use num_traits::Float;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::mesh::{GEO_JW, HexMesh, NGEO};

/// Per-node coefficient fields, one pair per field component, laid out with
/// the session's field stride. Owned by the outer driver, read-only during a
/// solve.
#[derive(Clone, Debug)]
pub struct CoeffField {
    /// Leading-order (diffusivity) coefficient.
    pub lambda0: Vec<f64>,
    /// Zeroth-order (Helmholtz) coefficient; identically zero for a
    /// Poisson-type system.
    pub lambda1: Vec<f64>,
}

impl CoeffField {
    /// Spatially constant coefficients for `nfields` components.
    pub fn constant(l0: f64, l1: f64, nfields: usize, field_offset: usize) -> Self {
        Self {
            lambda0: vec![l0; nfields * field_offset],
            lambda1: vec![l1; nfields * field_offset],
        }
    }

    /// Extract the coefficients of a single component (for component-wise
    /// solving).
    pub fn component(&self, c: usize, field_offset: usize) -> Self {
        let lo = c * field_offset;
        Self {
            lambda0: self.lambda0[lo..lo + field_offset].to_vec(),
            lambda1: self.lambda1[lo..lo + field_offset].to_vec(),
        }
    }
}

pub struct EllipticOperator {
    pub nfields: usize,
    pub field_offset: usize,
    /// Adds the cross-component coupling of the variable-coefficient vector
    /// Laplacian in stress form.
    pub stress_form: bool,
    np: usize,
    nel: usize,
    deriv: Vec<f64>,
    geo: Arc<Vec<f64>>,
    jac_inv: Arc<Vec<f64>>,
    coeff: CoeffField,
    // reduced-precision companions for the smoother path
    deriv32: Vec<f32>,
    geo32: Arc<Vec<f32>>,
    jac_inv32: Arc<Vec<f32>>,
    lambda0_32: Vec<f32>,
    lambda1_32: Vec<f32>,
}

impl EllipticOperator {
    pub fn new(mesh: &HexMesh, coeff: CoeffField, nfields: usize, stress_form: bool) -> Self {
        let field_offset = mesh.field_offset();
        assert_eq!(coeff.lambda0.len(), nfields * field_offset);
        assert!(!stress_form || nfields == 3, "stress form needs a 3-component field");
        let geo = Arc::new(mesh.geo.clone());
        let jac_inv = Arc::new(mesh.jac_inv.clone());
        let geo32 = Arc::new(geo.iter().map(|&v| v as f32).collect::<Vec<_>>());
        let jac_inv32 = Arc::new(jac_inv.iter().map(|&v| v as f32).collect::<Vec<_>>());
        Self {
            nfields,
            field_offset,
            stress_form,
            np: mesh.np(),
            nel: mesh.nel,
            deriv: mesh.basis.deriv.clone(),
            deriv32: mesh.basis.deriv.iter().map(|&v| v as f32).collect(),
            geo32,
            jac_inv32,
            lambda0_32: coeff.lambda0.iter().map(|&v| v as f32).collect(),
            lambda1_32: coeff.lambda1.iter().map(|&v| v as f32).collect(),
            geo,
            jac_inv,
            coeff,
        }
    }

    pub fn nel(&self) -> usize {
        self.nel
    }

    pub fn np3(&self) -> usize {
        self.np * self.np * self.np
    }

    pub fn nlocal(&self) -> usize {
        self.nel * self.np3()
    }

    pub fn coeff(&self) -> &CoeffField {
        &self.coeff
    }

    fn element_apply<T: Float>(
        &self,
        e: usize,
        x: &[T],
        deriv: &[T],
        geo: &[T],
        jac_inv: &[T],
        l0: &[T],
        l1: &[T],
    ) -> Vec<T> {
        let np3 = self.np3();
        let base = e * np3;
        let geo_e = &geo[base * NGEO..(base + np3) * NGEO];
        let mut out = vec![T::zero(); self.nfields * np3];
        if self.stress_form {
            let jinv_e = &jac_inv[e * 9..(e + 1) * 9];
            let u: Vec<&[T]> = (0..3)
                .map(|c| &x[c * self.field_offset + base..c * self.field_offset + base + np3])
                .collect();
            let l0_e = &l0[base..base + np3];
            let l1_e: Vec<&[T]> = (0..3)
                .map(|c| &l1[c * self.field_offset + base..c * self.field_offset + base + np3])
                .collect();
            hex_stress(self.np, deriv, geo_e, jinv_e, l0_e, &l1_e, &u, &mut out);
        } else {
            for f in 0..self.nfields {
                let lo = f * self.field_offset + base;
                hex_helmholtz(
                    self.np,
                    deriv,
                    geo_e,
                    &l0[lo..lo + np3],
                    &l1[lo..lo + np3],
                    &x[lo..lo + np3],
                    &mut out[f * np3..(f + 1) * np3],
                );
            }
        }
        out
    }

    fn scatter_results<T: Float>(&self, results: Vec<(usize, Vec<T>)>, y: &mut [T]) {
        let np3 = self.np3();
        for (e, vals) in results {
            for f in 0..self.nfields {
                let lo = f * self.field_offset + e * np3;
                y[lo..lo + np3].copy_from_slice(&vals[f * np3..(f + 1) * np3]);
            }
        }
    }

    /// Local operator action on the given element subset; slots of elements
    /// outside the subset are left untouched. Pure: writes `y`, nothing
    /// else.
    pub fn apply_local(&self, elems: &[usize], x: &[f64], y: &mut [f64]) {
        #[cfg(feature = "rayon")]
        let results: Vec<(usize, Vec<f64>)> = elems
            .par_iter()
            .map(|&e| {
                (
                    e,
                    self.element_apply(
                        e,
                        x,
                        &self.deriv,
                        &self.geo,
                        &self.jac_inv,
                        &self.coeff.lambda0,
                        &self.coeff.lambda1,
                    ),
                )
            })
            .collect();
        #[cfg(not(feature = "rayon"))]
        let results: Vec<(usize, Vec<f64>)> = elems
            .iter()
            .map(|&e| {
                (
                    e,
                    self.element_apply(
                        e,
                        x,
                        &self.deriv,
                        &self.geo,
                        &self.jac_inv,
                        &self.coeff.lambda0,
                        &self.coeff.lambda1,
                    ),
                )
            })
            .collect();
        self.scatter_results(results, y);
    }

    /// Reduced-precision companion of [`apply_local`], used inside
    /// preconditioner levels.
    pub fn apply_local_f32(&self, elems: &[usize], x: &[f32], y: &mut [f32]) {
        #[cfg(feature = "rayon")]
        let results: Vec<(usize, Vec<f32>)> = elems
            .par_iter()
            .map(|&e| {
                (
                    e,
                    self.element_apply(
                        e,
                        x,
                        &self.deriv32,
                        &self.geo32,
                        &self.jac_inv32,
                        &self.lambda0_32,
                        &self.lambda1_32,
                    ),
                )
            })
            .collect();
        #[cfg(not(feature = "rayon"))]
        let results: Vec<(usize, Vec<f32>)> = elems
            .iter()
            .map(|&e| {
                (
                    e,
                    self.element_apply(
                        e,
                        x,
                        &self.deriv32,
                        &self.geo32,
                        &self.jac_inv32,
                        &self.lambda0_32,
                        &self.lambda1_32,
                    ),
                )
            })
            .collect();
        self.scatter_results(results, y);
    }

    /// Dense element matrix of one field's local operator, row-major
    /// `np3 x np3`, built by probing the element kernel. Serves the Schwarz
    /// blocks and the coarse-level assembly; not available in stress form.
    pub fn element_matrix(&self, f: usize, e: usize) -> Vec<f64> {
        assert!(!self.stress_form, "element_matrix: stress form blocks are coupled");
        let np3 = self.np3();
        let base = e * np3;
        let lo = f * self.field_offset + base;
        let geo_e = &self.geo[base * NGEO..(base + np3) * NGEO];
        let l0_e = &self.coeff.lambda0[lo..lo + np3];
        let l1_e = &self.coeff.lambda1[lo..lo + np3];
        let mut mat = vec![0.0; np3 * np3];
        let mut unit = vec![0.0; np3];
        let mut col = vec![0.0; np3];
        for j in 0..np3 {
            unit.iter_mut().for_each(|v| *v = 0.0);
            unit[j] = 1.0;
            hex_helmholtz(self.np, &self.deriv, geo_e, l0_e, l1_e, &unit, &mut col);
            for i in 0..np3 {
                mat[i * np3 + j] = col[i];
            }
        }
        mat
    }

    /// Un-assembled diagonal of the local operator (per field); the caller
    /// gather-scatter sums it and pins masked entries.
    pub fn assemble_diagonal(&self) -> Vec<f64> {
        let np = self.np;
        let np3 = self.np3();
        let d = &self.deriv;
        let mut diag = vec![0.0; self.nfields * self.field_offset];
        for f in 0..self.nfields {
            for e in 0..self.nel {
                let base = e * np3;
                let lo = f * self.field_offset + base;
                for k in 0..np {
                    for j in 0..np {
                        for i in 0..np {
                            let q = (k * np + j) * np + i;
                            let mut v = 0.0;
                            for m in 0..np {
                                let qm_r = base + (k * np + j) * np + m;
                                let qm_s = base + (k * np + m) * np + i;
                                let qm_t = base + (m * np + j) * np + i;
                                v += d[m * np + i] * d[m * np + i]
                                    * self.geo[qm_r * NGEO] * self.coeff.lambda0[f * self.field_offset + qm_r];
                                v += d[m * np + j] * d[m * np + j]
                                    * self.geo[qm_s * NGEO + 3] * self.coeff.lambda0[f * self.field_offset + qm_s];
                                v += d[m * np + k] * d[m * np + k]
                                    * self.geo[qm_t * NGEO + 5] * self.coeff.lambda0[f * self.field_offset + qm_t];
                            }
                            let g = &self.geo[(base + q) * NGEO..(base + q + 1) * NGEO];
                            let l0q = self.coeff.lambda0[lo + q];
                            v += 2.0 * d[i * np + i] * d[j * np + j] * g[1] * l0q;
                            v += 2.0 * d[i * np + i] * d[k * np + k] * g[2] * l0q;
                            v += 2.0 * d[j * np + j] * d[k * np + k] * g[4] * l0q;
                            v += self.coeff.lambda1[lo + q] * g[GEO_JW];
                            diag[lo + q] = v;
                        }
                    }
                }
            }
        }
        diag
    }
}

/// Tensor-product collocation derivatives of one element field.
fn tensor_derivs<T: Float>(np: usize, d: &[T], u: &[T], ur: &mut [T], us: &mut [T], ut: &mut [T]) {
    for k in 0..np {
        for j in 0..np {
            for i in 0..np {
                let q = (k * np + j) * np + i;
                let (mut a, mut b, mut c) = (T::zero(), T::zero(), T::zero());
                for m in 0..np {
                    a = a + d[i * np + m] * u[(k * np + j) * np + m];
                    b = b + d[j * np + m] * u[(k * np + m) * np + i];
                    c = c + d[k * np + m] * u[(m * np + j) * np + i];
                }
                ur[q] = a;
                us[q] = b;
                ut[q] = c;
            }
        }
    }
}

/// Adjoint of [`tensor_derivs`]: accumulate `D^T` contributions into `au`.
fn tensor_derivs_adjoint<T: Float>(np: usize, d: &[T], wr: &[T], ws: &[T], wt: &[T], au: &mut [T]) {
    for k in 0..np {
        for j in 0..np {
            for i in 0..np {
                let q = (k * np + j) * np + i;
                let mut s = au[q];
                for m in 0..np {
                    s = s + d[m * np + i] * wr[(k * np + j) * np + m]
                        + d[m * np + j] * ws[(k * np + m) * np + i]
                        + d[m * np + k] * wt[(m * np + j) * np + i];
                }
                au[q] = s;
            }
        }
    }
}

/// Scalar Helmholtz element kernel:
/// `au = D^T (lambda0 G D u) + lambda1 B u` with G the metric factors and B
/// the collocation mass weights.
fn hex_helmholtz<T: Float>(
    np: usize,
    d: &[T],
    geo_e: &[T],
    l0_e: &[T],
    l1_e: &[T],
    u: &[T],
    au: &mut [T],
) {
    let np3 = np * np * np;
    let mut ur = vec![T::zero(); np3];
    let mut us = vec![T::zero(); np3];
    let mut ut = vec![T::zero(); np3];
    tensor_derivs(np, d, u, &mut ur, &mut us, &mut ut);
    for q in 0..np3 {
        let g = &geo_e[q * NGEO..(q + 1) * NGEO];
        let h0 = l0_e[q];
        let wr = h0 * (g[0] * ur[q] + g[1] * us[q] + g[2] * ut[q]);
        let ws = h0 * (g[1] * ur[q] + g[3] * us[q] + g[4] * ut[q]);
        let wt = h0 * (g[2] * ur[q] + g[4] * us[q] + g[5] * ut[q]);
        ur[q] = wr;
        us[q] = ws;
        ut[q] = wt;
        au[q] = l1_e[q] * g[GEO_JW] * u[q];
    }
    tensor_derivs_adjoint(np, d, &ur, &us, &ut, au);
}

/// Stress-form element kernel for a 3-component field:
/// `au_i = D^T ( jw lambda0 (du_i/dx_b + du_b/dx_i) dxi_a/dx_b ) + lambda1 B u_i`.
fn hex_stress<T: Float>(
    np: usize,
    d: &[T],
    geo_e: &[T],
    jinv_e: &[T],
    l0_e: &[T],
    l1_e: &[&[T]],
    u: &[&[T]],
    out: &mut [T],
) {
    let np3 = np * np * np;
    let mut dref = vec![T::zero(); 9 * np3]; // d xi_a u_i, a-major then i
    for i in 0..3 {
        let (head, tail) = dref[(i * 3) * np3..(i * 3 + 3) * np3].split_at_mut(np3);
        let (mid, last) = tail.split_at_mut(np3);
        tensor_derivs(np, d, u[i], head, mid, last);
    }
    // Physical gradients, symmetrized stress, then weak-form pullback.
    let mut w = vec![T::zero(); 9 * np3]; // per component i, per direction a
    for q in 0..np3 {
        let jw = geo_e[q * NGEO + GEO_JW];
        let h0 = l0_e[q];
        let mut grad = [[T::zero(); 3]; 3]; // grad[i][b] = du_i / dx_b
        for i in 0..3 {
            for b in 0..3 {
                let mut s = T::zero();
                for a in 0..3 {
                    s = s + jinv_e[a * 3 + b] * dref[(i * 3 + a) * np3 + q];
                }
                grad[i][b] = s;
            }
        }
        for i in 0..3 {
            for a in 0..3 {
                let mut s = T::zero();
                for b in 0..3 {
                    let strain = grad[i][b] + grad[b][i];
                    s = s + strain * jinv_e[a * 3 + b];
                }
                w[(i * 3 + a) * np3 + q] = jw * h0 * s;
            }
        }
    }
    for i in 0..3 {
        let au = &mut out[i * np3..(i + 1) * np3];
        for q in 0..np3 {
            au[q] = l1_e[i][q] * geo_e[q * NGEO + GEO_JW] * u[i][q];
        }
        let wr = &w[(i * 3) * np3..(i * 3 + 1) * np3];
        let ws = &w[(i * 3 + 1) * np3..(i * 3 + 2) * np3];
        let wt = &w[(i * 3 + 2) * np3..(i * 3 + 3) * np3];
        tensor_derivs_adjoint(np, d, wr, ws, wt, au);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gs::{GatherScatter, GsOp};
    use crate::parallel::SerialComm;
    use approx::assert_abs_diff_eq;
    use rand::Rng;
    use std::sync::Arc as StdArc;

    fn setup(order: usize) -> (HexMesh, GatherScatter, EllipticOperator) {
        let mesh = HexMesh::box_mesh(2, 2, 2, order, [1.0, 1.0, 1.0]);
        let gs = GatherScatter::build(&mesh.global_ids, StdArc::new(SerialComm)).unwrap();
        let coeff = CoeffField::constant(1.0, 0.0, 1, mesh.field_offset());
        let op = EllipticOperator::new(&mesh, coeff, 1, false);
        (mesh, gs, op)
    }

    fn all_elems(mesh: &HexMesh) -> Vec<usize> {
        (0..mesh.nel).collect()
    }

    /// Assembled global action: gs-Sum of the local action of a consistent
    /// input field.
    fn apply_global(op: &EllipticOperator, gs: &GatherScatter, x: &[f64]) -> Vec<f64> {
        let elems: Vec<usize> = (0..op.nel()).collect();
        let mut y = vec![0.0; x.len()];
        op.apply_local(&elems, x, &mut y);
        gs.sync(&mut y[..op.nlocal()], GsOp::Sum);
        y
    }

    #[test]
    fn kills_constants_for_pure_laplacian() {
        let (mesh, gs, op) = setup(3);
        let x = vec![1.0; mesh.field_offset()];
        let y = apply_global(&op, &gs, &x);
        for &v in &y[..mesh.nlocal()] {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn operator_is_symmetric() {
        let (mesh, gs, op) = setup(3);
        let mut rng = rand::thread_rng();
        let n = mesh.field_offset();
        // Continuous random fields: reconcile duplicates first.
        let mut u: Vec<f64> = (0..n).map(|_| rng.r#gen::<f64>() - 0.5).collect();
        let mut v: Vec<f64> = (0..n).map(|_| rng.r#gen::<f64>() - 0.5).collect();
        u[mesh.nlocal()..].iter_mut().for_each(|p| *p = 0.0);
        v[mesh.nlocal()..].iter_mut().for_each(|p| *p = 0.0);
        gs.sync(&mut u[..mesh.nlocal()], GsOp::Avg);
        gs.sync(&mut v[..mesh.nlocal()], GsOp::Avg);
        let au = apply_global(&op, &gs, &u);
        let av = apply_global(&op, &gs, &v);
        let uav = gs.weighted_dot_local(&u[..mesh.nlocal()], &av[..mesh.nlocal()]);
        let vau = gs.weighted_dot_local(&v[..mesh.nlocal()], &au[..mesh.nlocal()]);
        assert_abs_diff_eq!(uav, vau, epsilon = 1e-9 * uav.abs().max(1.0));
    }

    #[test]
    fn symmetric_with_variable_coefficients() {
        let mesh = HexMesh::box_mesh(2, 2, 2, 2, [1.0, 1.0, 1.0]);
        let gs = GatherScatter::build(&mesh.global_ids, StdArc::new(SerialComm)).unwrap();
        let mut rng = rand::thread_rng();
        let off = mesh.field_offset();
        let mut coeff = CoeffField::constant(0.0, 0.0, 1, off);
        // Positive, continuous coefficient fields.
        for s in 0..mesh.nlocal() {
            coeff.lambda0[s] = 1.0 + rng.r#gen::<f64>();
            coeff.lambda1[s] = rng.r#gen::<f64>();
        }
        gs.sync(&mut coeff.lambda0[..mesh.nlocal()], GsOp::Avg);
        gs.sync(&mut coeff.lambda1[..mesh.nlocal()], GsOp::Avg);
        let op = EllipticOperator::new(&mesh, coeff, 1, false);
        let mut u: Vec<f64> = (0..off).map(|_| rng.r#gen::<f64>() - 0.5).collect();
        let mut v: Vec<f64> = (0..off).map(|_| rng.r#gen::<f64>() - 0.5).collect();
        u[mesh.nlocal()..].iter_mut().for_each(|p| *p = 0.0);
        v[mesh.nlocal()..].iter_mut().for_each(|p| *p = 0.0);
        gs.sync(&mut u[..mesh.nlocal()], GsOp::Avg);
        gs.sync(&mut v[..mesh.nlocal()], GsOp::Avg);
        let au = apply_global(&op, &gs, &u);
        let av = apply_global(&op, &gs, &v);
        let uav = gs.weighted_dot_local(&u[..mesh.nlocal()], &av[..mesh.nlocal()]);
        let vau = gs.weighted_dot_local(&v[..mesh.nlocal()], &au[..mesh.nlocal()]);
        assert_abs_diff_eq!(uav, vau, epsilon = 1e-9 * uav.abs().max(1.0));
    }

    #[test]
    fn partial_evaluation_covers_the_partition() {
        let (mesh, _gs, op) = setup(2);
        let mut rng = rand::thread_rng();
        let x: Vec<f64> = (0..mesh.field_offset()).map(|_| rng.r#gen()).collect();
        let mut y_all = vec![0.0; x.len()];
        op.apply_local(&all_elems(&mesh), &x, &mut y_all);
        let mut y_split = vec![0.0; x.len()];
        let first: Vec<usize> = (0..4).collect();
        let second: Vec<usize> = (4..8).collect();
        op.apply_local(&first, &x, &mut y_split);
        op.apply_local(&second, &x, &mut y_split);
        for (a, b) in y_all.iter().zip(y_split.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn reduced_precision_path_tracks_the_double_path() {
        let (mesh, _gs, op) = setup(3);
        let mut rng = rand::thread_rng();
        let x: Vec<f64> = (0..mesh.field_offset()).map(|_| rng.r#gen::<f64>() - 0.5).collect();
        let x32: Vec<f32> = x.iter().map(|&v| v as f32).collect();
        let mut y = vec![0.0f64; x.len()];
        let mut y32 = vec![0.0f32; x.len()];
        op.apply_local(&all_elems(&mesh), &x, &mut y);
        op.apply_local_f32(&all_elems(&mesh), &x32, &mut y32);
        for (a, b) in y.iter().zip(y32.iter()) {
            assert_abs_diff_eq!(*a, *b as f64, epsilon = 2e-3 * a.abs().max(1.0));
        }
    }

    #[test]
    fn diagonal_matches_probing() {
        let mesh = HexMesh::box_mesh(1, 1, 1, 2, [1.0, 1.0, 1.0]);
        let off = mesh.field_offset();
        let coeff = CoeffField::constant(1.0, 0.5, 1, off);
        let op = EllipticOperator::new(&mesh, coeff, 1, false);
        let elems = vec![0usize];
        let diag = op.assemble_diagonal();
        let mut e = vec![0.0; off];
        let mut col = vec![0.0; off];
        for q in 0..mesh.nlocal() {
            e.iter_mut().for_each(|v| *v = 0.0);
            e[q] = 1.0;
            op.apply_local(&elems, &e, &mut col);
            assert_abs_diff_eq!(diag[q], col[q], epsilon = 1e-11 * diag[q].abs().max(1.0));
        }
    }

    #[test]
    fn stress_form_is_symmetric() {
        let mesh = HexMesh::box_mesh(2, 1, 1, 2, [1.0, 1.0, 1.0]);
        let gs = GatherScatter::build(&mesh.global_ids, StdArc::new(SerialComm)).unwrap();
        let off = mesh.field_offset();
        let mut rng = rand::thread_rng();
        let mut coeff = CoeffField::constant(0.0, 0.1, 3, off);
        for f in 0..3 {
            for s in 0..mesh.nlocal() {
                coeff.lambda0[f * off + s] = 1.0 + rng.r#gen::<f64>();
            }
            gs.sync(&mut coeff.lambda0[f * off..f * off + mesh.nlocal()], GsOp::Avg);
        }
        // Stress form shares one lambda0 across components.
        let l0 = coeff.lambda0[..off].to_vec();
        for f in 1..3 {
            coeff.lambda0[f * off..(f + 1) * off].copy_from_slice(&l0);
        }
        let op = EllipticOperator::new(&mesh, coeff, 3, true);
        let n = 3 * off;
        let mk = |rng: &mut rand::rngs::ThreadRng| {
            let mut v: Vec<f64> = (0..n).map(|_| rng.r#gen::<f64>() - 0.5).collect();
            for f in 0..3 {
                v[f * off + mesh.nlocal()..(f + 1) * off].iter_mut().for_each(|p| *p = 0.0);
                gs.sync(&mut v[f * off..f * off + mesh.nlocal()], GsOp::Avg);
            }
            v
        };
        let u = mk(&mut rng);
        let v = mk(&mut rng);
        let elems = all_elems(&mesh);
        let mut au = vec![0.0; n];
        let mut av = vec![0.0; n];
        op.apply_local(&elems, &u, &mut au);
        op.apply_local(&elems, &v, &mut av);
        gs.sync_fields(&mut au, 3, off, GsOp::Sum);
        gs.sync_fields(&mut av, 3, off, GsOp::Sum);
        let mut uav = 0.0;
        let mut vau = 0.0;
        for f in 0..3 {
            uav += gs.weighted_dot_local(&u[f * off..f * off + mesh.nlocal()], &av[f * off..f * off + mesh.nlocal()]);
            vau += gs.weighted_dot_local(&v[f * off..f * off + mesh.nlocal()], &au[f * off..f * off + mesh.nlocal()]);
        }
        assert_abs_diff_eq!(uav, vau, epsilon = 1e-9 * uav.abs().max(1.0));
    }
}
