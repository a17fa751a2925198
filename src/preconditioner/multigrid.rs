//! p-multigrid V-cycle preconditioner.
//!
//! Levels follow a decreasing polynomial-degree schedule ending at the
//! piecewise-linear level. Each level owns its own gather-scatter handle,
//! masks, matrix-free operator (built from the session's coefficient data
//! restricted to that level), and smoother. Inter-level transfer is
//! tensor-product GLL interpolation; restriction is its adjoint with dual
//! (inverse-multiplicity) weighting. The coarsest level is either solved
//! directly (assembled redundantly and LU-factored once at setup) or
//! smoothed like any other level when the coarse solve is disabled.

use std::sync::Arc;

use faer::linalg::solvers::{FullPivLu, SolveCore};
use faer::{Conj, Mat, MatMut};

use crate::basis::{Basis1D, interp_matrix};
use crate::bc::{BoundaryTable, classify};
use crate::config::{SmootherKind, default_mg_schedule};
use crate::error::EllError;
use crate::gs::{GatherScatter, GsOp};
use crate::mesh::HexMesh;
use crate::operator::{CoeffField, EllipticOperator};
use crate::preconditioner::{AdditiveSchwarz, ChebyshevSmoother, Jacobi, Preconditioner};
use crate::solver::EllSystem;

#[derive(Clone, Debug)]
pub struct MgOptions {
    /// Degree schedule, finest first; derived from the mesh order when
    /// absent.
    pub schedule: Option<Vec<usize>>,
    pub smoother: SmootherKind,
    pub cheby_degree: usize,
    /// Solve the coarsest level directly; requires the schedule to end at
    /// degree 1.
    pub coarse_solve: bool,
    /// Run smoother operator applications through the f32 companion path.
    pub reduced_precision: bool,
}

enum LevelSmoother {
    Cheby(ChebyshevSmoother),
    Jacobi(Jacobi),
    Schwarz(AdditiveSchwarz),
}

impl LevelSmoother {
    fn smooth(&mut self, sys: &EllSystem, r: &[f64], z: &mut [f64]) -> Result<(), EllError> {
        match self {
            LevelSmoother::Cheby(c) => {
                c.smooth(sys, r, z);
                Ok(())
            }
            LevelSmoother::Jacobi(j) => j.apply(r, z),
            LevelSmoother::Schwarz(s) => s.apply(r, z),
        }
    }
}

struct MgLevel {
    sys: Arc<EllSystem>,
    smoother: LevelSmoother,
    np: usize,
    /// 1-D transfer to/from the next coarser level; None on the coarsest.
    prolong_1d: Option<Vec<f64>>,
    restrict_1d: Option<Vec<f64>>,
    np_coarser: usize,
    // level work buffers, allocated once
    r: Vec<f64>,
    e: Vec<f64>,
    w: Vec<f64>,
    s: Vec<f64>,
}

pub struct Multigrid {
    levels: Vec<MgLevel>,
    coarse: Option<CoarseDirect>,
}

impl Multigrid {
    pub fn new(
        fine: Arc<EllSystem>,
        mesh: &HexMesh,
        table: &BoundaryTable,
        field: &str,
        opts: &MgOptions,
    ) -> Result<Self, EllError> {
        if fine.nfields() != 1 {
            return Err(EllError::Unsupported("multigrid preconditioning of a block system"));
        }
        let schedule = opts
            .schedule
            .clone()
            .unwrap_or_else(|| default_mg_schedule(mesh.order));
        if schedule.first() != Some(&mesh.order) || schedule.windows(2).any(|w| w[1] >= w[0]) {
            return Err(EllError::Config(format!(
                "multigrid schedule {schedule:?} must decrease from the mesh order {}",
                mesh.order
            )));
        }
        let coarsest = *schedule.last().unwrap();
        if opts.coarse_solve && coarsest != 1 {
            return Err(EllError::Config(format!(
                "multigrid coarse direct solve needs a piecewise-linear coarsest level, got degree {coarsest}"
            )));
        }

        let comm = fine.gs.comm().clone();
        let fine_coeff = fine.op.coeff().clone();
        let mut levels: Vec<MgLevel> = Vec::new();
        let mut prev_basis: Option<Basis1D> = None;
        for (li, &p) in schedule.iter().enumerate() {
            let (sys_l, basis_l) = if li == 0 {
                (fine.clone(), mesh.basis.clone())
            } else {
                let mesh_l = mesh.at_order(p);
                let gs_l = Arc::new(GatherScatter::build(&mesh_l.global_ids, comm.clone())?);
                let bcs = classify(&mesh_l, table, field, 1, &gs_l)?;
                // Restrict the coefficient fields from the fine level by
                // nodal interpolation.
                let j = interp_matrix(&mesh.basis, &mesh_l.basis);
                let off_l = mesh_l.field_offset();
                let mut coeff_l = CoeffField {
                    lambda0: vec![0.0; off_l],
                    lambda1: vec![0.0; off_l],
                };
                interp_element_field(&j, mesh.np(), mesh_l.np(), mesh.nel, &fine_coeff.lambda0, &mut coeff_l.lambda0);
                interp_element_field(&j, mesh.np(), mesh_l.np(), mesh.nel, &fine_coeff.lambda1, &mut coeff_l.lambda1);
                let op_l = EllipticOperator::new(&mesh_l, coeff_l, 1, false);
                let (interior, shared) = mesh_l.split_elements(gs_l.shared_slots());
                let basis = mesh_l.basis.clone();
                let sys = EllSystem::new(op_l, gs_l, bcs.mask, shared, interior, fine.overlap, fine.nullspace);
                (Arc::new(sys), basis)
            };

            let smoother = match opts.smoother {
                SmootherKind::Chebyshev => {
                    let jac = Jacobi::new(&sys_l);
                    LevelSmoother::Cheby(ChebyshevSmoother::new(
                        &sys_l,
                        jac.inv_diag().to_vec(),
                        opts.cheby_degree,
                        opts.reduced_precision,
                    ))
                }
                SmootherKind::DampedJacobi => LevelSmoother::Jacobi(Jacobi::damped(&sys_l, 2.0 / 3.0)),
                SmootherKind::Schwarz => LevelSmoother::Schwarz(AdditiveSchwarz::new(sys_l.clone(), true)?),
            };

            let n = sys_l.len();
            levels.push(MgLevel {
                sys: sys_l,
                smoother,
                np: p + 1,
                prolong_1d: None,
                restrict_1d: None,
                np_coarser: 0,
                r: vec![0.0; n],
                e: vec![0.0; n],
                w: vec![0.0; n],
                s: vec![0.0; n],
            });

            if let Some(pb) = &prev_basis {
                // Coarse-to-fine prolongation for the finer neighbor level.
                let j = interp_matrix(&basis_l, pb);
                let (np_f, np_c) = (pb.np(), basis_l.np());
                let finer = levels.len() - 2;
                levels[finer].restrict_1d = Some(transpose(&j, np_f, np_c));
                levels[finer].prolong_1d = Some(j);
                levels[finer].np_coarser = np_c;
            }
            prev_basis = Some(basis_l);
        }

        let coarse = if opts.coarse_solve {
            Some(CoarseDirect::build(&levels.last().unwrap().sys)?)
        } else {
            None
        };

        Ok(Self { levels, coarse })
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }
}

impl Preconditioner for Multigrid {
    fn apply(&mut self, r: &[f64], z: &mut [f64]) -> Result<(), EllError> {
        vcycle(&mut self.levels, self.coarse.as_ref(), r, z)
    }
}

fn vcycle(
    levels: &mut [MgLevel],
    coarse: Option<&CoarseDirect>,
    r: &[f64],
    z: &mut [f64],
) -> Result<(), EllError> {
    let (lvl, rest) = levels.split_first_mut().expect("multigrid has at least one level");
    if rest.is_empty() {
        match coarse {
            Some(cd) => cd.solve(&lvl.sys, r, z),
            None => lvl.smoother.smooth(&lvl.sys, r, z)?,
        }
        return Ok(());
    }

    // Pre-smooth from a zero initial guess, then form the level residual.
    lvl.smoother.smooth(&lvl.sys, r, z)?;
    lvl.sys.apply(z, &mut lvl.w);
    for i in 0..lvl.w.len() {
        lvl.w[i] = r[i] - lvl.w[i];
    }

    // Restrict: dual weighting, element-wise adjoint interpolation, then
    // assemble and mask on the coarser level.
    let nl = lvl.sys.nlocal();
    for (v, &w) in lvl.w[..nl].iter_mut().zip(lvl.sys.gs.inv_degree()) {
        *v *= w;
    }
    let nel = lvl.sys.op.nel();
    let mut rc = std::mem::take(&mut rest[0].r);
    interp_element_field(
        lvl.restrict_1d.as_ref().expect("non-coarsest level has a transfer"),
        lvl.np,
        lvl.np_coarser,
        nel,
        &lvl.w,
        &mut rc,
    );
    {
        let csys = &rest[0].sys;
        let ncl = csys.nlocal();
        csys.gs.sync(&mut rc[..ncl], GsOp::Sum);
        csys.apply_mask(&mut rc);
        csys.project_nullspace(&mut rc);
    }

    let mut ec = std::mem::take(&mut rest[0].e);
    ec.iter_mut().for_each(|v| *v = 0.0);
    vcycle(rest, coarse, &rc, &mut ec)?;

    // Prolong the coarse correction and add it in.
    interp_element_field(
        lvl.prolong_1d.as_ref().unwrap(),
        lvl.np_coarser,
        lvl.np,
        nel,
        &ec,
        &mut lvl.w,
    );
    rest[0].r = rc;
    rest[0].e = ec;
    lvl.sys.apply_mask(&mut lvl.w);
    for i in 0..z.len() {
        z[i] += lvl.w[i];
    }

    // Post-smooth on the updated residual.
    lvl.sys.apply(z, &mut lvl.w);
    for i in 0..lvl.w.len() {
        lvl.w[i] = r[i] - lvl.w[i];
    }
    lvl.smoother.smooth(&lvl.sys, &lvl.w, &mut lvl.s)?;
    for i in 0..z.len() {
        z[i] += lvl.s[i];
    }
    Ok(())
}

/// Tensor-product application of a 1-D transfer matrix `j` (`np_to` rows x
/// `np_from` cols) to every element block of a nodal field.
fn interp_element_field(
    j: &[f64],
    np_from: usize,
    np_to: usize,
    nel: usize,
    from: &[f64],
    to: &mut [f64],
) {
    let nf3 = np_from * np_from * np_from;
    let nt3 = np_to * np_to * np_to;
    let mut t1 = vec![0.0; np_from * np_from * np_to];
    let mut t2 = vec![0.0; np_from * np_to * np_to];
    for e in 0..nel {
        let u = &from[e * nf3..(e + 1) * nf3];
        for k in 0..np_from {
            for jj in 0..np_from {
                for i2 in 0..np_to {
                    let mut s = 0.0;
                    for i in 0..np_from {
                        s += j[i2 * np_from + i] * u[(k * np_from + jj) * np_from + i];
                    }
                    t1[(k * np_from + jj) * np_to + i2] = s;
                }
            }
        }
        for k in 0..np_from {
            for j2 in 0..np_to {
                for i2 in 0..np_to {
                    let mut s = 0.0;
                    for jj in 0..np_from {
                        s += j[j2 * np_from + jj] * t1[(k * np_from + jj) * np_to + i2];
                    }
                    t2[(k * np_to + j2) * np_to + i2] = s;
                }
            }
        }
        let out = &mut to[e * nt3..(e + 1) * nt3];
        for k2 in 0..np_to {
            for j2 in 0..np_to {
                for i2 in 0..np_to {
                    let mut s = 0.0;
                    for k in 0..np_from {
                        s += j[k2 * np_from + k] * t2[(k * np_to + j2) * np_to + i2];
                    }
                    out[(k2 * np_to + j2) * np_to + i2] = s;
                }
            }
        }
    }
}

fn transpose(j: &[f64], rows: usize, cols: usize) -> Vec<f64> {
    let mut out = vec![0.0; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = j[r * cols + c];
        }
    }
    out
}

/// Coarsest-level direct solve: the degree-1 vertex system is assembled
/// redundantly on every rank (triplet allgather) and LU-factored once. For
/// a nullspace-bearing system one vertex is pinned and the solution is
/// re-centered after each solve.
struct CoarseDirect {
    lu: FullPivLu<f64>,
    n: usize,
    /// Dense index of each of this rank's unique coarse dofs.
    my_dense: Vec<usize>,
    nullspace: bool,
}

impl CoarseDirect {
    fn build(sys: &EllSystem) -> Result<Self, EllError> {
        let np3 = sys.op.np3();
        let nel = sys.op.nel();
        let uo = sys.gs.unique_of_slot();
        let uids = sys.gs.unique_ids();
        let comm = sys.gs.comm();

        let mut masked = vec![false; sys.nlocal()];
        for &s in &sys.mask.ids[0] {
            masked[s as usize] = true;
        }

        // Local stiffness triplets in global numbering; masked rows/cols are
        // left out and pinned to identity afterwards.
        let (mut is, mut js, mut vs) = (Vec::new(), Vec::new(), Vec::new());
        for e in 0..nel {
            let m = sys.op.element_matrix(0, e);
            for i in 0..np3 {
                let si = e * np3 + i;
                if masked[si] {
                    continue;
                }
                for jn in 0..np3 {
                    let sj = e * np3 + jn;
                    if masked[sj] {
                        continue;
                    }
                    let v = m[i * np3 + jn];
                    if v != 0.0 {
                        is.push(uids[uo[si] as usize] as f64);
                        js.push(uids[uo[sj] as usize] as f64);
                        vs.push(v);
                    }
                }
            }
        }
        let (mut gis, mut gjs, mut gvs) = (Vec::new(), Vec::new(), Vec::new());
        comm.all_gather_var(&is, &mut gis);
        comm.all_gather_var(&js, &mut gjs);
        comm.all_gather_var(&vs, &mut gvs);

        let my_ids: Vec<f64> = uids.iter().map(|&x| x as f64).collect();
        let mut all_ids = Vec::new();
        comm.all_gather_var(&my_ids, &mut all_ids);
        let mut ids_sorted: Vec<u64> = all_ids.iter().map(|&x| x as u64).collect();
        ids_sorted.sort_unstable();
        ids_sorted.dedup();
        let n = ids_sorted.len();
        let index = |gid: u64| -> usize {
            ids_sorted.binary_search(&gid).expect("coarse id missing from gathered set")
        };

        let mut dense = vec![0.0f64; n * n];
        for t in 0..gvs.len() {
            let (di, dj) = (index(gis[t] as u64), index(gjs[t] as u64));
            dense[di * n + dj] += gvs[t];
        }

        // Identity rows for masked vertices.
        let mut masked_gids: Vec<f64> = Vec::new();
        for &s in &sys.mask.ids[0] {
            masked_gids.push(uids[uo[s as usize] as usize] as f64);
        }
        let mut all_masked = Vec::new();
        comm.all_gather_var(&masked_gids, &mut all_masked);
        for &g in &all_masked {
            let d = index(g as u64);
            dense[d * n + d] = 1.0;
        }

        if sys.nullspace {
            // Pin one vertex; the singular direction is restored by
            // re-centering after each solve.
            for k in 0..n {
                dense[k] = 0.0;
                dense[k * n] = 0.0;
            }
            dense[0] = 1.0;
        }

        let a = Mat::from_fn(n, n, |i, j| dense[i * n + j]);
        let my_dense = uids.iter().map(|&g| index(g)).collect();
        Ok(Self {
            lu: FullPivLu::new(a.as_ref()),
            n,
            my_dense,
            nullspace: sys.nullspace,
        })
    }

    fn solve(&self, sys: &EllSystem, r: &[f64], z: &mut [f64]) {
        let comm = sys.gs.comm();
        let mut ru = Vec::new();
        sys.gs.gather_unique(r, &mut ru);
        let my_idx: Vec<f64> = self.my_dense.iter().map(|&d| d as f64).collect();
        let (mut all_idx, mut all_val) = (Vec::new(), Vec::new());
        comm.all_gather_var(&my_idx, &mut all_idx);
        comm.all_gather_var(&ru, &mut all_val);

        let mut rhs = vec![0.0; self.n];
        for (&d, &v) in all_idx.iter().zip(all_val.iter()) {
            rhs[d as usize] = v; // shared vertices agree: r is consistent
        }
        if self.nullspace {
            rhs[0] = 0.0;
        }
        let rhs_mat = MatMut::from_column_major_slice_mut(&mut rhs, self.n, 1);
        self.lu.solve_in_place_with_conj(Conj::No, rhs_mat);
        if self.nullspace {
            let mean = rhs.iter().sum::<f64>() / self.n as f64;
            rhs.iter_mut().for_each(|v| *v -= mean);
        }

        let vals: Vec<f64> = self.my_dense.iter().map(|&d| rhs[d]).collect();
        z.iter_mut().for_each(|v| *v = 0.0);
        sys.gs.scatter_unique(&vals, &mut z[..sys.nlocal()]);
        sys.apply_mask(z);
    }
}
