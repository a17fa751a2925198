//! Session configuration.
//!
//! The configuration collaborator hands over string-keyed option pairs;
//! everything is resolved here, once, into tagged enums. The iterative core
//! never matches on strings. Unsupported combinations are rejected by the
//! session's setup check, not here.

use crate::error::EllError;
use crate::projection::ProjectionKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discretization {
    ContinuousGalerkin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverKind {
    /// Component-wise preconditioned conjugate gradient: one independent
    /// convergence state per field component.
    Pcg,
    /// Block PCG: all components coupled under one convergence test.
    PcgBlock,
    /// Flexible GMRES, for preconditioners whose action varies per
    /// iteration.
    Fgmres,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreconKind {
    None,
    Jacobi,
    Schwarz { restricted: bool },
    Multigrid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmootherKind {
    DampedJacobi,
    /// Chebyshev-accelerated Jacobi (still Jacobi-type for the
    /// non-Poisson compatibility rule).
    Chebyshev,
    Schwarz,
}

#[derive(Clone, Copy, Debug)]
pub struct ProjectionConfig {
    pub kind: ProjectionKind,
    /// Basis size bound; oldest pairs are evicted beyond it.
    pub n_vecs: usize,
    /// Number of solves before the projection activates.
    pub start_step: usize,
}

#[derive(Clone, Debug)]
pub struct SolverOptions {
    /// Solver session name; empty is a fatal setup error.
    pub name: String,
    /// Physical field name used for boundary-table lookups.
    pub field: String,
    /// 1 for scalars, 3 for vector fields.
    pub nfields: usize,
    /// Poisson-type system (no zeroth-order term); enables nullspace
    /// handling when the boundaries are pure-Neumann.
    pub poisson: bool,
    /// Stress-form vector Laplacian (cross-component coupling).
    pub stress_form: bool,
    pub discretization: Discretization,
    pub solver: SolverKind,
    pub precon: PreconKind,
    pub smoother: SmootherKind,
    pub cheby_degree: usize,
    /// Multigrid degree schedule, finest first; derived from the mesh order
    /// when absent.
    pub mg_schedule: Option<Vec<usize>>,
    pub coarse_solve: bool,
    pub tol: f64,
    pub tol_abs: f64,
    pub max_iters: usize,
    pub div_factor: f64,
    pub projection: Option<ProjectionConfig>,
    /// Overlap the gather-scatter exchange with interior-element work in
    /// the operator apply.
    pub gs_overlap: bool,
    /// Run multigrid smoother operator applications in reduced precision.
    pub reduced_precision_smoother: bool,
    pub fgmres_restart: usize,
    /// Scratch pool budget in f64 entries; derived from the session size
    /// when absent. Too small is a fatal setup error.
    pub scratch_budget: Option<usize>,
}

impl SolverOptions {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            field: name.to_string(),
            nfields: 1,
            poisson: false,
            stress_form: false,
            discretization: Discretization::ContinuousGalerkin,
            solver: SolverKind::Pcg,
            precon: PreconKind::Jacobi,
            smoother: SmootherKind::Chebyshev,
            cheby_degree: 2,
            mg_schedule: None,
            coarse_solve: true,
            tol: 1e-8,
            tol_abs: 0.0,
            max_iters: 200,
            div_factor: 1e4,
            projection: None,
            gs_overlap: true,
            reduced_precision_smoother: false,
            fgmres_restart: 15,
            scratch_budget: None,
        }
    }

    /// Resolve string-keyed option pairs from the configuration
    /// collaborator. Unknown keys and unknown values are setup errors.
    pub fn parse(name: &str, pairs: &[(&str, &str)]) -> Result<Self, EllError> {
        let mut o = Self::new(name);
        let bad = |k: &str, v: &str| EllError::Config(format!("option {k:?}: unknown value {v:?}"));
        for &(key, val) in pairs {
            let k = key.to_ascii_lowercase();
            let v = val.to_ascii_lowercase();
            match k.as_str() {
                "discretization" => {
                    o.discretization = match v.as_str() {
                        "continuous" | "continuous-galerkin" => Discretization::ContinuousGalerkin,
                        _ => return Err(EllError::Config(format!(
                            "unsupported discretization {val:?}: only continuous Galerkin is supported"
                        ))),
                    }
                }
                "field" => o.field = v,
                "fields" => o.nfields = parse_num(&k, &v)?,
                "system" => {
                    o.poisson = match v.as_str() {
                        "poisson" => true,
                        "helmholtz" => false,
                        _ => return Err(bad(&k, &v)),
                    }
                }
                "stress form" => o.stress_form = parse_bool(&k, &v)?,
                "solver" => {
                    o.solver = match v.as_str() {
                        "pcg" => SolverKind::Pcg,
                        "pcg+block" | "block pcg" => SolverKind::PcgBlock,
                        "fgmres" | "pgmres" => SolverKind::Fgmres,
                        _ => return Err(bad(&k, &v)),
                    }
                }
                "preconditioner" => {
                    o.precon = match v.as_str() {
                        "none" => PreconKind::None,
                        "jacobi" => PreconKind::Jacobi,
                        "schwarz" | "additive schwarz" => PreconKind::Schwarz { restricted: false },
                        "schwarz+restricted" => PreconKind::Schwarz { restricted: true },
                        "multigrid" | "pmg" => PreconKind::Multigrid,
                        _ => return Err(bad(&k, &v)),
                    }
                }
                "multigrid smoother" => {
                    o.smoother = match v.as_str() {
                        "damped-jacobi" | "dampedjacobi" => SmootherKind::DampedJacobi,
                        "chebyshev" | "chebyshev+jacobi" => SmootherKind::Chebyshev,
                        "schwarz" | "asm" => SmootherKind::Schwarz,
                        _ => return Err(bad(&k, &v)),
                    }
                }
                "multigrid coarse solve" => o.coarse_solve = parse_bool(&k, &v)?,
                "multigrid schedule" => {
                    let sched: Result<Vec<usize>, _> =
                        v.split(',').map(|s| s.trim().parse::<usize>()).collect();
                    o.mg_schedule = Some(sched.map_err(|_| bad(&k, &v))?);
                }
                "smoother degree" => o.cheby_degree = parse_num(&k, &v)?,
                "smoother precision" => {
                    o.reduced_precision_smoother = match v.as_str() {
                        "single" => true,
                        "double" => false,
                        _ => return Err(bad(&k, &v)),
                    }
                }
                "tolerance" => o.tol = parse_float(&k, &v)?,
                "absolute tolerance" => o.tol_abs = parse_float(&k, &v)?,
                "max iterations" => o.max_iters = parse_num(&k, &v)?,
                "divergence factor" => o.div_factor = parse_float(&k, &v)?,
                "initial guess" => match v.as_str() {
                    "previous" => o.projection = None,
                    "projection" => {
                        o.projection.get_or_insert(ProjectionConfig {
                            kind: ProjectionKind::Classic,
                            n_vecs: 8,
                            start_step: 5,
                        }).kind = ProjectionKind::Classic;
                    }
                    "projection-aconj" => {
                        o.projection.get_or_insert(ProjectionConfig {
                            kind: ProjectionKind::AConj,
                            n_vecs: 8,
                            start_step: 5,
                        }).kind = ProjectionKind::AConj;
                    }
                    _ => return Err(bad(&k, &v)),
                },
                "projection vectors" => {
                    let n = parse_num(&k, &v)?;
                    o.projection.get_or_insert(ProjectionConfig {
                        kind: ProjectionKind::Classic,
                        n_vecs: n,
                        start_step: 5,
                    }).n_vecs = n;
                }
                "projection start" => {
                    let n = parse_num(&k, &v)?;
                    o.projection.get_or_insert(ProjectionConfig {
                        kind: ProjectionKind::Classic,
                        n_vecs: 8,
                        start_step: n,
                    }).start_step = n;
                }
                "gs overlap" => o.gs_overlap = parse_bool(&k, &v)?,
                "fgmres restart" => o.fgmres_restart = parse_num(&k, &v)?,
                "scratch budget" => o.scratch_budget = Some(parse_num(&k, &v)?),
                _ => return Err(EllError::Config(format!("unknown option key {key:?}"))),
            }
        }
        Ok(o)
    }
}

fn parse_bool(key: &str, val: &str) -> Result<bool, EllError> {
    match val {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" => Ok(false),
        _ => Err(EllError::Config(format!("option {key:?}: expected a boolean, got {val:?}"))),
    }
}

fn parse_num(key: &str, val: &str) -> Result<usize, EllError> {
    val.parse()
        .map_err(|_| EllError::Config(format!("option {key:?}: expected an integer, got {val:?}")))
}

fn parse_float(key: &str, val: &str) -> Result<f64, EllError> {
    val.parse()
        .map_err(|_| EllError::Config(format!("option {key:?}: expected a number, got {val:?}")))
}

/// Default multigrid degree schedule: roughly halve the order down to the
/// piecewise-linear coarse level.
pub fn default_mg_schedule(fine_order: usize) -> Vec<usize> {
    let mut sched = vec![fine_order];
    let mut p = fine_order;
    while p > 1 {
        p = ((p - 1) / 2).max(1);
        sched.push(p);
    }
    sched
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_option_set() {
        let o = SolverOptions::parse(
            "pressure",
            &[
                ("discretization", "continuous"),
                ("system", "poisson"),
                ("solver", "pcg"),
                ("preconditioner", "multigrid"),
                ("multigrid smoother", "chebyshev+jacobi"),
                ("multigrid coarse solve", "true"),
                ("tolerance", "1e-10"),
                ("initial guess", "projection-aconj"),
                ("projection vectors", "10"),
            ],
        )
        .unwrap();
        assert!(o.poisson);
        assert_eq!(o.solver, SolverKind::Pcg);
        assert_eq!(o.precon, PreconKind::Multigrid);
        assert_eq!(o.tol, 1e-10);
        let proj = o.projection.unwrap();
        assert_eq!(proj.kind, ProjectionKind::AConj);
        assert_eq!(proj.n_vecs, 10);
        assert_eq!(proj.start_step, 5);
    }

    #[test]
    fn unsupported_discretization_is_rejected() {
        let err = SolverOptions::parse("p", &[("discretization", "discontinuous")]);
        assert!(err.is_err());
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(SolverOptions::parse("p", &[("turbo", "on")]).is_err());
    }

    #[test]
    fn schedule_halves_to_linear() {
        assert_eq!(default_mg_schedule(7), vec![7, 3, 1]);
        assert_eq!(default_mg_schedule(3), vec![3, 1]);
        assert_eq!(default_mg_schedule(2), vec![2, 1]);
        assert_eq!(default_mg_schedule(1), vec![1]);
    }
}
