//! Per-rank mesh partition view.
//!
//! The solver core treats the mesh as a read-only collaborator: element
//! count, per-face boundary ids, per-node geometric factors, and the global
//! dof numbering the gather-scatter plan is built from. `HexMesh::box_mesh`
//! builds a structured axis-aligned box partition supplying all of this,
//! including re-discretization of the same elements at a lower polynomial
//! order for p-multigrid levels.

use crate::basis::Basis1D;

/// Geometric factor layout per node: g00, g01, g02, g11, g12, g22, jw.
pub const NGEO: usize = 7;
pub const GEO_JW: usize = 6;

/// Supported element geometry kinds. Only hexahedra are accepted by the
/// solver session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementKind {
    Hex,
}

#[derive(Clone, Debug)]
pub struct HexMesh {
    pub kind: ElementKind,
    pub order: usize,
    pub basis: Basis1D,
    pub nelx: usize,
    pub nely: usize,
    pub nelz: usize,
    pub lengths: [f64; 3],
    /// Local element count.
    pub nel: usize,
    /// Boundary id per (element, face); 0 marks an interior face.
    pub etob: Vec<i32>,
    /// Global unique dof id per local slot (`nel * np^3`).
    pub global_ids: Vec<u64>,
    /// Geometric factors per local slot (`NGEO` each): metric terms
    /// premultiplied by quadrature weight x Jacobian.
    pub geo: Vec<f64>,
    /// Inverse Jacobian per element, row-major `[d xi_a / d x_b]` (affine
    /// elements); used by the stress-form kernel.
    pub jac_inv: Vec<f64>,
    /// Node coordinates per local slot (x, y, z).
    pub coords: Vec<f64>,
}

pub const N_FACES: usize = 6;

impl HexMesh {
    /// Structured box partition: `nelx x nely x nelz` axis-aligned hex
    /// elements of polynomial order `order` covering `[0, L]` per direction.
    /// Domain-boundary faces carry boundary id `face + 1` (1..=6); interior
    /// faces carry 0.
    pub fn box_mesh(nelx: usize, nely: usize, nelz: usize, order: usize, lengths: [f64; 3]) -> Self {
        assert!(nelx * nely * nelz > 0, "empty mesh");
        let basis = Basis1D::gll(order);
        let np = order + 1;
        let np3 = np * np * np;
        let nel = nelx * nely * nelz;
        let (hx, hy, hz) = (
            lengths[0] / nelx as f64,
            lengths[1] / nely as f64,
            lengths[2] / nelz as f64,
        );
        let jac = hx * hy * hz / 8.0;
        let nx_nodes = (nelx * order + 1) as u64;
        let ny_nodes = (nely * order + 1) as u64;

        let mut etob = vec![0i32; nel * N_FACES];
        let mut global_ids = vec![0u64; nel * np3];
        let mut geo = vec![0.0; nel * np3 * NGEO];
        let mut jac_inv = vec![0.0; nel * 9];
        let mut coords = vec![0.0; nel * np3 * 3];

        for ez in 0..nelz {
            for ey in 0..nely {
                for ex in 0..nelx {
                    let e = (ez * nely + ey) * nelx + ex;
                    let f = &mut etob[e * N_FACES..(e + 1) * N_FACES];
                    if ex == 0 {
                        f[0] = 1;
                    }
                    if ex == nelx - 1 {
                        f[1] = 2;
                    }
                    if ey == 0 {
                        f[2] = 3;
                    }
                    if ey == nely - 1 {
                        f[3] = 4;
                    }
                    if ez == 0 {
                        f[4] = 5;
                    }
                    if ez == nelz - 1 {
                        f[5] = 6;
                    }

                    let ji = &mut jac_inv[e * 9..(e + 1) * 9];
                    ji[0] = 2.0 / hx;
                    ji[4] = 2.0 / hy;
                    ji[8] = 2.0 / hz;

                    for k in 0..np {
                        for j in 0..np {
                            for i in 0..np {
                                let q = (k * np + j) * np + i;
                                let slot = e * np3 + q;
                                let gi = (ex * order + i) as u64;
                                let gj = (ey * order + j) as u64;
                                let gk = (ez * order + k) as u64;
                                global_ids[slot] = (gk * ny_nodes + gj) * nx_nodes + gi;

                                let w = basis.weights[i] * basis.weights[j] * basis.weights[k];
                                let g = &mut geo[slot * NGEO..(slot + 1) * NGEO];
                                g[0] = w * hy * hz / (2.0 * hx);
                                g[3] = w * hx * hz / (2.0 * hy);
                                g[5] = w * hx * hy / (2.0 * hz);
                                g[GEO_JW] = w * jac;

                                let c = &mut coords[slot * 3..(slot + 1) * 3];
                                c[0] = (ex as f64 + (basis.nodes[i] + 1.0) / 2.0) * hx;
                                c[1] = (ey as f64 + (basis.nodes[j] + 1.0) / 2.0) * hy;
                                c[2] = (ez as f64 + (basis.nodes[k] + 1.0) / 2.0) * hz;
                            }
                        }
                    }
                }
            }
        }

        Self {
            kind: ElementKind::Hex,
            order,
            basis,
            nelx,
            nely,
            nelz,
            lengths,
            nel,
            etob,
            global_ids,
            geo,
            jac_inv,
            coords,
        }
    }

    /// The same element set re-discretized at a different polynomial order;
    /// boundary ids are preserved. Used to build p-multigrid levels.
    pub fn at_order(&self, order: usize) -> HexMesh {
        HexMesh::box_mesh(self.nelx, self.nely, self.nelz, order, self.lengths)
    }

    pub fn np(&self) -> usize {
        self.order + 1
    }

    pub fn np3(&self) -> usize {
        let np = self.np();
        np * np * np
    }

    /// Local slot count (duplicated storage, one block per element).
    pub fn nlocal(&self) -> usize {
        self.nel * self.np3()
    }

    /// Per-field stride, padded for alignment; always >= `nlocal`.
    pub fn field_offset(&self) -> usize {
        self.nlocal().next_multiple_of(8)
    }

    /// Coordinate axis a face is orthogonal to (0 = x, 1 = y, 2 = z).
    pub fn face_axis(face: usize) -> usize {
        face / 2
    }

    /// Whether a face normal is grid-aligned. Axis-aligned box partitions
    /// always are; a deformed mesh collaborator reports false for oblique
    /// faces.
    pub fn face_is_aligned(&self, _e: usize, _face: usize) -> bool {
        true
    }

    /// Local node indices (within one element) lying on `face`.
    pub fn face_nodes(&self, face: usize) -> Vec<usize> {
        let np = self.np();
        let mut out = Vec::with_capacity(np * np);
        let fixed = if face % 2 == 0 { 0 } else { np - 1 };
        for k in 0..np {
            for j in 0..np {
                for i in 0..np {
                    let on = match Self::face_axis(face) {
                        0 => i == fixed,
                        1 => j == fixed,
                        _ => k == fixed,
                    };
                    if on {
                        out.push((k * np + j) * np + i);
                    }
                }
            }
        }
        out
    }

    /// Split elements into (interior, shared) lists given per-slot
    /// rank-shared flags; shared elements are evaluated first so the
    /// exchange can overlap interior work.
    pub fn split_elements(&self, shared_slot: &[bool]) -> (Vec<usize>, Vec<usize>) {
        let np3 = self.np3();
        let mut interior = Vec::new();
        let mut shared = Vec::new();
        for e in 0..self.nel {
            if shared_slot[e * np3..(e + 1) * np3].iter().any(|&s| s) {
                shared.push(e);
            } else {
                interior.push(e);
            }
        }
        (interior, shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn box_mesh_counts() {
        let m = HexMesh::box_mesh(2, 2, 2, 3, [1.0, 1.0, 1.0]);
        assert_eq!(m.nel, 8);
        assert_eq!(m.nlocal(), 8 * 64);
        assert!(m.field_offset() >= m.nlocal());
        assert_eq!(m.field_offset() % 8, 0);
    }

    #[test]
    fn neighbors_share_global_ids_on_faces() {
        let m = HexMesh::box_mesh(2, 1, 1, 2, [1.0, 1.0, 1.0]);
        let np = m.np();
        let np3 = m.np3();
        // x-max face of element 0 and x-min face of element 1 coincide.
        for k in 0..np {
            for j in 0..np {
                let q0 = (k * np + j) * np + (np - 1);
                let q1 = (k * np + j) * np;
                assert_eq!(m.global_ids[q0], m.global_ids[np3 + q1]);
            }
        }
    }

    #[test]
    fn unique_id_count_matches_structured_grid() {
        let m = HexMesh::box_mesh(2, 2, 2, 3, [1.0, 1.0, 1.0]);
        let mut ids = m.global_ids.clone();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 7 * 7 * 7);
    }

    #[test]
    fn mass_weights_sum_to_volume() {
        let m = HexMesh::box_mesh(2, 3, 1, 4, [2.0, 1.0, 0.5]);
        let total: f64 = (0..m.nlocal()).map(|s| m.geo[s * NGEO + GEO_JW]).sum();
        assert_abs_diff_eq!(total, 2.0 * 1.0 * 0.5, epsilon = 1e-12);
    }

    #[test]
    fn boundary_ids_only_on_domain_faces() {
        let m = HexMesh::box_mesh(2, 2, 2, 2, [1.0, 1.0, 1.0]);
        // Element 0 sits in the min corner: faces 0, 2, 4 are boundary.
        assert_eq!(m.etob[0], 1);
        assert_eq!(m.etob[1], 0);
        assert_eq!(m.etob[2], 3);
        assert_eq!(m.etob[4], 5);
    }

    #[test]
    fn at_order_preserves_topology() {
        let m = HexMesh::box_mesh(2, 2, 2, 5, [1.0, 1.0, 1.0]);
        let c = m.at_order(1);
        assert_eq!(c.nel, m.nel);
        assert_eq!(c.etob, m.etob);
        assert_eq!(c.order, 1);
    }
}
