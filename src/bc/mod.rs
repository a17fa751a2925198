//! Boundary classification & masking.
//!
//! A table mapping physical boundary ids to named condition strings (per
//! physical field) is resolved once at setup into canonical elliptic BC
//! kinds; the iterative core only ever sees integer codes and mask index
//! lists. Nodes shared between faces of different kinds agree by worst-case
//! (min) reconciliation through the gather-scatter layer, so a Dirichlet
//! face always wins over a Neumann face at a shared edge.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::error::EllError;
use crate::gs::GatherScatter;
use crate::mesh::{HexMesh, N_FACES};

/// Canonical elliptic boundary-condition kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BcKind {
    Interior,
    Dirichlet,
    Neumann,
    Robin,
    ZeroNormal,
    ZeroTangential,
}

impl BcKind {
    /// Parse a configuration-level condition name. Case-insensitive;
    /// runtime string matching is confined to setup.
    pub fn parse(name: &str) -> Result<Self, EllError> {
        match name.to_ascii_lowercase().as_str() {
            "none" | "interior" => Ok(BcKind::Interior),
            "dirichlet" | "fixedvalue" => Ok(BcKind::Dirichlet),
            "neumann" | "zerogradient" => Ok(BcKind::Neumann),
            "robin" | "mixed" => Ok(BcKind::Robin),
            "zero-normal" | "zeronormal" | "symmetry" => Ok(BcKind::ZeroNormal),
            "zero-tangential" | "zerotangential" => Ok(BcKind::ZeroTangential),
            other => Err(EllError::Config(format!("unknown boundary condition {other:?}"))),
        }
    }

    /// Worst-case agreement code; lower binds tighter.
    fn code(self) -> i32 {
        match self {
            BcKind::Dirichlet => 1,
            BcKind::ZeroNormal => 2,
            BcKind::ZeroTangential => 3,
            BcKind::Robin => 4,
            BcKind::Neumann => 5,
            BcKind::Interior => i32::MAX,
        }
    }
}

const MASKED: i32 = 1;
const UNCONSTRAINED: i32 = i32::MAX;

bitflags! {
    /// Which vector components a boundary face pins.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ComponentMask: u8 {
        const X = 1;
        const Y = 1 << 1;
        const Z = 1 << 2;
    }
}

impl ComponentMask {
    pub fn axis(axis: usize) -> Self {
        match axis {
            0 => ComponentMask::X,
            1 => ComponentMask::Y,
            _ => ComponentMask::Z,
        }
    }
    pub fn has(self, component: usize) -> bool {
        !(self & Self::axis(component)).is_empty()
    }
}

/// Boundary-id -> (field name -> condition name), supplied by the
/// configuration collaborator. Built once; immutable afterwards.
#[derive(Clone, Debug, Default)]
pub struct BoundaryTable {
    entries: HashMap<i32, HashMap<String, String>>,
}

impl BoundaryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, bid: i32, field: &str, condition: &str) {
        self.entries
            .entry(bid)
            .or_default()
            .insert(field.to_ascii_lowercase(), condition.to_string());
    }

    pub fn resolve(&self, bid: i32, field: &str) -> Result<BcKind, EllError> {
        let by_field = self
            .entries
            .get(&bid)
            .ok_or_else(|| EllError::Config(format!("no boundary entry for id {bid}")))?;
        let name = by_field
            .get(&field.to_ascii_lowercase())
            .ok_or_else(|| EllError::Config(format!("boundary id {bid} has no entry for field {field:?}")))?;
        BcKind::parse(name)
    }
}

/// Capability interface for zeroing the wall-normal (or tangential)
/// component of a vector field where the boundary is not grid-aligned.
pub trait NormalMask: Send + Sync {
    fn apply(&self, x: &mut [f64], field_offset: usize);
}

/// All boundaries grid-aligned: component-index zeroing in [`MaskSet`]
/// already covers the masking, nothing more to do.
pub struct AlignedMask;

impl NormalMask for AlignedMask {
    fn apply(&self, _x: &mut [f64], _field_offset: usize) {}
}

/// Per-node normal projection for oblique boundaries: removes the normal
/// component (`u -= (u.n) n`) or, for zero-tangential, keeps only it.
pub struct ObliqueMask {
    pub slots: Vec<u32>,
    pub normals: Vec<[f64; 3]>,
    pub tangential: bool,
}

impl NormalMask for ObliqueMask {
    fn apply(&self, x: &mut [f64], field_offset: usize) {
        for (&s, n) in self.slots.iter().zip(self.normals.iter()) {
            let s = s as usize;
            let un: f64 = (0..3).map(|c| x[c * field_offset + s] * n[c]).sum();
            for c in 0..3 {
                if self.tangential {
                    x[c * field_offset + s] = un * n[c];
                } else {
                    x[c * field_offset + s] -= un * n[c];
                }
            }
        }
    }
}

/// Mask index lists consumed by the operator evaluator and the
/// preconditioner. Computed once from the boundary map; never mutated by
/// the solver loop.
pub struct MaskSet {
    pub ncomp: usize,
    pub field_offset: usize,
    /// Per component: all local slots pinned by a Dirichlet-type condition.
    pub ids: Vec<Vec<u32>>,
    /// Same, split into process-local and rank-shared slots.
    pub ids_local: Vec<Vec<u32>>,
    pub ids_shared: Vec<Vec<u32>>,
    normal_mask: Box<dyn NormalMask>,
}

impl MaskSet {
    /// Zero every masked entry of a (possibly multi-component) field.
    pub fn apply(&self, x: &mut [f64]) {
        for c in 0..self.ncomp {
            let base = c * self.field_offset;
            for &s in &self.ids[c] {
                x[base + s as usize] = 0.0;
            }
        }
        self.normal_mask.apply(x, self.field_offset);
    }

    pub fn n_masked(&self) -> usize {
        self.ids.iter().map(|v| v.len()).sum()
    }

    /// Break a vector mask into independent per-component masks for
    /// component-wise solving. Only valid for grid-aligned boundaries (an
    /// oblique mask couples components, which forces block mode).
    pub fn split_components(self) -> Vec<MaskSet> {
        self.ids
            .into_iter()
            .zip(self.ids_local)
            .zip(self.ids_shared)
            .map(|((ids, ids_local), ids_shared)| MaskSet {
                ncomp: 1,
                field_offset: self.field_offset,
                ids: vec![ids],
                ids_local: vec![ids_local],
                ids_shared: vec![ids_shared],
                normal_mask: Box::new(AlignedMask),
            })
            .collect()
    }
}

/// Classification result for one solver session.
pub struct BcState {
    pub mask: MaskSet,
    /// An unaligned zero-normal/zero-tangential boundary exists somewhere
    /// in the global mesh (reduced across ranks).
    pub has_unaligned: bool,
    /// No Dirichlet-type constraint and no Robin face anywhere: the system
    /// carries the constant nullspace.
    pub all_neumann: bool,
}

/// Classify every (face, field) pair and build the session's masks.
///
/// `field` is the physical field name looked up in the boundary table
/// (e.g. "pressure", "velocity", "scalar00"); `ncomp` is 1 for scalars and
/// 3 for vector fields.
pub fn classify(
    mesh: &HexMesh,
    table: &BoundaryTable,
    field: &str,
    ncomp: usize,
    gs: &GatherScatter,
) -> Result<BcState, EllError> {
    let np3 = mesh.np3();
    let nlocal = mesh.nlocal();
    let mut codes = vec![vec![UNCONSTRAINED; nlocal]; ncomp];
    let mut unaligned_here = false;
    let mut robin_here = false;

    for e in 0..mesh.nel {
        for face in 0..N_FACES {
            let bid = mesh.etob[e * N_FACES + face];
            if bid == 0 {
                continue;
            }
            let kind = table.resolve(bid, field)?;
            if kind == BcKind::Interior {
                continue;
            }
            if kind == BcKind::Robin {
                robin_here = true;
            }
            let aligned = mesh.face_is_aligned(e, face);
            if matches!(kind, BcKind::ZeroNormal | BcKind::ZeroTangential) {
                if ncomp == 1 {
                    return Err(EllError::Config(format!(
                        "boundary id {bid}: {kind:?} requires a vector (block) field"
                    )));
                }
                if !aligned {
                    unaligned_here = true;
                    continue; // handled by the oblique normal mask
                }
            }
            let axis = HexMesh::face_axis(face);
            let pinned = match kind {
                BcKind::Dirichlet => ComponentMask::all(),
                BcKind::ZeroNormal => ComponentMask::axis(axis),
                BcKind::ZeroTangential => ComponentMask::all() & !ComponentMask::axis(axis),
                _ => ComponentMask::empty(),
            };
            for c in 0..ncomp {
                let code = if pinned.has(c) { MASKED } else { kind.code().max(2) };
                let col = &mut codes[c];
                for &q in &mesh.face_nodes(face) {
                    let slot = e * np3 + q;
                    col[slot] = col[slot].min(code);
                }
            }
        }
    }

    // Duplicated copies of a node must agree on the tightest condition.
    for col in codes.iter_mut() {
        gs.sync_codes(col);
    }

    let comm = gs.comm();
    let has_unaligned = comm.all_reduce_max(if unaligned_here { 1.0 } else { 0.0 }) > 0.0;
    let has_robin = comm.all_reduce_max(if robin_here { 1.0 } else { 0.0 }) > 0.0;

    let shared = gs.shared_slots();
    let mut ids = vec![Vec::new(); ncomp];
    let mut ids_local = vec![Vec::new(); ncomp];
    let mut ids_shared = vec![Vec::new(); ncomp];
    let mut masked_weight = 0.0;
    for c in 0..ncomp {
        for (slot, &code) in codes[c].iter().enumerate() {
            if code == MASKED {
                ids[c].push(slot as u32);
                masked_weight += gs.inv_degree()[slot];
                if shared[slot] {
                    ids_shared[c].push(slot as u32);
                } else {
                    ids_local[c].push(slot as u32);
                }
            }
        }
    }

    let masked_global = comm.all_reduce_sum(masked_weight);
    let all_neumann = masked_global.round() == 0.0 && !has_unaligned && !has_robin;

    let normal_mask: Box<dyn NormalMask> = if has_unaligned {
        // The box builder never reports oblique faces; a deformed-mesh
        // collaborator supplies per-node normals through its own mask.
        Box::new(ObliqueMask { slots: Vec::new(), normals: Vec::new(), tangential: false })
    } else {
        Box::new(AlignedMask)
    };

    Ok(BcState {
        mask: MaskSet {
            ncomp,
            field_offset: mesh.field_offset(),
            ids,
            ids_local,
            ids_shared,
            normal_mask,
        },
        has_unaligned,
        all_neumann,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::SerialComm;
    use approx::assert_abs_diff_eq;
    use std::sync::Arc;

    fn dirichlet_table(field: &str) -> BoundaryTable {
        let mut t = BoundaryTable::new();
        for bid in 1..=6 {
            t.set(bid, field, "dirichlet");
        }
        t
    }

    fn setup(order: usize, table: &BoundaryTable, field: &str, ncomp: usize) -> BcState {
        let mesh = HexMesh::box_mesh(2, 2, 2, order, [1.0, 1.0, 1.0]);
        let gs = GatherScatter::build(&mesh.global_ids, Arc::new(SerialComm)).unwrap();
        classify(&mesh, table, field, ncomp, &gs).unwrap()
    }

    #[test]
    fn dirichlet_everywhere_masks_the_shell() {
        let state = setup(3, &dirichlet_table("pressure"), "pressure", 1);
        // 7^3 unique nodes, 5^3 interior: the rest are masked (counting
        // unique dofs, not duplicated slots).
        let mesh = HexMesh::box_mesh(2, 2, 2, 3, [1.0, 1.0, 1.0]);
        let gs = GatherScatter::build(&mesh.global_ids, Arc::new(SerialComm)).unwrap();
        let weight: f64 = state.mask.ids[0]
            .iter()
            .map(|&s| gs.inv_degree()[s as usize])
            .sum();
        assert_abs_diff_eq!(weight, (7.0f64.powi(3) - 5.0f64.powi(3)), epsilon = 1e-9);
        assert!(!state.all_neumann);
    }

    #[test]
    fn neumann_everywhere_detects_nullspace() {
        let mut t = BoundaryTable::new();
        for bid in 1..=6 {
            t.set(bid, "pressure", "neumann");
        }
        let state = setup(2, &t, "pressure", 1);
        assert!(state.all_neumann);
        assert_eq!(state.mask.n_masked(), 0);
    }

    #[test]
    fn zero_normal_masks_only_the_normal_component() {
        let mut t = BoundaryTable::new();
        for bid in 1..=6 {
            t.set(bid, "velocity", "zero-normal");
        }
        let state = setup(2, &t, "velocity", 3);
        // The x-min wall pins only the x component there.
        assert!(!state.mask.ids[0].is_empty());
        // A node strictly inside the x-min face is not masked in y.
        let mesh = HexMesh::box_mesh(2, 2, 2, 2, [1.0, 1.0, 1.0]);
        let face_interior_slot = {
            let np = mesh.np();
            (1 * np + 1) * np // i = 0, j = 1, k = 1 of element 0
        } as u32;
        assert!(state.mask.ids[0].contains(&face_interior_slot));
        assert!(!state.mask.ids[1].contains(&face_interior_slot));
    }

    #[test]
    fn zero_normal_on_scalar_field_is_rejected() {
        let mut t = BoundaryTable::new();
        for bid in 1..=6 {
            t.set(bid, "pressure", "zero-normal");
        }
        let mesh = HexMesh::box_mesh(1, 1, 1, 2, [1.0, 1.0, 1.0]);
        let gs = GatherScatter::build(&mesh.global_ids, Arc::new(SerialComm)).unwrap();
        assert!(classify(&mesh, &t, "pressure", 1, &gs).is_err());
    }

    #[test]
    fn dirichlet_wins_at_shared_edges() {
        // x faces Dirichlet, everything else Neumann: edge nodes between an
        // x face and a y face must be masked.
        let mut t = BoundaryTable::new();
        t.set(1, "s", "dirichlet");
        t.set(2, "s", "dirichlet");
        for bid in 3..=6 {
            t.set(bid, "s", "neumann");
        }
        let state = setup(2, &t, "s", 1);
        let mesh = HexMesh::box_mesh(2, 2, 2, 2, [1.0, 1.0, 1.0]);
        // Corner slot 0 of element 0 lies on x-min, y-min and z-min faces.
        assert!(state.mask.ids[0].contains(&0));
        assert!(!state.all_neumann);
        let _ = mesh;
    }

    #[test]
    fn oblique_mask_projects_out_the_normal() {
        let field_offset = 8;
        let mut x = vec![0.0; 3 * field_offset];
        x[0] = 1.0; // u = (1, 2, 0) at slot 0
        x[field_offset] = 2.0;
        let n = [1.0 / 2.0f64.sqrt(), 1.0 / 2.0f64.sqrt(), 0.0];
        let mask = ObliqueMask { slots: vec![0], normals: vec![n], tangential: false };
        mask.apply(&mut x, field_offset);
        let un: f64 = x[0] * n[0] + x[field_offset] * n[1];
        assert_abs_diff_eq!(un, 0.0, epsilon = 1e-14);
    }

    #[test]
    fn component_mask_bits() {
        let m = ComponentMask::X | ComponentMask::Z;
        assert!(m.has(0));
        assert!(!m.has(1));
        assert!(m.has(2));
    }

    #[test]
    fn unknown_condition_name_is_rejected() {
        assert!(BcKind::parse("slip-ish").is_err());
    }
}
