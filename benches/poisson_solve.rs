//! Operator-apply and full-solve benchmarks on a structured Poisson cube.

use std::f64::consts::PI;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};

use ellax::bc::BoundaryTable;
use ellax::gs::{GatherScatter, GsOp};
use ellax::mesh::{GEO_JW, HexMesh, NGEO};
use ellax::operator::{CoeffField, EllipticOperator};
use ellax::parallel::SerialComm;
use ellax::session::Session;
use ellax::{PreconKind, SolverOptions};

fn dirichlet_table() -> BoundaryTable {
    let mut t = BoundaryTable::new();
    for bid in 1..=6 {
        t.set(bid, "pressure", "dirichlet");
    }
    t
}

fn bench_operator_apply(c: &mut Criterion) {
    let mesh = HexMesh::box_mesh(4, 4, 4, 5, [1.0, 1.0, 1.0]);
    let gs = GatherScatter::build(&mesh.global_ids, Arc::new(SerialComm)).unwrap();
    let coeff = CoeffField::constant(1.0, 0.0, 1, mesh.field_offset());
    let op = EllipticOperator::new(&mesh, coeff, 1, false);
    let elems: Vec<usize> = (0..mesh.nel).collect();
    let x = vec![1.0; mesh.field_offset()];
    let mut y = vec![0.0; mesh.field_offset()];
    c.bench_function("operator_apply_4x4x4_p5", |b| {
        b.iter(|| {
            op.apply_local(&elems, &x, &mut y);
            gs.sync(&mut y[..mesh.nlocal()], GsOp::Sum);
        })
    });
}

fn bench_multigrid_solve(c: &mut Criterion) {
    let mesh = Arc::new(HexMesh::box_mesh(2, 2, 2, 5, [1.0, 1.0, 1.0]));
    let table = dirichlet_table();
    let mut opts = SolverOptions::new("pressure");
    opts.poisson = true;
    opts.precon = PreconKind::Multigrid;
    opts.coarse_solve = true;
    opts.max_iters = 100;
    let coeff = CoeffField::constant(1.0, 0.0, 1, mesh.field_offset());
    let mut session =
        Session::try_create(mesh.clone(), &table, opts, coeff, Arc::new(SerialComm)).unwrap();
    let off = mesh.field_offset();
    let mut b = vec![0.0; off];
    for s in 0..mesh.nlocal() {
        let (x, y, z) = (mesh.coords[s * 3], mesh.coords[s * 3 + 1], mesh.coords[s * 3 + 2]);
        b[s] = mesh.geo[s * NGEO + GEO_JW]
            * 3.0 * PI * PI
            * (PI * x).sin() * (PI * y).sin() * (PI * z).sin();
    }
    c.bench_function("multigrid_pcg_2x2x2_p5", |bch| {
        bch.iter(|| {
            let mut x = vec![0.0; off];
            session.solve(&b, &mut x).unwrap()
        })
    });
}

criterion_group!(benches, bench_operator_apply, bench_multigrid_solve);
criterion_main!(benches);
