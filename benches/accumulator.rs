// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::SMatrix;

use direct_vio_rs::math::accumulator::Accumulator9;
use direct_vio_rs::math::simd::F32x4;

// Functions.

fn normal_sum(nb_iter: u32, rows: &SMatrix<f32, 9, 1>) -> SMatrix<f32, 9, 9> {
    let mut mat = SMatrix::<f32, 9, 9>::zeros();
    for _ in 0..nb_iter {
        mat += 4.0 * rows * rows.transpose();
    }
    mat
}

fn accum_sum(nb_iter: u32, rows: &[F32x4; 9]) -> SMatrix<f32, 9, 9> {
    let mut accum = Accumulator9::new();
    for _ in 0..nb_iter {
        accum.update(rows);
    }
    accum.finish()
}

// Benches.

fn criterion_benchmark(c: &mut Criterion) {
    let row = [1.0, -0.5, 0.25, 2.0, -1.0, 0.5, 1.0, -1.0, 0.75];
    let vec = SMatrix::<f32, 9, 1>::from_row_slice(&row);
    let mut lanes = [F32x4::ZERO; 9];
    for (lane, &v) in lanes.iter_mut().zip(row.iter()) {
        *lane = F32x4::splat(v);
    }

    let mut group = c.benchmark_group("Accumulator");
    group.bench_function("Normal", |b| {
        b.iter(|| black_box(normal_sum(black_box(1000), &vec)))
    });
    group.bench_function("Accum", |b| {
        b.iter(|| black_box(accum_sum(black_box(1000), &lanes)))
    });
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
