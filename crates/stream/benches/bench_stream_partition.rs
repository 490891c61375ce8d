use std::hint::black_box;
use std::time::Instant;

use glam::Vec3;
use realmstream_common::{CellCoord, CellId, Transform};
use realmstream_stream::{
    AdmissionGate, Candidate, ObserverSample, Occupant, StreamConfig, cells_in_radius, measure,
};

fn bench_cells_in_radius(radius: u32, iterations: usize) {
    let start = Instant::now();
    for i in 0..iterations {
        let center = CellCoord::new((i % 10) as i32, 0);
        let _ = black_box(cells_in_radius(black_box(center), black_box(radius)));
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!("  ring scan (r={radius}, {iterations} iters): {per_iter:?}/iter, total {elapsed:?}");
}

fn bench_measure(radius: u32, iterations: usize) {
    let config = StreamConfig::default();
    let coords = cells_in_radius(CellCoord::ORIGIN, radius);
    let sample = ObserverSample::from_transform(&Transform::looking(
        Vec3::new(3.0, 1.7, 5.0),
        Vec3::new(1.0, 0.0, -1.0),
    ));

    let start = Instant::now();
    for _ in 0..iterations {
        for coord in &coords {
            let _ = black_box(measure(
                black_box(&sample),
                std::slice::from_ref(coord),
                config.cell_size,
                &config.sqr_distance_buckets,
            ));
        }
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!(
        "  partition pass ({} cells, {iterations} iters): {per_iter:?}/iter, total {elapsed:?}",
        coords.len()
    );
}

fn bench_admission(candidate_count: usize, iterations: usize) {
    let config = StreamConfig {
        admission_budget: 16,
        max_admissions_per_tick: 8,
        ..StreamConfig::default()
    };
    let gate = AdmissionGate::new(&config);
    let side = (candidate_count as f32).sqrt().ceil() as i32;
    let candidates: Vec<Candidate> = (0..candidate_count as i32)
        .map(|i| {
            let base = CellCoord::new(i % side, i / side);
            Candidate {
                id: CellId::new(format!("cell:{base}")),
                base,
                raw_sqr_distance: ((base.x * base.x + base.z * base.z) * 256) as f32,
                is_behind: i % 3 == 0,
                contains_observer: i == 0,
            }
        })
        .collect();
    let occupants: Vec<Occupant> = (0..12)
        .map(|i| Occupant {
            id: CellId::new(format!("busy:{i}")),
            raw_sqr_distance: (i * 512) as f32,
        })
        .collect();

    let start = Instant::now();
    for _ in 0..iterations {
        let _ = black_box(gate.decide(black_box(candidates.clone()), &occupants, None));
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!(
        "  admission ({candidate_count} candidates, {iterations} iters): {per_iter:?}/iter, total {elapsed:?}"
    );
}

fn main() {
    println!("=== Stream Partition Benchmarks ===\n");

    println!("Range discovery:");
    bench_cells_in_radius(2, 10000);
    bench_cells_in_radius(4, 10000);
    bench_cells_in_radius(8, 1000);

    println!("\nDistance partition:");
    bench_measure(2, 10000);
    bench_measure(4, 1000);
    bench_measure(8, 100);

    println!("\nAdmission decision:");
    bench_admission(25, 10000);
    bench_admission(100, 1000);
    bench_admission(1000, 100);

    println!("\n=== Done ===");
}
