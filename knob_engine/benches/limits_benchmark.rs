//! Limit arithmetic benchmarks.
//!
//! Measures the lazy limit-intersection recompute for knobs of growing
//! element counts, and the wrap-around fold. Limit queries sit on the UI
//! refresh path, so the recompute must stay cheap even for wide knobs.

use criterion::{Criterion, criterion_group, criterion_main};
use knob_engine::{EngineConfig, Knob, KnobElement, PvClient, SimulatedPvClient, wrap_into_range};
use std::hint::black_box;
use std::sync::Arc;

fn knob_with_elements(count: usize) -> Arc<Knob> {
    let client = Arc::new(SimulatedPvClient::new());
    let knob = Knob::new(1, "bench", EngineConfig::default());
    for index in 0..count {
        let pv = format!("BENCH:PV{index}");
        client.install_pv(&pv, 0.0);
        let element = KnobElement::new(
            Arc::clone(&client) as Arc<dyn PvClient>,
            EngineConfig::default(),
        );
        element.attach(&pv);
        element.set_custom_lower_limit(-10.0 - index as f64);
        element.set_custom_upper_limit(10.0 + index as f64);
        element.use_custom_limits(true);
        element.set_coefficient_notify(1.0 + index as f64 * 0.25, false);
        knob.add_element(element);
    }
    knob
}

fn bench_calculate_limits(c: &mut Criterion) {
    for count in [1usize, 8, 64] {
        let knob = knob_with_elements(count);
        c.bench_function(&format!("calculate_limits_{count}_elements"), |b| {
            b.iter(|| {
                knob.mark_limits_dirty();
                black_box(knob.lower_limit());
            });
        });
    }
}

fn bench_wrap_into_range(c: &mut Criterion) {
    c.bench_function("wrap_into_range", |b| {
        b.iter(|| {
            black_box(wrap_into_range(
                black_box(12345.678),
                black_box(-180.0),
                black_box(180.0),
            ));
        });
    });
}

criterion_group!(benches, bench_calculate_limits, bench_wrap_into_range);
criterion_main!(benches);
