use combigrid::engine::{AdaptiveConfig, AdaptiveEngine, Strategy};
use combigrid::function::ScalarFunction;
use combigrid::grids::trapezoidal::TrapezoidalGrid;
use combigrid::operation::Integration;
use criterion::{criterion_group, criterion_main, Criterion};

fn run_refinement(strategy: Strategy) -> f64
{
    let f = ScalarFunction(|x: &[f64]| libm::exp(-x.iter().map(|&v| v * v).sum::<f64>()));
    let mut engine = AdaptiveEngine::new(vec![0.0, 0.0, 0.0], vec![1.0, 1.0, 1.0], strategy,
        Integration::new(f, TrapezoidalGrid))
    .unwrap();
    let config = AdaptiveConfig {
        min_level: 1,
        max_level: 2,
        tolerance: 1e-5,
        max_evaluations: Some(20_000),
        ..Default::default()
    };
    engine.perform_adaptive_refinement(&config).unwrap().value[0]
}

fn criterion_benchmark(c: &mut Criterion)
{
    c.bench_function("single_dimension_refinement", |b| {
        b.iter(|| run_refinement(Strategy::single_dimension()))
    });
    c.bench_function("extend_split_refinement", |b| {
        b.iter(|| {
            run_refinement(Strategy::extend_split(
                combigrid::refinement::extend_split::CoarseningPolicy::Maximal,
                2,
            ))
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
