use serde::{Deserialize, Serialize};

use crate::function::{Function, MemoizedFunction};
use crate::grids::Grid;

/// Guard against near-zero comparison denominators in error ratios.
pub const EPSILON: f64 = 1e-14;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Norm
{
    #[default]
    Maximum,
    L1,
    L2,
}

impl Norm
{
    pub fn eval(&self, values: &[f64]) -> f64
    {
        match self
        {
            Norm::Maximum => values.iter().fold(0.0_f64, |max, &v| max.max(v.abs())),
            Norm::L1 => values.iter().map(|v| v.abs()).sum(),
            Norm::L2 => values.iter().map(|v| v * v).sum::<f64>().sqrt(),
        }
    }

    /// Norm of the relative deviation of `value` from `reference`.
    pub fn relative_deviation(&self, value: &[f64], reference: &[f64]) -> f64
    {
        let deviation: Vec<f64> = value
            .iter()
            .zip(reference)
            .map(|(&v, &r)| (v - r).abs() / (r.abs() + EPSILON))
            .collect();
        self.eval(&deviation)
    }
}

///
/// Pluggable numerical operation evaluated over (region, component grid)
/// pairs. Implementations compute an operation-specific partial result for
/// one box at one level vector; the engine performs the coefficient-weighted
/// accumulation.
///
pub trait CombiOperation
{
    fn num_outputs(&self) -> usize;

    /// The point-generation collaborator backing this operation.
    fn grid(&self) -> &dyn Grid;

    ///
    /// Partial result and quadrature point count for `[start, end)` at the
    /// given level vector.
    ///
    fn evaluate_area(&mut self, start: &[f64], end: &[f64], levelvector: &[u32])
        -> (Vec<f64>, usize);

    /// Evaluate the underlying integrand at one point. Used by strategies
    /// that build their own tensor grids.
    fn eval_point(&mut self, x: &[f64], out: &mut [f64]);

    /// Number of unique physical coordinates requested so far.
    fn distinct_evaluations(&self) -> usize;

    ///
    /// Whether shared points are deduplicated, in which case the engine
    /// weights per-grid point counts by the combination coefficient for
    /// nested grid families.
    ///
    fn counts_distinct_points(&self) -> bool
    {
        true
    }

    ///
    /// Operation-defined global error estimate, overriding the engine
    /// default (reference-solution deviation, else summed local errors).
    ///
    fn global_error_estimate(&self, _value: &[f64], _total_error: f64, _norm: Norm) -> Option<f64>
    {
        None
    }
}

///
/// Plain integration: the partial result for a region is the quadrature sum
/// of the memoized integrand over the grid's points.
///
pub struct Integration<F: Function, G: Grid>
{
    f: MemoizedFunction<F>,
    grid: G,
    num_outputs: usize,
}

impl<F: Function, G: Grid> Integration<F, G>
{
    pub fn new(f: F, grid: G) -> Self
    {
        let num_outputs = f.num_outputs();
        Self { f: MemoizedFunction::new(f), grid, num_outputs }
    }
}

impl<F: Function, G: Grid> CombiOperation for Integration<F, G>
{
    fn num_outputs(&self) -> usize
    {
        self.num_outputs
    }

    fn grid(&self) -> &dyn Grid
    {
        &self.grid
    }

    fn evaluate_area(&mut self, start: &[f64], end: &[f64], levelvector: &[u32])
        -> (Vec<f64>, usize)
    {
        let mut value = vec![0.0; self.num_outputs];
        let evaluations = self.grid.integrate(&mut self.f, levelvector, start, end, &mut value);
        (value, evaluations)
    }

    fn eval_point(&mut self, x: &[f64], out: &mut [f64]) {
        self.f.eval(x, out);
    }

    fn distinct_evaluations(&self) -> usize
    {
        self.f.distinct_evaluations()
    }
}

#[test]
fn test_norms()
{
    let values = [3.0, -4.0];
    assert_eq!(Norm::Maximum.eval(&values), 4.0);
    assert_eq!(Norm::L1.eval(&values), 7.0);
    assert!((Norm::L2.eval(&values) - 5.0).abs() < 1e-15);
    assert!((Norm::Maximum.relative_deviation(&[1.1], &[1.0]) - 0.1).abs() < 1e-10);
}

#[test]
fn test_integration_operation_constant()
{
    use crate::function::ScalarFunction;
    use crate::grids::trapezoidal::TrapezoidalGrid;
    let mut operation = Integration::new(ScalarFunction(|_: &[f64]| 1.0), TrapezoidalGrid);
    let (value, evaluations) = operation.evaluate_area(&[0.0, 0.0], &[1.0, 1.0], &[1, 2]);
    assert_eq!(evaluations, 15);
    assert!((value[0] - 1.0).abs() < 1e-12);
    assert_eq!(operation.distinct_evaluations(), 15);
}
