use serde::{Deserialize, Serialize};

use crate::grids::Grid;

///
/// Nested trapezoidal grid with boundary points. Level `l` places
/// `2^l + 1` equidistant points per dimension (the two boundary points at
/// level 0), with the usual halved weights on the boundaries.
///
#[derive(Clone, Copy, Default, Debug, Serialize, Deserialize)]
pub struct TrapezoidalGrid;

impl TrapezoidalGrid
{
    fn coordinates_1d(start: f64, end: f64, level: u32) -> (Vec<f64>, Vec<f64>)
    {
        let n = (1usize << level) + 1;
        let h = (end - start) / (n - 1) as f64;
        let mut points = vec![0.0; n];
        let mut weights = vec![h; n];
        #[allow(clippy::needless_range_loop)]
        for i in 0..n
        {
            points[i] = start + i as f64 * h;
        }
        points[n - 1] = end;
        weights[0] = 0.5 * h;
        weights[n - 1] = 0.5 * h;
        (points, weights)
    }
}

impl Grid for TrapezoidalGrid
{
    fn level_to_num_points(&self, levelvector: &[u32]) -> Vec<usize> {
        levelvector.iter().map(|&l| (1usize << l) + 1).collect()
    }

    fn is_nested(&self) -> bool {
        true
    }

    fn points_and_weights(&self, start: &[f64], end: &[f64], levelvector: &[u32])
        -> (Vec<f64>, Vec<f64>)
    {
        let ndim = start.len();
        let mut axes = Vec::with_capacity(ndim);
        for d in 0..ndim
        {
            axes.push(Self::coordinates_1d(start[d], end[d], levelvector[d]));
        }
        let num_points: usize = axes.iter().map(|axis| axis.0.len()).product();
        let mut points = vec![0.0; num_points * ndim];
        let mut weights = vec![0.0; num_points];
        // flattened tensor product, last dimension fastest
        for (i, point) in points.chunks_exact_mut(ndim).enumerate()
        {
            let mut index = i;
            let mut weight = 1.0;
            for d in (0..ndim).rev()
            {
                let n = axes[d].0.len();
                point[d] = axes[d].0[index % n];
                weight *= axes[d].1[index % n];
                index /= n;
            }
            weights[i] = weight;
        }
        (points, weights)
    }
}

#[test]
fn test_weights_sum_to_volume()
{
    let grid = TrapezoidalGrid;
    let (_, weights) = grid.points_and_weights(&[0.0, -1.0], &[1.0, 3.0], &[2, 3]);
    let sum: f64 = weights.iter().sum();
    assert!((sum - 4.0).abs() < 1e-12);
}

#[test]
fn test_level_zero_is_boundary_only()
{
    let grid = TrapezoidalGrid;
    let (points, weights) = grid.points_and_weights(&[0.0], &[1.0], &[0]);
    assert_eq!(points, vec![0.0, 1.0]);
    assert_eq!(weights, vec![0.5, 0.5]);
    assert_eq!(grid.level_to_num_points(&[0, 3]), vec![2, 9]);
}

#[test]
fn test_integrate_linear_exactly()
{
    use crate::function::ScalarFunction;
    let grid = TrapezoidalGrid;
    let mut f = ScalarFunction(|x: &[f64]| 2.0 * x[0] + x[1]);
    let mut out = [0.0];
    let evaluations = grid.integrate(&mut f, &[1, 1], &[0.0, 0.0], &[1.0, 1.0], &mut out);
    assert_eq!(evaluations, 9);
    // trapezoidal rule is exact for linear integrands
    assert!((out[0] - 1.5).abs() < 1e-12);
}
