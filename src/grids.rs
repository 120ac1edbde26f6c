pub mod trapezoidal;

use crate::function::Function;

///
/// Point-generation collaborator for one component grid. Implementations
/// produce tensor-product quadrature points and weights for a level vector
/// over an axis-aligned box.
///
pub trait Grid
{
    /// Number of points per dimension for the given level vector.
    fn level_to_num_points(&self, levelvector: &[u32]) -> Vec<usize>;

    ///
    /// Whether a coarser grid's points are a subset of the next finer
    /// grid's points. Determines whether distinct-point accounting can rely
    /// on coefficient cancellation.
    ///
    fn is_nested(&self) -> bool;

    ///
    /// Quadrature points (flattened, `start.len()` entries per point) and
    /// the matching weights over `[start, end)`.
    ///
    fn points_and_weights(&self, start: &[f64], end: &[f64], levelvector: &[u32])
        -> (Vec<f64>, Vec<f64>);

    ///
    /// Integrate `f` over `[start, end)` at the given level vector,
    /// accumulating into `out`. Returns the number of quadrature points.
    ///
    fn integrate(&self, f: &mut dyn Function, levelvector: &[u32], start: &[f64], end: &[f64],
        out: &mut [f64]) -> usize
    {
        let ndim = start.len();
        let (points, weights) = self.points_and_weights(start, end, levelvector);
        let mut value = vec![0.0; out.len()];
        for (point, &weight) in points.chunks_exact(ndim).zip(&weights)
        {
            f.eval(point, &mut value);
            for i in 0..out.len()
            {
                out[i] += weight * value[i];
            }
        }
        weights.len()
    }
}
