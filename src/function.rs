use rustc_hash::FxHashMap;

///
/// Integrand interface. Implementations may be vector valued; `eval` writes
/// `num_outputs` values into `out`.
///
pub trait Function
{
    fn num_outputs(&self) -> usize
    {
        1
    }
    fn eval(&mut self, x: &[f64], out: &mut [f64]);
}

/// Adapter turning a scalar closure into a `Function`.
pub struct ScalarFunction<F: FnMut(&[f64]) -> f64>(pub F);

impl<F: FnMut(&[f64]) -> f64> Function for ScalarFunction<F>
{
    fn eval(&mut self, x: &[f64], out: &mut [f64]) {
        out[0] = (self.0)(x);
    }
}

///
/// Memoizing wrapper keyed on the exact bit patterns of the coordinates.
/// Besides avoiding repeated kernel calls on shared points, the cache size
/// is the exact number of distinct physical points ever requested, which is
/// what the evaluation budget counts against.
///
pub struct MemoizedFunction<F: Function>
{
    inner: F,
    cache: FxHashMap<Vec<u64>, Vec<f64>>,
}

impl<F: Function> MemoizedFunction<F>
{
    pub fn new(inner: F) -> Self
    {
        Self { inner, cache: FxHashMap::default() }
    }

    /// Number of unique physical coordinates evaluated so far.
    pub fn distinct_evaluations(&self) -> usize
    {
        self.cache.len()
    }
}

impl<F: Function> Function for MemoizedFunction<F>
{
    fn num_outputs(&self) -> usize
    {
        self.inner.num_outputs()
    }

    fn eval(&mut self, x: &[f64], out: &mut [f64]) {
        let key: Vec<u64> = x.iter().map(|&v| v.to_bits()).collect();
        if let Some(value) = self.cache.get(&key)
        {
            out.copy_from_slice(value);
            return;
        }
        self.inner.eval(x, out);
        self.cache.insert(key, out.to_vec());
    }
}

#[test]
fn test_memoized_function_counts_distinct_points()
{
    let mut calls = 0usize;
    {
        let calls = &mut calls;
        let mut f = MemoizedFunction::new(ScalarFunction(|x: &[f64]| {
            *calls += 1;
            x[0] * x[0]
        }));
        let mut out = [0.0];
        f.eval(&[0.5], &mut out);
        f.eval(&[0.5], &mut out);
        f.eval(&[0.25], &mut out);
        assert_eq!(out[0], 0.0625);
        assert_eq!(f.distinct_evaluations(), 2);
    }
    assert_eq!(calls, 2);
}
