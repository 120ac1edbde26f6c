use rustc_hash::FxHashMap;

use crate::engine::EngineContext;
use crate::operation::CombiOperation;
use crate::refinement::container::{RefinementContainer, RefinementObject, RegionState};

///
/// One 1-D interval of the per-dimension decomposition. `levels` holds the
/// refinement levels of the start and end point; the interval's own depth is
/// their maximum.
///
pub struct SingleDimInterval
{
    pub start: f64,
    pub end: f64,
    pub dim: usize,
    pub levels: (u32, u32),
    /// Accumulated surplus per output, reset every evaluation pass.
    pub volume: Vec<f64>,
    pub state: RegionState,
}

impl SingleDimInterval
{
    fn new(start: f64, end: f64, dim: usize, levels: (u32, u32), num_outputs: usize) -> Self
    {
        Self { start, end, dim, levels, volume: vec![0.0; num_outputs],
            state: RegionState::new(num_outputs) }
    }
}

impl RefinementObject for SingleDimInterval
{
    fn state(&self) -> &RegionState
    {
        &self.state
    }
    fn state_mut(&mut self) -> &mut RegionState
    {
        &mut self.state
    }
}

///
/// A grid point that is a child in the global refinement structure of one
/// dimension, with its two parents and the adjoining intervals (handles into
/// that dimension's container). A parent outside the current point set is
/// mirrored from the opposite side.
///
struct NodeInfo
{
    child: f64,
    left_parent: f64,
    right_parent: f64,
    has_left_child: bool,
    has_right_child: bool,
    left_object: Option<usize>,
    right_object: Option<usize>,
}

fn is_child(current: &SingleDimInterval, next: &SingleDimInterval) -> bool
{
    current.levels.0 < current.levels.1 || next.levels.1 < current.levels.1
}

fn node_info(current: &SingleDimInterval, next: &SingleDimInterval, current_handle: usize,
    next_handle: usize) -> NodeInfo
{
    let child = current.end;
    if current.levels.0 < current.levels.1
    {
        if next.levels.1 < current.levels.1
        {
            NodeInfo { child, left_parent: current.start, right_parent: next.end,
                has_left_child: false, has_right_child: false,
                left_object: Some(current_handle), right_object: Some(next_handle) }
        }
        else
        {
            NodeInfo { child, left_parent: current.start,
                right_parent: child + (child - current.start), has_left_child: false,
                has_right_child: true, left_object: Some(current_handle), right_object: None }
        }
    }
    else
    {
        debug_assert!(next.levels.1 < current.levels.1);
        NodeInfo { child, left_parent: child - (next.end - child), right_parent: next.end,
            has_left_child: true, has_right_child: false, left_object: None,
            right_object: Some(next_handle) }
    }
}

/// Non-uniform trapezoidal weights over sorted coordinates: interior points
/// carry half the span of their two neighbours, boundary points half the
/// adjacent span.
fn stripe_weights(coordinates: &[f64]) -> Vec<f64>
{
    let n = coordinates.len();
    let mut weights = vec![0.0; n];
    for i in 0..n
    {
        let left = if i == 0 { coordinates[0] } else { coordinates[i - 1] };
        let right = if i == n - 1 { coordinates[n - 1] } else { coordinates[i + 1] };
        weights[i] = 0.5 * (right - left);
    }
    weights
}

struct CachedGrid
{
    stripes: Vec<Vec<f64>>,
    value: Vec<f64>,
}

///
/// Per-dimension interval strategy: every dimension owns a position-sorted
/// container of 1-D intervals whose end points define the refinement stripes
/// of the component grids. Error estimates are hierarchical surpluses of the
/// child points, summed over (d-1)-dimensional slices.
///
pub struct SingleDimensionStrategy
{
    a: Vec<f64>,
    b: Vec<f64>,
    containers: Vec<RefinementContainer<SingleDimInterval>>,
    value: Vec<f64>,
    /// Component-grid results keyed by level vector, reused while the
    /// stripes that produced them are unchanged.
    cache: FxHashMap<Vec<u32>, CachedGrid>,
}

impl SingleDimensionStrategy
{
    pub fn new() -> Self
    {
        Self { a: Vec::new(), b: Vec::new(), containers: Vec::new(), value: Vec::new(),
            cache: FxHashMap::default() }
    }

    /// Two intervals per dimension, meeting at the level-1 midpoint.
    pub fn initialize<O: CombiOperation>(&mut self, a: &[f64], b: &[f64],
        ctx: &mut EngineContext<'_, O>)
    {
        let num_outputs = ctx.operation.num_outputs();
        self.a = a.to_vec();
        self.b = b.to_vec();
        self.value = vec![0.0; num_outputs];
        self.cache.clear();
        self.containers = (0..a.len())
            .map(|d| {
                let midpoint = 0.5 * (a[d] + b[d]);
                RefinementContainer::new(vec![
                    SingleDimInterval::new(a[d], midpoint, d, (0, 1), num_outputs),
                    SingleDimInterval::new(midpoint, b[d], d, (1, 0), num_outputs),
                ])
            })
            .collect();
        self.evaluate(ctx);
    }

    ///
    /// Stripe coordinates of one dimension for a component grid: the domain
    /// start plus every interval end whose point level fits the level vector
    /// entry, together with the child points among them.
    ///
    fn stripes_for_dim(&self, d: usize, level: u32) -> (Vec<f64>, Vec<NodeInfo>)
    {
        let container = &self.containers[d];
        let handles: Vec<usize> = container.active_handles().collect();
        let mut coordinates = vec![container.object(handles[0]).start];
        let mut children = Vec::new();
        for (i, &handle) in handles.iter().enumerate()
        {
            let object = container.object(handle);
            if object.levels.1 <= level.max(1)
            {
                coordinates.push(object.end);
                if let Some(&next_handle) = handles.get(i + 1)
                {
                    let next = container.object(next_handle);
                    if is_child(object, next)
                    {
                        children.push(node_info(object, next, handle, next_handle));
                    }
                }
            }
        }
        (coordinates, children)
    }

    ///
    /// Global evaluation pass: every component grid is integrated over the
    /// full domain on its stripe tensor grid (reusing cached results where
    /// the stripes are unchanged), and surpluses are derived on the top
    /// diagonal and active grids.
    ///
    pub fn evaluate<O: CombiOperation>(&mut self, ctx: &mut EngineContext<'_, O>)
    {
        let dim = self.a.len();
        let num_outputs = ctx.operation.num_outputs();
        for container in &mut self.containers
        {
            let handles: Vec<usize> = container.active_handles().collect();
            for handle in handles
            {
                let object = container.object_mut(handle);
                object.volume.fill(0.0);
                object.state.reset();
            }
        }
        let mut total = vec![0.0; num_outputs];
        for i in 0..ctx.scheme.len()
        {
            let grid_info = ctx.scheme[i].clone();
            let mut stripes = Vec::with_capacity(dim);
            let mut children = Vec::with_capacity(dim);
            for d in 0..dim
            {
                let (coordinates, children_dim) =
                    self.stripes_for_dim(d, grid_info.levelvector[d]);
                stripes.push(coordinates);
                children.push(children_dim);
            }
            let unchanged = self
                .cache
                .get(&grid_info.levelvector)
                .is_some_and(|cached| cached.stripes == stripes);
            let value = if unchanged
            {
                self.cache[&grid_info.levelvector].value.clone()
            }
            else
            {
                let (value, _) = integrate_stripes(&stripes, ctx);
                self.cache.insert(grid_info.levelvector.clone(),
                    CachedGrid { stripes: stripes.clone(), value: value.clone() });
                value
            };
            for (acc, v) in total.iter_mut().zip(&value)
            {
                *acc += grid_info.coefficient as f64 * v;
            }
            let lmax_max = ctx.lmax.iter().copied().fold(0, u32::max);
            let on_top_diagonal =
                grid_info.levelvector.iter().sum::<u32>() == lmax_max + dim as u32 - 1;
            if on_top_diagonal || ctx.combischeme.contains_active(&grid_info.levelvector)
            {
                self.calculate_surplusses(&stripes, &children, ctx);
            }
        }
        self.value = total;
        for container in &mut self.containers
        {
            let handles: Vec<usize> = container.active_handles().collect();
            for handle in handles
            {
                let error = ctx.norm.eval(&container.object(handle).volume);
                container.object_mut(handle).state.error = error;
                container.set_benefit(handle);
            }
        }
    }

    ///
    /// Surplus estimates for every child point: the (d-1)-dimensional slice
    /// through the child accumulates `w · |f(child) - ½(f(left) + f(right))| · h`,
    /// and the result is split evenly onto the adjoining intervals that lack
    /// a child on that side, along with half the slice's evaluation count.
    ///
    fn calculate_surplusses<O: CombiOperation>(&mut self, stripes: &[Vec<f64>],
        children: &[Vec<NodeInfo>], ctx: &mut EngineContext<'_, O>)
    {
        let dim = stripes.len();
        for d in 0..dim
        {
            for child_info in &children[d]
            {
                let (volume, evaluations) = sum_up_volumes_for_point(child_info, stripes, d, ctx);
                let mut credit = |object: Option<usize>| {
                    if let Some(handle) = object
                    {
                        let interval = self.containers[d].object_mut(handle);
                        for (acc, v) in interval.volume.iter_mut().zip(&volume)
                        {
                            *acc += 0.5 * v;
                        }
                        interval.state.evaluations += 0.5 * evaluations as f64;
                    }
                };
                if !child_info.has_right_child
                {
                    credit(child_info.right_object);
                }
                if !child_info.has_left_child
                {
                    credit(child_info.left_object);
                }
            }
        }
    }

    ///
    /// Split one interval at its midpoint; the new point's level is one
    /// above the interval depth. A level beyond the dimension's maximum
    /// grows `lmax` in that dimension and regenerates the scheme; the batch
    /// continues either way.
    ///
    pub fn refine<O: CombiOperation>(&mut self, d: usize, handle: usize,
        ctx: &mut EngineContext<'_, O>) -> bool
    {
        let num_outputs = ctx.operation.num_outputs();
        let (start, end, levels) = {
            let object = self.containers[d].object(handle);
            (object.start, object.end, object.levels)
        };
        let new_level = levels.0.max(levels.1) + 1;
        let midpoint = 0.5 * (start + end);
        self.containers[d]
            .insert(SingleDimInterval::new(start, midpoint, d, (levels.0, new_level), num_outputs));
        self.containers[d]
            .insert(SingleDimInterval::new(midpoint, end, d, (new_level, levels.1), num_outputs));
        self.containers[d].deactivate(handle);
        if new_level > ctx.lmax[d]
        {
            ctx.raise_lmax(d);
        }
        false
    }

    pub fn start_refinement_pass(&mut self)
    {
        for container in &mut self.containers
        {
            container.clear_new();
            container.start_refinement_pass();
        }
    }

    pub fn next_for_refinement(&mut self, tolerance: f64) -> Option<(usize, usize)>
    {
        for (d, container) in self.containers.iter_mut().enumerate()
        {
            if let Some(handle) = container.next_for_refinement(tolerance)
            {
                return Some((d, handle));
            }
        }
        None
    }

    pub fn postprocess_refinement(&mut self)
    {
        for container in &mut self.containers
        {
            container.apply_remove();
            container.sort_active(|x, y| x.start.total_cmp(&y.start));
        }
    }

    /// Force a full recomputation on the next pass.
    pub fn mark_all_new(&mut self)
    {
        self.cache.clear();
        for container in &mut self.containers
        {
            container.mark_all_new();
        }
    }

    pub fn value(&self) -> Vec<f64>
    {
        self.value.clone()
    }

    pub fn max_benefit(&self) -> f64
    {
        self.containers.iter().map(|c| c.max_benefit()).fold(0.0, f64::max)
    }

    pub fn total_error(&self) -> f64
    {
        self.containers.iter().map(|c| c.total_error()).sum()
    }

    /// Tensor points of each component grid's stripes, flattened per grid.
    pub fn component_grid_points<O: CombiOperation>(&self, ctx: &EngineContext<'_, O>)
        -> Vec<Vec<f64>>
    {
        let dim = self.a.len();
        let mut per_grid = Vec::with_capacity(ctx.scheme.len());
        for grid_info in ctx.scheme.iter()
        {
            let stripes: Vec<Vec<f64>> =
                (0..dim).map(|d| self.stripes_for_dim(d, grid_info.levelvector[d]).0).collect();
            let num_points: usize = stripes.iter().map(|s| s.len()).product();
            let mut points = Vec::with_capacity(num_points * dim);
            for i in 0..num_points
            {
                let base = points.len();
                points.resize(base + dim, 0.0);
                let mut index = i;
                for d in (0..dim).rev()
                {
                    let n = stripes[d].len();
                    points[base + d] = stripes[d][index % n];
                    index /= n;
                }
            }
            per_grid.push(points);
        }
        per_grid
    }

    pub fn active_volume(&self) -> f64
    {
        self.containers
            .iter()
            .enumerate()
            .map(|(d, container)| {
                let length: f64 = container
                    .active_handles()
                    .map(|h| container.object(h).end - container.object(h).start)
                    .sum();
                length / (self.b[d] - self.a[d])
            })
            .product()
    }
}

impl Default for SingleDimensionStrategy
{
    fn default() -> Self
    {
        Self::new()
    }
}

/// Trapezoidal tensor quadrature over per-dimension stripe coordinates.
fn integrate_stripes<O: CombiOperation>(stripes: &[Vec<f64>], ctx: &mut EngineContext<'_, O>)
    -> (Vec<f64>, usize)
{
    let dim = stripes.len();
    let weights: Vec<Vec<f64>> = stripes.iter().map(|s| stripe_weights(s)).collect();
    let num_points: usize = stripes.iter().map(|s| s.len()).product();
    let num_outputs = ctx.operation.num_outputs();
    let mut value = vec![0.0; num_outputs];
    let mut out = vec![0.0; num_outputs];
    let mut point = vec![0.0; dim];
    for i in 0..num_points
    {
        let mut index = i;
        let mut weight = 1.0;
        for d in (0..dim).rev()
        {
            let n = stripes[d].len();
            point[d] = stripes[d][index % n];
            weight *= weights[d][index % n];
            index /= n;
        }
        ctx.operation.eval_point(&point, &mut out);
        for k in 0..num_outputs
        {
            value[k] += weight * out[k];
        }
    }
    (value, num_points)
}

fn sum_up_volumes_for_point<O: CombiOperation>(child_info: &NodeInfo, stripes: &[Vec<f64>],
    d: usize, ctx: &mut EngineContext<'_, O>) -> (Vec<f64>, usize)
{
    let dim = stripes.len();
    debug_assert!(child_info.left_parent < child_info.child
        && child_info.child < child_info.right_parent);
    let weights: Vec<Vec<f64>> = stripes.iter().map(|s| stripe_weights(s)).collect();
    let slice_count: usize =
        (0..dim).filter(|&d2| d2 != d).map(|d2| stripes[d2].len()).product();
    let num_outputs = ctx.operation.num_outputs();
    let width = child_info.right_parent - child_info.child;
    let mut volume = vec![0.0; num_outputs];
    let mut point = vec![0.0; dim];
    let mut f_child = vec![0.0; num_outputs];
    let mut f_left = vec![0.0; num_outputs];
    let mut f_right = vec![0.0; num_outputs];
    for i in 0..slice_count
    {
        let mut index = i;
        let mut factor = 1.0;
        for d2 in (0..dim).rev()
        {
            if d2 == d
            {
                continue;
            }
            let n = stripes[d2].len();
            point[d2] = stripes[d2][index % n];
            factor *= weights[d2][index % n];
            index /= n;
        }
        point[d] = child_info.child;
        ctx.operation.eval_point(&point, &mut f_child);
        point[d] = child_info.left_parent;
        ctx.operation.eval_point(&point, &mut f_left);
        point[d] = child_info.right_parent;
        ctx.operation.eval_point(&point, &mut f_right);
        for k in 0..num_outputs
        {
            volume[k] += factor * (f_child[k] - 0.5 * (f_left[k] + f_right[k])).abs() * width;
        }
    }
    (volume, slice_count)
}

#[test]
fn test_stripe_weights_non_uniform()
{
    let weights = stripe_weights(&[0.0, 0.25, 0.5, 1.0]);
    assert_eq!(weights, vec![0.125, 0.25, 0.375, 0.25]);
    let sum: f64 = weights.iter().sum();
    assert!((sum - 1.0).abs() < 1e-15);
}

#[test]
fn test_child_detection_and_parents()
{
    let left = SingleDimInterval::new(0.0, 0.5, 0, (0, 1), 1);
    let right = SingleDimInterval::new(0.5, 1.0, 0, (1, 0), 1);
    assert!(is_child(&left, &right));
    let info = node_info(&left, &right, 7, 8);
    assert_eq!(info.child, 0.5);
    assert_eq!(info.left_parent, 0.0);
    assert_eq!(info.right_parent, 1.0);
    assert!(!info.has_left_child && !info.has_right_child);
    assert_eq!((info.left_object, info.right_object), (Some(7), Some(8)));
    // a neighbour refined deeper than the child turns the missing right
    // parent into a mirrored one
    let fine = SingleDimInterval::new(0.0, 0.25, 0, (0, 2), 1);
    let next = SingleDimInterval::new(0.25, 0.375, 0, (2, 3), 1);
    let info = node_info(&fine, &next, 1, 2);
    assert_eq!(info.child, 0.25);
    assert_eq!(info.right_parent, 0.5);
    assert!(info.has_right_child);
    assert!(info.right_object.is_none());
    // a coarser neighbour supplies the real right parent instead
    let next = SingleDimInterval::new(0.25, 0.5, 0, (2, 1), 1);
    let info = node_info(&fine, &next, 1, 2);
    assert_eq!(info.right_parent, 0.5);
    assert!(!info.has_right_child);
    assert_eq!(info.right_object, Some(2));
}

#[test]
fn test_interval_split_levels()
{
    let interval = SingleDimInterval::new(0.0, 0.5, 0, (0, 1), 1);
    let next_level = interval.levels.0.max(interval.levels.1) + 1;
    assert_eq!(next_level, 2);
}
