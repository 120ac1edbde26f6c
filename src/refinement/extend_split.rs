use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::combi_scheme::num_sub_diagonal;
use crate::engine::EngineContext;
use crate::operation::CombiOperation;
use crate::refinement::container::{RefinementContainer, RefinementObject, RegionState};

///
/// How aggressively a region's level vector is lowered relative to the
/// global maximum level to avoid recomputing already-refined neighbours.
/// `Maximal` coarsens as much as possible and adds points only in refined
/// regions; `Balanced` and `Minimal` coarsen less for a more even point
/// distribution, with empirically tuned thresholds.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoarseningPolicy
{
    #[default]
    Maximal,
    Balanced,
    Minimal,
}

///
/// One axis-aligned box of the extend/split decomposition. Structural links
/// (parent, children, twins across each split plane) are arena handles into
/// the owning container.
///
pub struct ExtendSplitRegion
{
    pub start: Vec<f64>,
    pub end: Vec<f64>,
    /// How many levels this region's grids are shifted down relative to the
    /// global maximum level.
    pub coarsening_value: u32,
    pub refinements: u32,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub twins: Vec<Option<usize>>,
    pub twin_errors: Vec<f64>,
    /// The parent's combination value at split/extend time, kept to compute
    /// error deltas against the children.
    pub parent_value: Vec<f64>,
    /// Coarse level vectors already produced this pass, mapped to the fine
    /// vector that produced them. A second fine vector mapping to the same
    /// coarse vector is a redundant (null) contribution.
    evaluated_levels: FxHashMap<Vec<u32>, Vec<u32>>,
    pub state: RegionState,
}

impl ExtendSplitRegion
{
    pub fn new(start: Vec<f64>, end: Vec<f64>, num_outputs: usize) -> Self
    {
        let dim = start.len();
        Self {
            start,
            end,
            coarsening_value: 0,
            refinements: 0,
            parent: None,
            children: Vec::new(),
            twins: vec![None; dim],
            twin_errors: vec![0.0; dim],
            parent_value: Vec::new(),
            evaluated_levels: FxHashMap::default(),
            state: RegionState::new(num_outputs),
        }
    }

    fn already_evaluated(&self, coarse: &[u32], fine: &[u32]) -> bool
    {
        match self.evaluated_levels.get(coarse)
        {
            Some(previous) => previous != fine,
            None => false,
        }
    }

    pub fn volume(&self) -> f64
    {
        self.start.iter().zip(&self.end).map(|(&s, &e)| e - s).product()
    }
}

impl RefinementObject for ExtendSplitRegion
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
/// Lower a region's level vector by its coarsening value. Returns the
/// coarsened levels relative to `lmin` plus the null flag marking a
/// redundant contribution that must be skipped to avoid double counting.
/// Ties for the most refined dimension break to the lexicographically first
/// tied dimension.
///
pub fn coarsen_grid(policy: CoarseningPolicy, region: &mut ExtendSplitRegion, levelvector: &[u32],
    lmin: &[u32], lmax: &[u32], num_sub_diagonal: i64) -> (Vec<u32>, bool)
{
    let dim = levelvector.len();
    let mut temp = levelvector.to_vec();
    let mut coarsening = region.coarsening_value as i64;
    let coarsening_save = coarsening;
    let mut is_null = false;
    if policy == CoarseningPolicy::Maximal
    {
        let max_level = temp.iter().copied().fold(0, u32::max);
        let mut sorted = temp.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        if ((sorted[0] - sorted[1]) as i64) < coarsening
        {
            while coarsening > 0
            {
                let max_level = temp.iter().copied().fold(0, u32::max);
                if max_level == lmin[0]
                {
                    break;
                }
                for level in temp.iter_mut()
                {
                    if *level == max_level
                    {
                        *level -= 1;
                        coarsening -= 1;
                        break;
                    }
                }
            }
            is_null = true;
        }
        else
        {
            for level in temp.iter_mut()
            {
                if *level == max_level
                {
                    *level -= coarsening as u32;
                    break;
                }
            }
            if region.already_evaluated(&temp, levelvector)
            {
                is_null = true;
            }
            else
            {
                region.evaluated_levels.insert(temp.clone(), levelvector.to_vec());
            }
        }
    }
    else
    {
        let slack: i64 = if policy == CoarseningPolicy::Balanced { 1 } else { 2 };
        while coarsening > 0
        {
            let max_level = temp.iter().copied().fold(0, u32::max);
            if max_level == lmin[0]
            {
                break;
            }
            let occurrences = temp.iter().filter(|&&l| l == max_level).count() as i64;
            let is_top_diag = num_sub_diagonal == 0;
            let no_forward_problem = coarsening_save
                >= lmax[0] as i64 + dim as i64 - 1 - max_level as i64 - (dim as i64 - 2)
                    - max_level as i64
                    + slack;
            let required = if policy == CoarseningPolicy::Balanced
            {
                occurrences - is_top_diag as i64
            }
            else
            {
                occurrences
            };
            if no_forward_problem && coarsening >= required
            {
                for level in temp.iter_mut()
                {
                    if *level == max_level
                    {
                        *level -= 1;
                        coarsening -= 1;
                    }
                }
            }
            else
            {
                break;
            }
        }
    }
    let levels = temp.iter().zip(lmin).map(|(&t, &l)| t - l).collect();
    (levels, is_null)
}

struct LocalBox
{
    start: Vec<f64>,
    end: Vec<f64>,
    twins: Vec<Option<usize>>,
}

///
/// Box decomposition with an extend/split hybrid refinement: a region is
/// midpoint-split into 2^d children until its split budget is exhausted,
/// after which refinements extend the region's own level range instead
/// (lowering its coarsening value, and growing the global maximum level once
/// it reaches zero).
///
pub struct ExtendSplitStrategy
{
    pub policy: CoarseningPolicy,
    pub splits_before_extend: u32,
    container: RefinementContainer<ExtendSplitRegion>,
}

impl ExtendSplitStrategy
{
    pub fn new(policy: CoarseningPolicy, splits_before_extend: u32) -> Self
    {
        Self { policy, splits_before_extend, container: RefinementContainer::new(Vec::new()) }
    }

    pub fn container(&self) -> &RefinementContainer<ExtendSplitRegion>
    {
        &self.container
    }

    ///
    /// Evaluate the root once at the coarsest level, then pre-split it into
    /// 2^d children so every dimension starts with a refinement boundary.
    ///
    pub fn initialize<O: CombiOperation>(&mut self, a: &[f64], b: &[f64],
        ctx: &mut EngineContext<'_, O>)
    {
        let dim = a.len();
        assert!(dim >= 2);
        let num_outputs = ctx.operation.num_outputs();
        let mut root = ExtendSplitRegion::new(a.to_vec(), b.to_vec(), num_outputs);
        let (value, evaluations) = ctx.operation.evaluate_area(a, b, &vec![0; dim]);
        root.state.value = value;
        root.state.evaluations = evaluations as f64;
        self.container = RefinementContainer::new(vec![root]);
        self.split_region(0, num_outputs);
        self.evaluate(ctx);
    }

    /// Evaluate every new region over the full scheme, then derive errors,
    /// benefits and twin errors for them.
    pub fn evaluate<O: CombiOperation>(&mut self, ctx: &mut EngineContext<'_, O>)
    {
        for handle in self.container.new_handles()
        {
            self.evaluate_region(handle, ctx);
        }
        for handle in self.container.new_handles()
        {
            let error = self.error_delta(handle, ctx);
            self.container.object_mut(handle).state.error = error;
            self.container.set_benefit(handle);
        }
        self.update_twin_errors(ctx);
    }

    fn evaluate_region<O: CombiOperation>(&mut self, handle: usize,
        ctx: &mut EngineContext<'_, O>)
    {
        let (start, end) = {
            let region = self.container.object_mut(handle);
            region.evaluated_levels.clear();
            region.state.reset();
            (region.start.clone(), region.end.clone())
        };
        for i in 0..ctx.scheme.len()
        {
            let grid_info = ctx.scheme[i].clone();
            let sub_diagonal = num_sub_diagonal(ctx.lmax[0], &grid_info.levelvector);
            let (levels, is_null) = coarsen_grid(self.policy, self.container.object_mut(handle),
                &grid_info.levelvector, ctx.lmin, ctx.lmax, sub_diagonal);
            if is_null
            {
                continue;
            }
            let (value, evaluations) = ctx.operation.evaluate_area(&start, &end, &levels);
            let factor = if ctx.operation.grid().is_nested()
                && ctx.operation.counts_distinct_points()
            {
                grid_info.coefficient
            }
            else
            {
                1
            };
            let state = self.container.object_mut(handle).state_mut();
            for (acc, v) in state.value.iter_mut().zip(&value)
            {
                *acc += grid_info.coefficient as f64 * v;
            }
            state.evaluations += evaluations as f64 * factor as f64;
        }
    }

    ///
    /// Error estimate: the norm of the deviation of the sibling sum from the
    /// parent's prior value. Siblings of one split share the estimate.
    ///
    fn error_delta<O: CombiOperation>(&self, handle: usize, ctx: &EngineContext<'_, O>) -> f64
    {
        let region = self.container.object(handle);
        match region.parent
        {
            Some(parent) =>
            {
                let mut sum = vec![0.0; region.parent_value.len()];
                for &sibling in &self.container.object(parent).children
                {
                    for (acc, v) in sum.iter_mut().zip(&self.container.object(sibling).state.value)
                    {
                        *acc += v;
                    }
                }
                let diff: Vec<f64> =
                    sum.iter().zip(&region.parent_value).map(|(&s, &p)| s - p).collect();
                ctx.norm.eval(&diff)
            }
            None => ctx.norm.eval(&region.state.value),
        }
    }

    fn update_twin_errors<O: CombiOperation>(&mut self, ctx: &EngineContext<'_, O>)
    {
        for handle in self.container.new_handles()
        {
            for d in 0..self.container.object(handle).twins.len()
            {
                let Some(twin) = self.container.object(handle).twins[d] else { continue };
                if !self.container.is_active(twin)
                {
                    continue;
                }
                let diff: Vec<f64> = self
                    .container
                    .object(handle)
                    .state
                    .value
                    .iter()
                    .zip(&self.container.object(twin).state.value)
                    .map(|(&a, &b)| a - b)
                    .collect();
                let error = ctx.norm.eval(&diff);
                self.container.object_mut(handle).twin_errors[d] = error;
                self.container.object_mut(twin).twin_errors[d] = error;
            }
        }
    }

    /// Midpoint-split a region in every dimension, linking twins across each
    /// split plane. The parent is deactivated but retained.
    fn split_region(&mut self, handle: usize, num_outputs: usize) -> Vec<usize>
    {
        let (start, end, coarsening, refinements, parent_value) = {
            let region = self.container.object(handle);
            (region.start.clone(), region.end.clone(), region.coarsening_value,
                region.refinements, region.state.value.clone())
        };
        let dim = start.len();
        let mut boxes = vec![LocalBox { start, end, twins: vec![None; dim] }];
        for d in 0..dim
        {
            let mut next = Vec::with_capacity(boxes.len() * 2);
            for parent_box in boxes
            {
                let midpoint = 0.5 * (parent_box.start[d] + parent_box.end[d]);
                // child k of local index i lands at 2i + k, so earlier twin
                // links remap to the matching halves
                let remap = |k: usize| {
                    parent_box
                        .twins
                        .iter()
                        .map(|t| t.map(|j| 2 * j + k))
                        .collect::<Vec<Option<usize>>>()
                };
                let low_index = next.len();
                let mut low_end = parent_box.end.clone();
                low_end[d] = midpoint;
                let mut high_start = parent_box.start.clone();
                high_start[d] = midpoint;
                let mut low =
                    LocalBox { start: parent_box.start.clone(), end: low_end, twins: remap(0) };
                let mut high = LocalBox { start: high_start, end: parent_box.end, twins: remap(1) };
                low.twins[d] = Some(low_index + 1);
                high.twins[d] = Some(low_index);
                next.push(low);
                next.push(high);
            }
            boxes = next;
        }
        let first = self.container.len();
        let mut handles = Vec::with_capacity(boxes.len());
        for local in boxes
        {
            let mut child = ExtendSplitRegion::new(local.start, local.end, num_outputs);
            child.coarsening_value = coarsening;
            child.refinements = refinements;
            child.parent = Some(handle);
            child.parent_value = parent_value.clone();
            child.twins = local.twins.iter().map(|t| t.map(|j| first + j)).collect();
            handles.push(self.container.insert(child));
        }
        self.container.object_mut(handle).children = handles.clone();
        self.container.deactivate(handle);
        handles
    }

    ///
    /// Refine one region. Until the split budget is exhausted the region is
    /// split into 2^d children; afterwards it is extended: its coarsening
    /// value drops by one, and at zero the global maximum level grows
    /// instead, with every other region's coarsening raised to compensate.
    /// Returns whether the scheme changed.
    ///
    pub fn refine<O: CombiOperation>(&mut self, handle: usize, ctx: &mut EngineContext<'_, O>)
        -> bool
    {
        let num_outputs = ctx.operation.num_outputs();
        let refinements = {
            let region = self.container.object_mut(handle);
            region.refinements += 1;
            region.refinements
        };
        if refinements < self.splits_before_extend
        {
            self.split_region(handle, num_outputs);
            return false;
        }
        let (start, end, coarsening, value, twins) = {
            let region = self.container.object(handle);
            (region.start.clone(), region.end.clone(), region.coarsening_value,
                region.state.value.clone(), region.twins.clone())
        };
        let mut scheme_changed = false;
        if coarsening == 0
        {
            let others: Vec<usize> = self.container.active_handles().collect();
            for other in others
            {
                if other != handle
                {
                    self.container.object_mut(other).coarsening_value += 1;
                }
            }
            ctx.raise_lmax_all();
            scheme_changed = true;
        }
        let mut region = ExtendSplitRegion::new(start, end, num_outputs);
        region.coarsening_value = coarsening.saturating_sub(1);
        region.refinements = refinements;
        region.parent = Some(handle);
        region.parent_value = value;
        region.twins = twins;
        let new_handle = self.container.insert(region);
        self.container.object_mut(handle).children = vec![new_handle];
        self.container.deactivate(handle);
        scheme_changed
    }

    pub fn start_refinement_pass(&mut self)
    {
        self.container.clear_new();
        self.container.start_refinement_pass();
    }

    pub fn next_for_refinement(&mut self, tolerance: f64) -> Option<usize>
    {
        self.container.next_for_refinement(tolerance)
    }

    pub fn postprocess_refinement(&mut self)
    {
        self.container.apply_remove();
    }

    pub fn mark_all_new(&mut self)
    {
        self.container.mark_all_new();
    }

    pub fn value(&self, num_outputs: usize) -> Vec<f64>
    {
        let mut total = vec![0.0; num_outputs];
        for handle in self.container.active_handles()
        {
            for (acc, v) in total.iter_mut().zip(&self.container.object(handle).state.value)
            {
                *acc += v;
            }
        }
        total
    }

    pub fn max_benefit(&self) -> f64
    {
        self.container.max_benefit()
    }

    pub fn total_error(&self) -> f64
    {
        self.container.total_error()
    }

    ///
    /// All grid points each component grid contributes over the current
    /// decomposition, null regions skipped, flattened per grid. Mirrors the
    /// level dictionary state of an evaluation pass so the coefficient-sum
    /// check sees exactly the evaluated points.
    ///
    pub fn component_grid_points<O: CombiOperation>(&mut self, ctx: &EngineContext<'_, O>)
        -> Vec<Vec<f64>>
    {
        let handles: Vec<usize> = self.container.active_handles().collect();
        for &handle in &handles
        {
            self.container.object_mut(handle).evaluated_levels.clear();
        }
        let mut per_grid = Vec::with_capacity(ctx.scheme.len());
        for grid_info in ctx.scheme.iter()
        {
            let sub_diagonal = num_sub_diagonal(ctx.lmax[0], &grid_info.levelvector);
            let mut points = Vec::new();
            for &handle in &handles
            {
                let (levels, is_null) =
                    coarsen_grid(self.policy, self.container.object_mut(handle),
                        &grid_info.levelvector, ctx.lmin, ctx.lmax, sub_diagonal);
                if is_null
                {
                    continue;
                }
                let region = self.container.object(handle);
                let (grid_points, _) =
                    ctx.operation.grid().points_and_weights(&region.start, &region.end, &levels);
                points.extend(grid_points);
            }
            per_grid.push(points);
        }
        per_grid
    }

    /// Total volume of the active regions; equals the domain volume for a
    /// valid partition.
    pub fn active_volume(&self) -> f64
    {
        self.container.active_handles().map(|h| self.container.object(h).volume()).sum()
    }
}

#[cfg(test)]
fn test_region(coarsening: u32) -> ExtendSplitRegion
{
    let mut region = ExtendSplitRegion::new(vec![0.0, 0.0], vec![1.0, 1.0], 1);
    region.coarsening_value = coarsening;
    region
}

#[test]
fn test_coarsen_maximal_subtracts_from_most_refined_dimension()
{
    let mut region = test_region(1);
    let (levels, is_null) = coarsen_grid(CoarseningPolicy::Maximal, &mut region, &[3, 1], &[1, 1],
        &[3, 3], num_sub_diagonal(3, &[3, 1]));
    assert_eq!(levels, vec![1, 0]);
    assert!(!is_null);
    // a second fine vector collapsing onto the same coarse vector is redundant
    let (_, is_null) = coarsen_grid(CoarseningPolicy::Maximal, &mut region, &[2, 2], &[1, 1],
        &[3, 3], num_sub_diagonal(3, &[2, 2]));
    assert!(is_null);
}

#[test]
fn test_coarsen_balanced_keeps_balanced_vectors()
{
    // far enough below the top diagonal the balanced threshold refuses to
    // coarsen, keeping the vector untouched
    let mut region = test_region(1);
    let (levels, is_null) = coarsen_grid(CoarseningPolicy::Balanced, &mut region, &[2, 2], &[1, 1],
        &[4, 4], num_sub_diagonal(4, &[2, 2]));
    assert_eq!(levels, vec![1, 1]);
    assert!(!is_null);
}

#[test]
fn test_coarsen_never_drops_below_lmin()
{
    let mut region = test_region(5);
    let (levels, is_null) = coarsen_grid(CoarseningPolicy::Maximal, &mut region, &[2, 1], &[1, 1],
        &[2, 2], num_sub_diagonal(2, &[2, 1]));
    assert_eq!(levels, vec![0, 0]);
    assert!(is_null);
}

#[test]
fn test_twin_errors_follow_value_differences()
{
    use crate::combi_scheme::CombiScheme;
    use crate::engine::EngineContext;
    use crate::function::ScalarFunction;
    use crate::grids::trapezoidal::TrapezoidalGrid;
    use crate::operation::{Integration, Norm};
    let mut operation = Integration::new(ScalarFunction(|x: &[f64]| x[0]), TrapezoidalGrid);
    let mut combischeme = CombiScheme::new(2);
    let mut scheme = combischeme.combi_scheme(1, 2);
    let lmin = vec![1u32, 1];
    let mut lmax = vec![2u32, 2];
    let mut ctx = EngineContext {
        scheme: &mut scheme,
        combischeme: &mut combischeme,
        lmin: &lmin,
        lmax: &mut lmax,
        operation: &mut operation,
        norm: Norm::Maximum,
    };
    let mut strategy = ExtendSplitStrategy::new(CoarseningPolicy::Maximal, 2);
    strategy.initialize(&[0.0, 0.0], &[1.0, 1.0], &mut ctx);
    let handles: Vec<usize> = strategy.container.active_handles().collect();
    let lowlow = strategy.container.object(handles[0]);
    // for f(x, y) = x the twin across the x plane integrates the larger
    // slice, the twin across the y plane the identical one
    assert!((lowlow.twin_errors[0] - 0.125).abs() < 1e-12);
    assert!(lowlow.twin_errors[1] < 1e-12);
}

#[test]
fn test_split_links_twins_and_partitions_volume()
{
    let mut strategy = ExtendSplitStrategy::new(CoarseningPolicy::Maximal, 1);
    strategy.container =
        RefinementContainer::new(vec![ExtendSplitRegion::new(vec![0.0, 0.0], vec![1.0, 1.0], 1)]);
    let children = strategy.split_region(0, 1);
    assert_eq!(children.len(), 4);
    assert!((strategy.active_volume() - 1.0).abs() < 1e-15);
    // (x low, y low) has its x twin at (x high, y low) and y twin at (x low, y high)
    let lowlow = strategy.container.object(children[0]);
    assert_eq!(lowlow.twins, vec![Some(children[2]), Some(children[1])]);
    assert_eq!(lowlow.start, vec![0.0, 0.0]);
    assert_eq!(lowlow.end, vec![0.5, 0.5]);
    let highhigh = strategy.container.object(children[3]);
    assert_eq!(highhigh.twins, vec![Some(children[1]), Some(children[2])]);
    assert!(!strategy.container.is_active(0));
    assert_eq!(strategy.container.object(0).children, children);
}
