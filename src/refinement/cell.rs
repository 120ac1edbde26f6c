use rustc_hash::FxHashMap;

use crate::engine::EngineContext;
use crate::operation::CombiOperation;
use crate::refinement::container::{RefinementContainer, RefinementObject, RegionState};

///
/// One cell of the full-subdivision decomposition. Unlike the box strategy a
/// cell carries its own level vector, and its value is the hierarchical
/// surplus against its geometric parents rather than a combination sum, so
/// refined parents keep contributing.
///
pub struct CellRegion
{
    pub start: Vec<f64>,
    pub end: Vec<f64>,
    pub levelvec: Vec<u32>,
    pub state: RegionState,
}

impl CellRegion
{
    fn new(start: Vec<f64>, end: Vec<f64>, levelvec: Vec<u32>, num_outputs: usize) -> Self
    {
        Self { start, end, levelvec, state: RegionState::new(num_outputs) }
    }

    fn key(&self) -> Vec<u64>
    {
        self.start.iter().chain(self.end.iter()).map(|v| v.to_bits()).collect()
    }

    pub fn volume(&self) -> f64
    {
        self.start.iter().zip(&self.end).map(|(&s, &e)| e - s).product()
    }
}

impl RefinementObject for CellRegion
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
/// The geometric parent of a cell's extent one level up in dimension `d`,
/// derived from the parity of the cell's position in that dimension.
///
fn parent_extent(d: usize, start: &[f64], end: &[f64], a: &[f64]) -> (Vec<f64>, Vec<f64>)
{
    let width = end[d] - start[d];
    let index = ((start[d] - a[d]) / width).round() as i64;
    let mut parent_start = start.to_vec();
    let mut parent_end = end.to_vec();
    if index % 2 == 0
    {
        parent_end[d] = start[d] + 2.0 * width;
    }
    else
    {
        parent_start[d] = start[d] - width;
    }
    (parent_start, parent_end)
}

///
/// Integrate the multilinear interpolant of a cell's corner values over a
/// subcell via the trapezoidal rule on the subcell corners.
///
fn integrate_subcell_with_interpolation<O: CombiOperation>(cell_start: &[f64], cell_end: &[f64],
    sub_start: &[f64], sub_end: &[f64], ctx: &mut EngineContext<'_, O>) -> Vec<f64>
{
    let dim = cell_start.len();
    let num_outputs = ctx.operation.num_outputs();
    let corners = 1usize << dim;
    let mut corner_values = vec![vec![0.0; num_outputs]; corners];
    let mut point = vec![0.0; dim];
    for (m, value) in corner_values.iter_mut().enumerate()
    {
        for d in 0..dim
        {
            point[d] = if (m >> d) & 1 == 1 { cell_end[d] } else { cell_start[d] };
        }
        ctx.operation.eval_point(&point, value);
    }
    let width: f64 = sub_start.iter().zip(sub_end).map(|(&s, &e)| e - s).product();
    let factor = 0.5_f64.powi(dim as i32) * width;
    let mut integral = vec![0.0; num_outputs];
    for s in 0..corners
    {
        for d in 0..dim
        {
            point[d] = if (s >> d) & 1 == 1 { sub_end[d] } else { sub_start[d] };
        }
        for (m, value) in corner_values.iter().enumerate()
        {
            let mut weight = factor;
            for d in 0..dim
            {
                let t = (point[d] - cell_start[d]) / (cell_end[d] - cell_start[d]);
                weight *= if (m >> d) & 1 == 1 { t } else { 1.0 - t };
            }
            for k in 0..num_outputs
            {
                integral[k] += weight * value[k];
            }
        }
    }
    integral
}

///
/// Cell-based strategy after Gerstner and Griebel: refinement bisects a
/// cell per dimension, growing a downward-closed set of anisotropic cells.
/// Every cell contributes its integral surplus (the signed sum over its
/// relevant parents of the parent interpolant integrated over the cell),
/// and the total is the plain sum of all surpluses ever produced.
///
pub struct CellStrategy
{
    a: Vec<f64>,
    container: RefinementContainer<CellRegion>,
    /// Cell extents already materialised, so refinements of neighbouring
    /// cells never create a cell twice.
    cell_dict: FxHashMap<Vec<u64>, usize>,
}

impl CellStrategy
{
    pub fn new() -> Self
    {
        Self { a: Vec::new(), container: RefinementContainer::new(Vec::new()),
            cell_dict: FxHashMap::default() }
    }

    pub fn container(&self) -> &RefinementContainer<CellRegion>
    {
        &self.container
    }

    /// Subdivide the root until the cells form the `lmin` full grid.
    pub fn initialize<O: CombiOperation>(&mut self, a: &[f64], b: &[f64],
        ctx: &mut EngineContext<'_, O>)
    {
        let dim = a.len();
        let num_outputs = ctx.operation.num_outputs();
        self.a = a.to_vec();
        let mut cells = vec![CellRegion::new(a.to_vec(), b.to_vec(), vec![0; dim], num_outputs)];
        for d in 0..dim
        {
            for _ in 0..ctx.lmin[d]
            {
                let mut split = Vec::with_capacity(cells.len() * 2);
                for cell in cells
                {
                    let midpoint = 0.5 * (cell.start[d] + cell.end[d]);
                    let mut levelvec = cell.levelvec.clone();
                    levelvec[d] += 1;
                    let mut low_end = cell.end.clone();
                    low_end[d] = midpoint;
                    let mut high_start = cell.start.clone();
                    high_start[d] = midpoint;
                    split.push(CellRegion::new(cell.start.clone(), low_end, levelvec.clone(),
                        num_outputs));
                    split.push(CellRegion::new(high_start, cell.end.clone(), levelvec,
                        num_outputs));
                }
                cells = split;
            }
        }
        self.container = RefinementContainer::new(cells);
        self.cell_dict.clear();
        for handle in 0..self.container.len()
        {
            let key = self.container.object(handle).key();
            self.cell_dict.insert(key, handle);
        }
        self.evaluate(ctx);
    }

    ///
    /// Compute the surplus of every new cell. The relevant parents are the
    /// per-dimension upward closure of the cell's extent with
    /// inclusion-exclusion coefficients; dimensions already at `lmin` have
    /// no parent.
    ///
    pub fn evaluate<O: CombiOperation>(&mut self, ctx: &mut EngineContext<'_, O>)
    {
        for handle in self.container.new_handles()
        {
            self.evaluate_cell(handle, ctx);
        }
    }

    fn evaluate_cell<O: CombiOperation>(&mut self, handle: usize, ctx: &mut EngineContext<'_, O>)
    {
        let (start, end, levelvec) = {
            let cell = self.container.object(handle);
            (cell.start.clone(), cell.end.clone(), cell.levelvec.clone())
        };
        let dim = start.len();
        let num_outputs = ctx.operation.num_outputs();
        let mut parents = vec![(start.clone(), end.clone(), levelvec, 1i32)];
        for d in 0..dim
        {
            let mut upward = Vec::new();
            for (parent_start, parent_end, parent_levels, coefficient) in &parents
            {
                if parent_levels[d] <= ctx.lmin[d]
                {
                    continue;
                }
                let (grand_start, grand_end) = parent_extent(d, parent_start, parent_end, &self.a);
                let mut grand_levels = parent_levels.clone();
                grand_levels[d] -= 1;
                upward.push((grand_start, grand_end, grand_levels, -coefficient));
            }
            parents.extend(upward);
        }
        debug_assert!(parents.len() <= 1 << dim);
        let mut surplus = vec![0.0; num_outputs];
        let mut evaluations = 0usize;
        for (parent_start, parent_end, _, coefficient) in &parents
        {
            let contribution =
                integrate_subcell_with_interpolation(parent_start, parent_end, &start, &end, ctx);
            for (acc, v) in surplus.iter_mut().zip(&contribution)
            {
                *acc += *coefficient as f64 * v;
            }
            evaluations += 1 << dim;
        }
        let error = ctx.norm.eval(&surplus);
        let state = self.container.object_mut(handle).state_mut();
        state.value = surplus;
        state.evaluations = evaluations as f64;
        state.error = error;
        self.container.set_benefit(handle);
    }

    ///
    /// Bisect a cell along every dimension in turn, producing two children
    /// one level finer per split axis. The anisotropic children keep the
    /// cell set downward closed, so the surpluses telescope; children
    /// shared with a refined neighbour already exist in the dictionary and
    /// are created only once. The parent is deactivated but its surplus
    /// keeps counting.
    ///
    pub fn refine<O: CombiOperation>(&mut self, handle: usize, ctx: &mut EngineContext<'_, O>)
        -> bool
    {
        let num_outputs = ctx.operation.num_outputs();
        let (start, end, levelvec) = {
            let cell = self.container.object(handle);
            (cell.start.clone(), cell.end.clone(), cell.levelvec.clone())
        };
        let dim = start.len();
        for d in 0..dim
        {
            let midpoint = 0.5 * (start[d] + end[d]);
            let mut child_levels = levelvec.clone();
            child_levels[d] += 1;
            for upper in [false, true]
            {
                let mut child_start = start.clone();
                let mut child_end = end.clone();
                if upper
                {
                    child_start[d] = midpoint;
                }
                else
                {
                    child_end[d] = midpoint;
                }
                let child =
                    CellRegion::new(child_start, child_end, child_levels.clone(), num_outputs);
                let key = child.key();
                if self.cell_dict.contains_key(&key)
                {
                    continue;
                }
                let child_handle = self.container.insert(child);
                self.cell_dict.insert(key, child_handle);
            }
        }
        self.container.object_mut(handle).state.benefit = 0.0;
        self.container.deactivate(handle);
        false
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

    pub fn mark_all_new(&mut self)
    {
        self.container.mark_all_new();
    }

    /// Sum of all surpluses, refined parents included.
    pub fn value(&self, num_outputs: usize) -> Vec<f64>
    {
        let mut total = vec![0.0; num_outputs];
        for handle in 0..self.container.len()
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

    pub fn active_volume(&self) -> f64
    {
        self.container.active_handles().map(|h| self.container.object(h).volume()).sum()
    }
}

impl Default for CellStrategy
{
    fn default() -> Self
    {
        Self::new()
    }
}

#[test]
fn test_refine_bisects_per_dimension_and_dedups_shared_children()
{
    use crate::combi_scheme::CombiScheme;
    use crate::engine::EngineContext;
    use crate::function::ScalarFunction;
    use crate::grids::trapezoidal::TrapezoidalGrid;
    use crate::operation::{Integration, Norm};
    let mut operation = Integration::new(ScalarFunction(|_: &[f64]| 1.0), TrapezoidalGrid);
    let mut combischeme = CombiScheme::new(2);
    let mut scheme = combischeme.combi_scheme(1, 1);
    let lmin = vec![1u32, 1];
    let mut lmax = vec![1u32, 1];
    let mut ctx = EngineContext {
        scheme: &mut scheme,
        combischeme: &mut combischeme,
        lmin: &lmin,
        lmax: &mut lmax,
        operation: &mut operation,
        norm: Norm::Maximum,
    };
    let mut strategy = CellStrategy::new();
    strategy.initialize(&[0.0, 0.0], &[1.0, 1.0], &mut ctx);
    assert_eq!(strategy.container.len(), 4);
    // bisection per dimension: two (2,1) children and two (1,2) children
    strategy.refine(0, &mut ctx);
    assert_eq!(strategy.container.len(), 8);
    let levels: Vec<Vec<u32>> =
        (4..8).map(|h| strategy.container.object(h).levelvec.clone()).collect();
    assert_eq!(levels, vec![vec![2, 1], vec![2, 1], vec![1, 2], vec![1, 2]]);
    assert!(!strategy.container.is_active(0));
    // the (2, 2) grandchild shared by a (2, 1) and a (1, 2) parent is
    // created exactly once
    strategy.refine(4, &mut ctx);
    assert_eq!(strategy.container.len(), 12);
    strategy.refine(6, &mut ctx);
    assert_eq!(strategy.container.len(), 15);
}

#[test]
fn test_parent_extent_parity()
{
    // the second quarter [0.25, 0.5) is the high half of its parent
    let (start, end) = parent_extent(0, &[0.25], &[0.5], &[0.0]);
    assert_eq!((start, end), (vec![0.0], vec![0.5]));
    // the third quarter [0.5, 0.75) is the low half of its parent
    let (start, end) = parent_extent(0, &[0.5], &[0.75], &[0.0]);
    assert_eq!((start, end), (vec![0.5], vec![1.0]));
}

#[test]
fn test_cell_key_distinguishes_extents()
{
    let cell = CellRegion::new(vec![0.0, 0.5], vec![0.5, 1.0], vec![1, 1], 1);
    let other = CellRegion::new(vec![0.5, 0.5], vec![1.0, 1.0], vec![1, 1], 1);
    assert_ne!(cell.key(), other.key());
    assert_eq!(cell.volume(), 0.25);
}
