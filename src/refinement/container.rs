use serde::{Deserialize, Serialize};

///
/// Numeric bookkeeping shared by every decomposition unit: the accumulated
/// combination value, the evaluation count, the local error estimate and
/// the derived benefit used to rank regions for refinement.
///
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RegionState
{
    pub value: Vec<f64>,
    pub evaluations: f64,
    pub error: f64,
    pub benefit: f64,
    pub refined: bool,
}

impl RegionState
{
    pub fn new(num_outputs: usize) -> Self
    {
        Self { value: vec![0.0; num_outputs], ..Default::default() }
    }

    /// Clear the accumulated numeric state ahead of a fresh evaluation.
    pub fn reset(&mut self)
    {
        self.value.fill(0.0);
        self.evaluations = 0.0;
        self.error = 0.0;
        self.benefit = 0.0;
    }
}

pub trait RefinementObject
{
    fn state(&self) -> &RegionState;
    fn state_mut(&mut self) -> &mut RegionState;
}

///
/// Ordered, indexable collection of refinement regions for one decomposition
/// axis or for the whole domain. Regions live in an arena with stable
/// integer handles; split parents are deactivated but retained so children
/// can keep non-owning handles to them. Active regions iterate in creation
/// order, and a parallel marker set tracks which regions are new since the
/// last evaluation pass.
///
#[derive(Clone, Default)]
pub struct RefinementContainer<T: RefinementObject>
{
    arena: Vec<T>,
    order: Vec<usize>,
    active: Vec<bool>,
    new_marks: Vec<bool>,
    search_pos: usize,
}

impl<T: RefinementObject> RefinementContainer<T>
{
    pub fn new(initial: Vec<T>) -> Self
    {
        let count = initial.len();
        Self {
            arena: initial,
            order: (0..count).collect(),
            active: vec![true; count],
            new_marks: vec![true; count],
            search_pos: 0,
        }
    }

    pub fn len(&self) -> usize
    {
        self.arena.len()
    }

    pub fn num_active(&self) -> usize
    {
        self.order.iter().filter(|&&handle| self.active[handle]).count()
    }

    pub fn object(&self, handle: usize) -> &T
    {
        &self.arena[handle]
    }

    pub fn object_mut(&mut self, handle: usize) -> &mut T
    {
        &mut self.arena[handle]
    }

    /// Handles of all active regions in creation order.
    pub fn active_handles(&self) -> impl Iterator<Item = usize> + '_
    {
        self.order.iter().copied().filter(|&handle| self.active[handle])
    }

    /// Handles of the active regions created or touched since the last pass.
    pub fn new_handles(&self) -> Vec<usize>
    {
        self.active_handles().filter(|&handle| self.new_marks[handle]).collect()
    }

    pub fn clear_new(&mut self)
    {
        self.new_marks.fill(false);
    }

    /// Re-mark every active region as new, forcing full re-evaluation.
    pub fn mark_all_new(&mut self)
    {
        for handle in 0..self.arena.len()
        {
            self.new_marks[handle] = self.active[handle];
        }
    }

    pub fn insert(&mut self, object: T) -> usize
    {
        let handle = self.arena.len();
        self.arena.push(object);
        self.order.push(handle);
        self.active.push(true);
        self.new_marks.push(true);
        handle
    }

    /// Remove a region from the active set; the arena entry is retained.
    pub fn deactivate(&mut self, handle: usize)
    {
        self.active[handle] = false;
        self.new_marks[handle] = false;
    }

    pub fn is_active(&self, handle: usize) -> bool
    {
        self.active[handle]
    }

    /// Drop deactivated handles from the iteration order.
    pub fn apply_remove(&mut self)
    {
        let active = &self.active;
        self.order.retain(|&handle| active[handle]);
    }

    /// Reorder the active handles, e.g. by spatial position for strategies
    /// whose iteration order is positional rather than creational.
    pub fn sort_active<F>(&mut self, mut cmp: F)
    where
        F: FnMut(&T, &T) -> std::cmp::Ordering,
    {
        let arena = &self.arena;
        self.order.sort_by(|&x, &y| cmp(&arena[x], &arena[y]));
    }

    pub fn max_benefit(&self) -> f64
    {
        self.active_handles()
            .map(|handle| self.arena[handle].state().benefit)
            .fold(0.0, f64::max)
    }

    pub fn total_error(&self) -> f64
    {
        self.active_handles().map(|handle| self.arena[handle].state().error).sum()
    }

    pub fn start_refinement_pass(&mut self)
    {
        self.search_pos = 0;
        for handle in 0..self.arena.len()
        {
            self.arena[handle].state_mut().refined = false;
        }
    }

    ///
    /// Next region whose benefit reaches `tolerance`, in creation order,
    /// skipping regions already refined in this pass and regions created by
    /// this pass. `None` once the pass is exhausted (an empty container is a
    /// valid terminal state, not an error).
    ///
    pub fn next_for_refinement(&mut self, tolerance: f64) -> Option<usize>
    {
        while self.search_pos < self.order.len()
        {
            let handle = self.order[self.search_pos];
            self.search_pos += 1;
            if !self.active[handle] || self.new_marks[handle]
            {
                continue;
            }
            let state = self.arena[handle].state();
            if !state.refined && state.benefit >= tolerance
            {
                self.arena[handle].state_mut().refined = true;
                return Some(handle);
            }
        }
        None
    }

    /// Benefit: local error weighted by the evaluation cost the region carries.
    pub fn set_benefit(&mut self, handle: usize)
    {
        let state = self.arena[handle].state_mut();
        state.benefit = state.error * state.evaluations.max(1.0);
    }
}

#[cfg(test)]
#[derive(Clone, Default)]
struct Dummy(RegionState);

#[cfg(test)]
impl RefinementObject for Dummy
{
    fn state(&self) -> &RegionState
    {
        &self.0
    }
    fn state_mut(&mut self) -> &mut RegionState
    {
        &mut self.0
    }
}

#[test]
fn test_container_selection_order()
{
    let mut container = RefinementContainer::new(vec![Dummy::default(); 3]);
    container.clear_new();
    for (handle, benefit) in [(0, 1.0), (1, 3.0), (2, 2.9)]
    {
        container.object_mut(handle).0.error = benefit;
        container.object_mut(handle).0.evaluations = 1.0;
        container.set_benefit(handle);
    }
    assert_eq!(container.max_benefit(), 3.0);
    container.start_refinement_pass();
    let tolerance = container.max_benefit() * 0.9;
    assert_eq!(container.next_for_refinement(tolerance), Some(1));
    assert_eq!(container.next_for_refinement(tolerance), Some(2));
    assert_eq!(container.next_for_refinement(tolerance), None);
}

#[test]
fn test_container_deactivation_and_new_marks()
{
    let mut container = RefinementContainer::new(vec![Dummy::default(); 2]);
    assert_eq!(container.new_handles(), vec![0, 1]);
    container.clear_new();
    let child = container.insert(Dummy::default());
    container.deactivate(0);
    container.apply_remove();
    assert_eq!(container.active_handles().collect::<Vec<_>>(), vec![1, child]);
    assert_eq!(container.new_handles(), vec![child]);
    assert_eq!(container.num_active(), 2);
    assert_eq!(container.len(), 3);
    // selection never returns a region created by the current pass
    container.start_refinement_pass();
    assert_eq!(container.next_for_refinement(0.0), Some(1));
    assert_eq!(container.next_for_refinement(0.0), None);
}
