use indexmap::IndexSet;
use rustc_hash::{FxBuildHasher, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::level_set_iterator::FixedSumIterator;

///
/// One component grid of the combination technique: a level vector together
/// with its signed integer combination coefficient. Immutable once produced.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentGridInfo
{
    pub levelvector: Vec<u32>,
    pub coefficient: i32,
}

///
/// Distance of a level vector below the finest diagonal `|l| = lmax + d - 1`
/// of a scheme with uniform bounds. Zero on the top diagonal, negative for
/// vectors beyond it (possible in dimension-adaptive schemes).
///
pub fn num_sub_diagonal(lmax: u32, levelvector: &[u32]) -> i64
{
    lmax as i64 + levelvector.len() as i64
        - 1
        - levelvector.iter().map(|&l| l as i64).sum::<i64>()
}

fn binomial(n: usize, k: usize) -> i32
{
    let mut result: i64 = 1;
    for i in 0..k
    {
        result = result * (n - i) as i64 / (i + 1) as i64;
    }
    result as i32
}

///
/// Produces the set of (level vector, coefficient) pairs of the combination
/// technique. In the classical mode the coefficients follow the binomial
/// inclusion-exclusion formula over the simplex diagonals; in the
/// dimension-adaptive mode they are derived from an explicit active index
/// set that grows asymmetrically as dimensions are selectively refined.
///
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CombiScheme
{
    dim: usize,
    lmin: u32,
    adaptive: bool,
    active_index_set: IndexSet<Vec<u32>, FxBuildHasher>,
    old_index_set: IndexSet<Vec<u32>, FxBuildHasher>,
}

impl CombiScheme
{
    pub fn new(dim: usize) -> Self
    {
        assert!(dim > 0);
        Self { dim, lmin: 1, ..Default::default() }
    }

    pub fn is_dimension_adaptive(&self) -> bool
    {
        self.adaptive
    }

    ///
    /// Generate the scheme for the given scalar level bounds. For the
    /// classical mode this reproduces the standard coefficients
    /// `(-1)^q * C(d-1, q)` on the diagonals `|l| = lmax + (d-1)*lmin - q`.
    /// In adaptive mode the bounds are ignored and the scheme is derived
    /// from the current index sets.
    ///
    pub fn combi_scheme(&mut self, lmin: u32, lmax: u32) -> Vec<ComponentGridInfo>
    {
        assert!(lmax >= lmin);
        assert!(lmin >= 1);
        self.lmin = lmin;
        if self.adaptive
        {
            return self.adaptive_scheme();
        }
        let dim = self.dim;
        let mut scheme = Vec::new();
        let num_diagonals = ((lmax - lmin + 1) as usize).min(dim);
        for q in 0..num_diagonals
        {
            let sign = if q % 2 == 0 { 1 } else { -1 };
            let coefficient = sign * binomial(dim - 1, q);
            let target = lmax + (dim as u32 - 1) * lmin - q as u32;
            for levelvector in FixedSumIterator::new(dim, lmin, target)
            {
                scheme.push(ComponentGridInfo { levelvector, coefficient });
            }
        }
        scheme
    }

    ///
    /// Switch to the dimension-adaptive mode. The active set is seeded with
    /// the top diagonal of the classical scheme, the old set with every
    /// admissible level vector below it.
    ///
    pub fn init_adaptive(&mut self, lmin: u32, lmax: u32)
    {
        assert!(lmax >= lmin);
        assert!(lmin >= 1);
        self.adaptive = true;
        self.lmin = lmin;
        self.active_index_set.clear();
        self.old_index_set.clear();
        let dim = self.dim as u32;
        let top = lmax + (dim - 1) * lmin;
        for levelvector in FixedSumIterator::new(self.dim, lmin, top)
        {
            self.active_index_set.insert(levelvector);
        }
        for target in dim * lmin..top
        {
            for levelvector in FixedSumIterator::new(self.dim, lmin, target)
            {
                self.old_index_set.insert(levelvector);
            }
        }
    }

    pub fn active_indices(&self) -> impl Iterator<Item = &Vec<u32>>
    {
        self.active_index_set.iter()
    }

    pub fn contains_active(&self, levelvector: &[u32]) -> bool
    {
        self.active_index_set.contains(levelvector)
    }

    ///
    /// Promote an active index to the old set and admit its admissible
    /// upward neighbours (those whose downward neighbours are all in the
    /// old set) into the active set.
    ///
    pub fn update_adaptive(&mut self, levelvector: &[u32])
    {
        assert!(self.adaptive);
        assert!(levelvector.iter().all(|&l| l >= self.lmin));
        if !self.active_index_set.shift_remove(levelvector)
        {
            return;
        }
        self.old_index_set.insert(levelvector.to_owned());
        for d in 0..self.dim
        {
            let mut neighbour = levelvector.to_owned();
            neighbour[d] += 1;
            if self.is_admissible(&neighbour)
            {
                self.active_index_set.insert(neighbour);
            }
        }
    }

    /// An index is admissible once every downward neighbour is in the old set.
    fn is_admissible(&self, levelvector: &[u32]) -> bool
    {
        for d in 0..self.dim
        {
            if levelvector[d] > self.lmin
            {
                let mut neighbour = levelvector.to_owned();
                neighbour[d] -= 1;
                if !self.old_index_set.contains(&neighbour)
                {
                    return false;
                }
            }
        }
        true
    }

    ///
    /// Coefficients over the current index set via the inclusion-exclusion
    /// identity `c(l) = sum over z in {0,1}^d of (-1)^|z| [l + z in set]`.
    /// Grids with coefficient zero are dropped.
    ///
    fn adaptive_scheme(&self) -> Vec<ComponentGridInfo>
    {
        let set: FxHashSet<&Vec<u32>> =
            self.old_index_set.iter().chain(self.active_index_set.iter()).collect();
        let mut scheme = Vec::new();
        for levelvector in self.old_index_set.iter().chain(self.active_index_set.iter())
        {
            let mut coefficient = 0;
            let mut shifted = levelvector.clone();
            for z in 0u32..(1 << self.dim)
            {
                for d in 0..self.dim
                {
                    shifted[d] = levelvector[d] + ((z >> d) & 1);
                }
                if set.contains(&shifted)
                {
                    coefficient += if z.count_ones() % 2 == 0 { 1 } else { -1 };
                }
            }
            if coefficient != 0
            {
                scheme.push(ComponentGridInfo { levelvector: levelvector.clone(), coefficient });
            }
        }
        scheme
    }
}

#[test]
fn test_classical_scheme_2d()
{
    let mut combischeme = CombiScheme::new(2);
    let scheme = combischeme.combi_scheme(1, 3);
    assert_eq!(scheme.len(), 5);
    for grid in &scheme
    {
        let sum: u32 = grid.levelvector.iter().sum();
        if sum == 4
        {
            assert_eq!(grid.coefficient, 1);
        }
        else
        {
            assert_eq!(sum, 3);
            assert_eq!(grid.coefficient, -1);
        }
    }
    // the coefficients of a valid scheme always sum to one
    assert_eq!(scheme.iter().map(|g| g.coefficient).sum::<i32>(), 1);
}

#[test]
fn test_classical_scheme_lmin_equals_lmax()
{
    let mut combischeme = CombiScheme::new(3);
    let scheme = combischeme.combi_scheme(2, 2);
    assert_eq!(scheme.len(), 1);
    assert_eq!(scheme[0].levelvector, vec![2, 2, 2]);
    assert_eq!(scheme[0].coefficient, 1);
}

#[test]
fn test_adaptive_matches_classical()
{
    let mut classical = CombiScheme::new(3);
    let mut expected = classical.combi_scheme(1, 4);
    let mut adaptive = CombiScheme::new(3);
    adaptive.init_adaptive(1, 4);
    let mut scheme = adaptive.combi_scheme(1, 4);
    let key = |g: &ComponentGridInfo| g.levelvector.clone();
    expected.sort_by_key(key);
    scheme.sort_by_key(key);
    assert_eq!(expected, scheme);
}

#[test]
fn test_adaptive_promotion_preserves_coefficient_sum()
{
    let mut combischeme = CombiScheme::new(2);
    combischeme.init_adaptive(1, 2);
    let promote: Vec<Vec<u32>> = combischeme.active_indices().cloned().collect();
    for index in promote
    {
        combischeme.update_adaptive(&index);
        let scheme = combischeme.combi_scheme(1, 2);
        assert_eq!(scheme.iter().map(|g| g.coefficient).sum::<i32>(), 1);
    }
}
