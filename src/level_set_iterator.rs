///
/// Iterates over all level vectors `l` of a given dimension with
/// `l[d] >= lmin` for every dimension and `sum(l) == target`, i.e. one
/// diagonal of the combination scheme. Vectors are produced in
/// lexicographic order.
///
#[derive(Clone)]
pub struct FixedSumIterator
{
    lmin: u32,
    target: u32,
    head: Vec<u32>,
    first: bool,
    done: bool,
}

impl FixedSumIterator
{
    pub fn new(dim: usize, lmin: u32, target: u32) -> Self
    {
        assert!(dim > 0);
        let mut head = vec![lmin; dim];
        let mut done = false;
        let prefix = lmin * (dim as u32 - 1);
        if target >= prefix + lmin
        {
            head[dim - 1] = target - prefix;
        }
        else
        {
            done = true;
        }
        Self { lmin, target, head, first: true, done }
    }

    /// Advance the first `dim - 1` entries like an odometer; the last entry
    /// absorbs whatever sum remains.
    fn advance(&mut self) -> bool
    {
        let dim = self.head.len();
        if dim == 1
        {
            return false;
        }
        for d in (0..dim - 1).rev()
        {
            self.head[d] += 1;
            for entry in self.head.iter_mut().take(dim - 1).skip(d + 1)
            {
                *entry = self.lmin;
            }
            let prefix: u32 = self.head[..dim - 1].iter().sum();
            if prefix + self.lmin <= self.target
            {
                self.head[dim - 1] = self.target - prefix;
                return true;
            }
            self.head[d] = self.lmin;
        }
        false
    }
}

impl Iterator for FixedSumIterator
{
    type Item = Vec<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done
        {
            return None;
        }
        if self.first
        {
            self.first = false;
            return Some(self.head.clone());
        }
        if self.advance()
        {
            Some(self.head.clone())
        }
        else
        {
            self.done = true;
            None
        }
    }
}

#[test]
fn test_fixed_sum_iterator()
{
    let levels: Vec<Vec<u32>> = FixedSumIterator::new(2, 1, 4).collect();
    assert_eq!(levels, vec![vec![1, 3], vec![2, 2], vec![3, 1]]);
    let levels: Vec<Vec<u32>> = FixedSumIterator::new(2, 1, 3).collect();
    assert_eq!(levels, vec![vec![1, 2], vec![2, 1]]);
}

#[test]
fn test_fixed_sum_iterator_3d()
{
    let levels: Vec<Vec<u32>> = FixedSumIterator::new(3, 1, 5).collect();
    // compositions of 5 into 3 parts >= 1
    assert_eq!(levels.len(), 6);
    for level in &levels
    {
        assert_eq!(level.iter().sum::<u32>(), 5);
        assert!(level.iter().all(|&l| l >= 1));
    }
}

#[test]
fn test_fixed_sum_iterator_degenerate()
{
    // target below the minimum feasible sum yields nothing
    assert_eq!(FixedSumIterator::new(3, 2, 5).count(), 0);
    // one dimension yields exactly the target
    let levels: Vec<Vec<u32>> = FixedSumIterator::new(1, 1, 4).collect();
    assert_eq!(levels, vec![vec![4]]);
}
