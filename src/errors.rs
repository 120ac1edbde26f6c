use std::fmt::Display;

#[derive(Clone, Debug, PartialEq)]
pub enum CombiError
{
    EmptyDomain,
    DegenerateRegion
    {
        dim: usize,
        start: f64,
        end: f64,
    },
    InvalidLevelBounds
    {
        lmin: u32,
        lmax: u32,
    },
    DimensionMismatch,
    /// Partition-of-unity failure: the coefficients of all component grids
    /// sharing `point` do not sum to one. Always a defect in the
    /// scheme/decomposition interaction, never a runtime condition.
    CoefficientSumViolation
    {
        point: Vec<f64>,
        coefficient_sum: i32,
    },
}
impl std::error::Error for CombiError {}

impl Display for CombiError
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", *self)
    }
}
