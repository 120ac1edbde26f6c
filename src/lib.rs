//! Spatially adaptive numerical integration (and related grid operations)
//! via the sparse grid combination technique. The domain is decomposed into
//! refinable regions (boxes, per-dimension intervals or cells), each region
//! is evaluated over a scheme of anisotropic component grids, and the
//! regions with the largest error benefit are refined until a tolerance or
//! budget is met. Level bounds can additionally grow per dimension,
//! yielding a dimension-adaptive scheme.

pub mod combi_scheme;
pub mod engine;
pub mod errors;
pub mod function;
pub mod grids;
pub mod level_set_iterator;
pub mod operation;
pub mod refinement;
