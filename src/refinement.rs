pub mod cell;
pub mod container;
pub mod extend_split;
pub mod single_dimension;
