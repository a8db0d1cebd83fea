// holdfast-common: shared types for the Holdfast workspace

pub mod si;
pub mod types;
