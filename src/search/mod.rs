//! Query execution: the beam engine, its frontier pool, and the range and
//! iterator drivers layered on top of it.

pub mod beam;
pub mod iter;
pub mod pool;
pub mod range;

pub use beam::SearchOptions;
pub use iter::IteratorWorkspace;
