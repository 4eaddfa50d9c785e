//! Sieve query: read-side include trees, order specs, limits and preload plans.

#![forbid(unsafe_code)]

pub mod includes;
pub mod limit;
pub mod orders;
pub mod preload;

pub use includes::{IncludeEntry, IncludeNode, Modifier};
pub use limit::{sanitize_limit, LimitPolicy};
pub use orders::{Direction, Nulls, OrderEntry, OrderSpec};
pub use preload::{preloadables, PreloadTree};
