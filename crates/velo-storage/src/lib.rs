pub mod cache;
pub mod fjall;
pub mod keys;
pub mod mem;
pub mod traits;
pub mod types;

pub use cache::LogCache;
pub use fjall::{FjallBikeStore, FjallLogStore};
pub use mem::{MemBikeStore, MemLogStore};
pub use traits::{BikeStore, LogStore};
pub use types::{ComponentRow, DeadLetter};
