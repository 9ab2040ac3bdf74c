//! A lock-free (and optionally wait-free) concurrent hash map/set engine
//! with epoch-based safe memory reclamation.
//!
//! The public surface is two key-typed containers, [`Map<K, V>`] and
//! [`Set<K>`], each selecting a progress [`Guarantee`] at construction:
//!
//! - [`Guarantee::LockFree`] -- some thread among any set of concurrent
//!   callers always makes progress; an individual thread can be made to
//!   retry arbitrarily often by others winning races against it.
//! - [`Guarantee::WaitFree`] -- every write additionally completes within a
//!   bounded number of steps regardless of the scheduler, at the cost of an
//!   announce-and-help round on every write.
//!
//! Underneath both sits the same open-addressed, atomically migrating
//! bucket array (`store`) and epoch-based reclamation layer (`smr`) that do
//! the actual lock-free engineering; `map`/`set` just adapt a caller's key
//! type into the hash value (`hv`) the store indexes on.
//!
//! ```
//! use hatchet::{Guarantee, Map};
//!
//! let m: Map<String, u32> = Map::new(Guarantee::LockFree);
//! m.put(&"a".to_string(), 1);
//! assert_eq!(*m.get(&"a".to_string()).unwrap(), 1);
//! ```

mod error;
mod hv;
pub mod hash;
mod record;
mod smr;
mod store;
mod top;
mod lfm;
mod wfm;
mod view;
mod setops;
pub mod map;
pub mod set;

pub use hash::Key;
pub use hv::Hv;
pub use map::{Entry, Guarantee, Map, MapValue, Value};
pub use record::Item;
pub use set::Set;
pub use smr::Mmm;
pub use view::ViewEntry;
