#![deny(unsafe_op_in_unsafe_fn)]

//! A lock-free, dynamically growable vector with a combining funnel.
//!
//! The base algorithm is the descriptor-protocol vector of Dechev, Pirkelbauer
//! and Stroustrup (https://www.stroustrup.com/lock-free-vector.pdf): storage is
//! a directory of geometrically growing buckets that are never moved once
//! allocated, and every size change is a single CAS on a shared descriptor
//! whose deferred write any thread can complete. On top of that sits the
//! combining optimization of Walulya and Tsigas: pushes that lose the
//! descriptor CAS park their requests in a bounded queue, and one drain pass
//! applies the whole batch with a single descriptor swap.
//!
//! Memory reclamation is epoch-based, via [`crossbeam_epoch`].

// descriptor protocol internals
mod batch;
mod buckets;
mod descriptor;
mod errors;
mod thread_info;

// the vector itself
mod vector;

pub use errors::{AccessError, WriteError, WriteFailure};
pub use vector::LockFreeVector;
