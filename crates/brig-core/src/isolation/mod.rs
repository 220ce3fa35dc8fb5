//! Linux isolation primitives
//!
//! This module contains the jail building blocks:
//! - `clone3` - clone3 syscall for namespace duplication
//! - `namespace` - namespace set and the outer/inner split
//! - `mounts` - tmpfs, bind, proc, dev mounts and bulk unmounting
//! - `identity` - uid/gid resolution and privilege drop
//! - `limits` - rlimit resource envelope for payloads

pub mod clone3;
pub mod identity;
pub mod limits;
pub mod mounts;
pub mod namespace;

pub use self::identity::Identity;
pub use self::limits::ResourceEnvelope;
pub use self::namespace::{NamespaceSet, Split};
