//! Key handling, the payload cipher, and the digest primitives behind record
//! stamps. Each submodule keeps to a single responsibility.

pub mod cipher;
pub mod integrity;
pub mod keys;
