//! Auth-domain identifiers, pre-trust claims, and secret wrappers.

pub mod claims;
pub mod id;
pub mod secret;

pub use claims::*;
pub use id::*;
pub use secret::*;
