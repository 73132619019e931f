//! The global registry mapping thread identity to LSA, and the LSA
//! descriptor itself.

pub mod lsa;
pub mod registry;

use lazy_static::lazy_static;

pub use lsa::Lsa;
pub use registry::Registry;

lazy_static! {
    /// The process-wide registry. Survives for the process's life, as the
    /// specification requires.
    pub static ref REGISTRY: Registry = Registry::new();
}
