//! Root certificate authority and the per-host leaf certificate cache.

pub mod authority;
pub mod cache;

pub use authority::{CaError, LeafCertificate, RootCa};
pub use cache::CertCache;
