//! Calendar store backed by an external provider binary.

pub mod protocol;
pub mod provider;

pub use provider::{Provider, ProviderStore};
