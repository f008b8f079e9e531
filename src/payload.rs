//! Block payloads: the signable envelope and the known payload kinds

pub mod types;

pub use types::*;
