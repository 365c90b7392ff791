//! CLI command implementations.

pub mod mglru;
pub mod parsers;
pub mod serve;
