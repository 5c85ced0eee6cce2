//! Configuration module for transformer architecture descriptions.

mod arch;

pub use arch::{Activation, ArchConfig, AttentionKind, Compat, PositionalEncoding};
