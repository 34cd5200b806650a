//! Shared scalar aliases used across the ingestion core.

/// A linear memory address as seen by the traced process.
pub type Address = u64;

/// Tracer-assigned thread identifier.
pub type ThreadId = u64;

/// Distinguishes self-modified variants of the block at a given address.
pub type BlockId = u32;

/// Dense index into a per-thread graph's node array.
pub type NodeIndex = usize;
