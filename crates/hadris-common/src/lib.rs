/// Shared little/big-endian numeric wrapper types.
pub mod types;
