/// Endianness markers and the `Endian`/`Endianness` conversion traits.
pub mod endian;
/// Endian-tagged fixed-width integer wrappers (`U16`, `U32`, `U64`, ...).
pub mod number;
