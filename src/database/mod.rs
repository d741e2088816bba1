/// Core implementation of an index.
pub mod core;
/// Implementations of the hash tables mapping codes to descriptors.
pub mod index;
/// Saving and loading trained index state.
pub mod persistence;
