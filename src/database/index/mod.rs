use crate::{descriptor::Descriptor, itq::hasher::SmallCode};
use std::collections::BTreeSet;

/// A persistent code index backed by a [`fjall`] keyspace.
pub mod kv;
/// An in-memory code index.
pub mod memory;

/// A hash table from small codes to the descriptors sharing each code.
///
/// Many descriptors sharing one code is the expected case; that is how codes compress the corpus.
pub trait CodeIndex: Send + Sync {
    /// Add code-descriptor pairs to the index.
    ///
    /// # Arguments
    ///
    /// * `entries` - The descriptors to add, each with its code.
    fn add_many_descriptors(&mut self, entries: Vec<(SmallCode, Descriptor)>)
        -> anyhow::Result<()>;

    /// The distinct codes with at least one descriptor.
    fn codes(&self) -> anyhow::Result<BTreeSet<SmallCode>>;

    /// The descriptors sharing a code.
    ///
    /// # Arguments
    ///
    /// * `code` - The code to look up.
    ///
    /// # Returns
    ///
    /// Every descriptor with the code `code`, in an order that does not change while the index is unmodified. Empty if the code is not populated.
    fn get_descriptors(&self, code: SmallCode) -> anyhow::Result<Vec<Descriptor>>;

    /// The total number of descriptors across all codes.
    fn count(&self) -> anyhow::Result<usize>;

    /// Permanently remove whatever storage this index holds outside of memory.
    ///
    /// Called once an index has been superseded by a rebuild and is no longer reachable, or when populating it failed.
    fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
