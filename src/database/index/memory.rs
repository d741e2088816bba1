use super::CodeIndex;
use crate::{descriptor::Descriptor, itq::hasher::SmallCode};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// A code index held entirely in memory.
///
/// Descriptors within a bucket keep the order in which they were added.
pub struct MemoryCodeIndex {
    buckets: DashMap<SmallCode, Vec<Descriptor>>,
}

impl MemoryCodeIndex {
    /// Construct an empty [MemoryCodeIndex].
    pub fn new() -> Self {
        Self::default()
    }
}

impl CodeIndex for MemoryCodeIndex {
    fn add_many_descriptors(
        &mut self,
        entries: Vec<(SmallCode, Descriptor)>,
    ) -> anyhow::Result<()> {
        for (code, descriptor) in entries {
            self.buckets.entry(code).or_default().push(descriptor);
        }
        Ok(())
    }

    fn codes(&self) -> anyhow::Result<BTreeSet<SmallCode>> {
        Ok(self.buckets.iter().map(|bucket| *bucket.key()).collect())
    }

    fn get_descriptors(&self, code: SmallCode) -> anyhow::Result<Vec<Descriptor>> {
        Ok(self
            .buckets
            .get(&code)
            .map(|bucket| bucket.value().clone())
            .unwrap_or_default())
    }

    fn count(&self) -> anyhow::Result<usize> {
        Ok(self.buckets.iter().map(|bucket| bucket.value().len()).sum())
    }
}
