use crate::Embedding;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A descriptor: a real-valued vector describing one data item, along with a stable unique identifier.
///
/// Descriptors are never mutated once created; an index only reads them.
pub struct Descriptor {
    id: Uuid,
    vector: Embedding,
}

impl Descriptor {
    /// Create a descriptor with a freshly generated identifier.
    ///
    /// # Arguments
    ///
    /// * `vector` - The descriptor vector.
    ///
    /// # Returns
    ///
    /// A descriptor identified by a new UUID.
    pub fn new(vector: Embedding) -> Self {
        Self::with_id(Uuid::now_v7(), vector)
    }

    /// Create a descriptor with a caller-provided identifier.
    ///
    /// # Arguments
    ///
    /// * `id` - The identifier of the descriptor.
    ///
    /// * `vector` - The descriptor vector.
    ///
    /// # Returns
    ///
    /// A descriptor identified by `id`.
    pub fn with_id(id: Uuid, vector: Embedding) -> Self {
        Self { id, vector }
    }

    /// The identifier of this descriptor.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The vector of this descriptor.
    pub fn vector(&self) -> &Embedding {
        &self.vector
    }

    /// The number of dimensions of this descriptor's vector.
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}
