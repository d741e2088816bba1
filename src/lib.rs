#![doc = include_str!("../README.md")]

/// Core implementation of an ITQ-backed similarity index.
pub mod database;
/// Descriptors stored in, and queried against, an index.
pub mod descriptor;
/// Distance metrics used to re-rank candidate descriptors.
pub mod distance;
/// Errors produced by the index.
pub mod error;
/// Learning and applying Iterative Quantization (ITQ) binary codes.
pub mod itq;

pub use database::core::{ItqIndex, ItqIndexOptions, TrainedState};
pub use database::index::{kv::KvCodeIndex, memory::MemoryCodeIndex, CodeIndex};
pub use descriptor::Descriptor;
pub use distance::DistanceMethod;
pub use error::{ItqError, Result};
pub use itq::hasher::{HashedVector, ItqHasher, SmallCode};
pub use itq::trainer::ItqTrainer;

/// The precision of a single component of an embedding vector.
pub type EmbeddingPrecision = f32;

/// A real-valued descriptor vector.
pub type Embedding = Vec<EmbeddingPrecision>;
