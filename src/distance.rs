use crate::{error::ItqError, Embedding, EmbeddingPrecision};
use distances::vectors::euclidean;
use serde::{Deserialize, Serialize};
use simsimd::SpatialSimilarity;
use space::Metric;
use std::{fmt, str::FromStr};

/// The data type representing the distance between two embeddings.
///
/// Distances are non-negative, so the bits of the underlying floating-point value order the same way as the value itself.
pub type DistanceUnit = u64;

fn to_unit(distance: EmbeddingPrecision) -> DistanceUnit {
    distance.max(0.0).to_bits().into()
}

/// Recover the distance encoded in a [`DistanceUnit`].
pub fn from_unit(unit: DistanceUnit) -> EmbeddingPrecision {
    EmbeddingPrecision::from_bits(unit as u32)
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
/// The L2 distance metric.
pub struct L2Distance;

impl Metric<Embedding> for L2Distance {
    type Unit = DistanceUnit;
    fn distance(&self, a: &Embedding, b: &Embedding) -> Self::Unit {
        let l2_distance: f32 = euclidean(a.as_slice(), b.as_slice());
        to_unit(l2_distance)
    }
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
/// The cosine distance metric; one minus the cosine similarity of two embeddings.
///
/// Distances below [`f32::EPSILON`] are reported as zero, as `distances::vectors::cosine` does, so a vector is always exactly zero from itself.
pub struct CosineDistance;

impl Metric<Embedding> for CosineDistance {
    type Unit = DistanceUnit;
    fn distance(&self, a: &Embedding, b: &Embedding) -> Self::Unit {
        // The vectorised kernel leaves identical vectors a rounding error above zero.
        if a == b {
            return to_unit(0.0);
        }
        let cosine_distance = EmbeddingPrecision::cosine(a, b)
            .map_or(EmbeddingPrecision::INFINITY, |x| x as EmbeddingPrecision);
        if cosine_distance < EmbeddingPrecision::EPSILON {
            return to_unit(0.0);
        }
        to_unit(cosine_distance)
    }
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
/// The histogram intersection distance metric.
///
/// Both embeddings are treated as histograms and L1-normalised, so the distance lies in `[0, 1]`; an all-zero histogram intersects nothing.
pub struct HistogramIntersectionDistance;

impl Metric<Embedding> for HistogramIntersectionDistance {
    type Unit = DistanceUnit;
    fn distance(&self, a: &Embedding, b: &Embedding) -> Self::Unit {
        let a_mass: EmbeddingPrecision = a.iter().map(|x| x.abs()).sum();
        let b_mass: EmbeddingPrecision = b.iter().map(|x| x.abs()).sum();
        if a_mass == 0.0 || b_mass == 0.0 {
            return to_unit(1.0);
        }
        let intersection: EmbeddingPrecision = a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| (x.abs() / a_mass).min(y.abs() / b_mass))
            .sum();
        to_unit(1.0 - intersection)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
/// The distance metric used to exactly re-rank candidates found through their binary codes.
///
/// Methods are named by a label (`euclidean`, `cosine`, or `hik`), which is also how they are persisted.
pub enum DistanceMethod {
    /// Euclidean (L2) distance.
    Euclidean,
    /// One minus the cosine similarity.
    #[default]
    Cosine,
    /// Histogram intersection distance.
    Hik,
}

impl DistanceMethod {
    /// Every label accepted by [`DistanceMethod::from_str`].
    pub const LABELS: [&'static str; 3] = ["euclidean", "cosine", "hik"];

    /// The label naming this distance method.
    pub fn label(&self) -> &'static str {
        match self {
            DistanceMethod::Euclidean => "euclidean",
            DistanceMethod::Cosine => "cosine",
            DistanceMethod::Hik => "hik",
        }
    }

    /// Calculate the distance between two embeddings.
    ///
    /// # Arguments
    ///
    /// * `a` - The first embedding.
    ///
    /// * `b` - The second embedding.
    ///
    /// # Returns
    ///
    /// The distance between `a` and `b` under this method.
    pub fn distance_between(&self, a: &Embedding, b: &Embedding) -> EmbeddingPrecision {
        from_unit(self.distance(a, b))
    }
}

impl Metric<Embedding> for DistanceMethod {
    type Unit = DistanceUnit;
    fn distance(&self, a: &Embedding, b: &Embedding) -> Self::Unit {
        match self {
            DistanceMethod::Euclidean => L2Distance.distance(a, b),
            DistanceMethod::Cosine => CosineDistance.distance(a, b),
            DistanceMethod::Hik => HistogramIntersectionDistance.distance(a, b),
        }
    }
}

impl FromStr for DistanceMethod {
    type Err = ItqError;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        match label {
            "euclidean" => Ok(DistanceMethod::Euclidean),
            "cosine" => Ok(DistanceMethod::Cosine),
            "hik" => Ok(DistanceMethod::Hik),
            _ => Err(ItqError::Config(format!(
                "invalid distance method label '{}', must be one of {:?}",
                label,
                Self::LABELS
            ))),
        }
    }
}

impl TryFrom<String> for DistanceMethod {
    type Error = ItqError;

    fn try_from(label: String) -> Result<Self, Self::Error> {
        label.parse()
    }
}

impl From<DistanceMethod> for String {
    fn from(method: DistanceMethod) -> Self {
        method.label().to_owned()
    }
}

impl fmt::Display for DistanceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
