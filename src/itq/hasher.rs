use crate::{
    error::{ItqError, Result},
    Embedding, EmbeddingPrecision,
};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// A compact binary code derived from a descriptor vector.
///
/// A code of `b` bits is stored in the low `b` bits of the integer, with bit index 0 being the most significant.
pub type SmallCode = u64;

/// The largest supported code length, in bits.
pub const MAX_BIT_LENGTH: usize = SmallCode::BITS as usize;

/// Pack a bit vector into a [`SmallCode`], treating the first bit as the most significant.
///
/// # Arguments
///
/// * `bits` - A vector of zeroes and ones, at most [`MAX_BIT_LENGTH`] long.
///
/// # Returns
///
/// The integer whose binary representation is `bits`.
pub fn pack_bits(bits: &[u8]) -> SmallCode {
    bits.iter()
        .fold(0, |code, bit| (code << 1) | SmallCode::from(*bit != 0))
}

/// Unpack a [`SmallCode`] into its bit vector, most significant bit first.
///
/// # Arguments
///
/// * `code` - The code to unpack.
///
/// * `bit_length` - The number of bits in the code.
///
/// # Returns
///
/// The bits of `code`, as zeroes and ones.
pub fn unpack_bits(code: SmallCode, bit_length: usize) -> Vec<u8> {
    (0..bit_length)
        .rev()
        .map(|shift| ((code >> shift) & 1) as u8)
        .collect()
}

/// The number of differing bits between two codes.
pub fn hamming_distance(a: SmallCode, b: SmallCode) -> u32 {
    (a ^ b).count_ones()
}

#[derive(Debug, Clone, PartialEq)]
/// A descriptor vector along with its binary hash.
pub struct HashedVector {
    /// The vector that was hashed, as given.
    pub vector: Embedding,
    /// The bits of the code, most significant first. Each entry is zero or one.
    pub bits: Vec<u8>,
    /// The bits packed into an integer.
    pub code: SmallCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Maps descriptor vectors to binary codes by centering them, projecting them with a learned rotation, and thresholding at zero.
///
/// The mean vector and rotation are learned together by an [`ItqTrainer`](crate::itq::trainer::ItqTrainer) and are only ever valid as a pair.
pub struct ItqHasher {
    mean: DVector<f64>,
    rotation: DMatrix<f64>,
}

impl ItqHasher {
    /// Construct an [ItqHasher] from a learned mean vector and rotation.
    ///
    /// # Arguments
    ///
    /// * `mean` - The `D`-dimensional mean of the training vectors.
    ///
    /// * `rotation` - The `D`×`b` matrix fusing the PCA projection with the ITQ rotation.
    ///
    /// # Returns
    ///
    /// An [ItqHasher], or an error if the shapes of `mean` and `rotation` disagree or the code would be too wide.
    pub fn new(mean: DVector<f64>, rotation: DMatrix<f64>) -> Result<Self> {
        if mean.len() != rotation.nrows() {
            return Err(ItqError::Input(format!(
                "mean vector has {} dimensions but rotation expects {}",
                mean.len(),
                rotation.nrows()
            )));
        }
        if rotation.ncols() == 0 || rotation.ncols() > MAX_BIT_LENGTH {
            return Err(ItqError::Input(format!(
                "rotation produces {} bits, expected between 1 and {}",
                rotation.ncols(),
                MAX_BIT_LENGTH
            )));
        }
        Ok(Self { mean, rotation })
    }

    /// The mean vector subtracted from every descriptor before hashing.
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    /// The fused projection and rotation matrix.
    pub fn rotation(&self) -> &DMatrix<f64> {
        &self.rotation
    }

    /// The dimension of the vectors this hasher accepts.
    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    /// The number of bits in the codes this hasher produces.
    pub fn bit_length(&self) -> usize {
        self.rotation.ncols()
    }

    fn check_vector(&self, vector: &[EmbeddingPrecision]) -> Result<()> {
        if vector.len() != self.dimension() {
            return Err(ItqError::Input(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimension()
            )));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(ItqError::Input(
                "vector has non-finite components".to_owned(),
            ));
        }
        Ok(())
    }

    fn bits(&self, vector: &[EmbeddingPrecision]) -> Vec<u8> {
        let centered = DVector::from_iterator(
            self.dimension(),
            vector
                .iter()
                .zip(self.mean.iter())
                .map(|(x, mean)| f64::from(*x) - mean),
        );
        self.rotation
            .column_iter()
            .map(|column| u8::from(column.dot(&centered) >= 0.0))
            .collect()
    }

    /// Compute the small code of a vector.
    ///
    /// # Arguments
    ///
    /// * `vector` - The vector to hash.
    ///
    /// # Returns
    ///
    /// The code of `vector`, or an error if its dimension does not match the hasher's or it has non-finite components.
    pub fn small_code(&self, vector: &[EmbeddingPrecision]) -> Result<SmallCode> {
        self.check_vector(vector)?;
        Ok(pack_bits(&self.bits(vector)))
    }

    /// Hash a vector.
    ///
    /// # Arguments
    ///
    /// * `vector` - The vector to hash.
    ///
    /// # Returns
    ///
    /// The vector, its bit vector, and its packed code.
    pub fn encode(&self, vector: &[EmbeddingPrecision]) -> Result<HashedVector> {
        self.check_vector(vector)?;
        let bits = self.bits(vector);
        let code = pack_bits(&bits);
        Ok(HashedVector {
            vector: vector.to_vec(),
            bits,
            code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_zero_is_most_significant() {
        assert_eq!(pack_bits(&[1, 0, 0, 0]), 0b1000);
        assert_eq!(pack_bits(&[0, 0, 0, 1]), 0b0001);
        assert_eq!(pack_bits(&[1, 1, 0, 1]), 0b1101);
        assert_eq!(pack_bits(&[]), 0);
        assert_eq!(unpack_bits(0b1101, 4), vec![1, 1, 0, 1]);
        assert_eq!(unpack_bits(0b1, 3), vec![0, 0, 1]);
    }

    #[test]
    fn full_width_codes_pack() {
        let bits = vec![1; MAX_BIT_LENGTH];
        assert_eq!(pack_bits(&bits), SmallCode::MAX);
        assert_eq!(unpack_bits(SmallCode::MAX, MAX_BIT_LENGTH), bits);
    }

    #[test]
    fn hamming() {
        assert_eq!(hamming_distance(0b1010, 0b1010), 0);
        assert_eq!(hamming_distance(0b1010, 0b0101), 4);
        assert_eq!(hamming_distance(0, SmallCode::MAX), 64);
    }

    fn axis_hasher() -> ItqHasher {
        // Identity projection onto both axes, centred at (1, 1).
        ItqHasher::new(
            DVector::from_vec(vec![1.0, 1.0]),
            DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]),
        )
        .unwrap()
    }

    #[test]
    fn encode_thresholds_at_zero() {
        let hasher = axis_hasher();
        let hashed = hasher.encode(&[2.0, 0.0]).unwrap();
        assert_eq!(hashed.vector, vec![2.0, 0.0]);
        assert_eq!(hashed.bits, vec![1, 0]);
        assert_eq!(hashed.code, 0b10);
        // Exactly on the boundary counts as a one.
        assert_eq!(hasher.small_code(&[1.0, 1.0]).unwrap(), 0b11);
        assert_eq!(hasher.small_code(&[0.0, 0.0]).unwrap(), 0b00);
    }

    #[test]
    fn encode_rejects_wrong_dimension() {
        let hasher = axis_hasher();
        assert!(matches!(
            hasher.encode(&[1.0, 2.0, 3.0]),
            Err(ItqError::Input(_))
        ));
    }

    #[test]
    fn encode_rejects_non_finite_components() {
        let hasher = axis_hasher();
        for vector in [
            [f32::NAN, 0.0],
            [0.0, f32::INFINITY],
            [f32::NEG_INFINITY, 1.0],
        ] {
            assert!(matches!(hasher.encode(&vector), Err(ItqError::Input(_))));
            assert!(matches!(hasher.small_code(&vector), Err(ItqError::Input(_))));
        }
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        assert!(ItqHasher::new(DVector::zeros(3), DMatrix::zeros(2, 4)).is_err());
        assert!(ItqHasher::new(DVector::zeros(2), DMatrix::zeros(2, 0)).is_err());
        assert!(ItqHasher::new(DVector::zeros(2), DMatrix::zeros(2, 65)).is_err());
    }
}
