use super::hasher::{ItqHasher, SmallCode};
use crate::{
    database::core::ItqIndexOptions,
    descriptor::Descriptor,
    error::{ItqError, Result},
};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use std::time::Instant;
use tracing::{debug, info};

/// The outcome of a training pass.
pub struct TrainingOutput {
    /// The learned mean vector and fused rotation.
    pub hasher: ItqHasher,
    /// The code assigned to each training descriptor, in the order the descriptors were given.
    pub codes: Vec<SmallCode>,
}

/// Learns an [`ItqHasher`] from a corpus of descriptors.
///
/// Training centres the corpus, projects it onto its top principal components, then searches for the rotation of that projection which best survives binarisation.
#[derive(Debug, Clone)]
pub struct ItqTrainer {
    bit_length: usize,
    iterations: usize,
    random_seed: Option<u64>,
}

fn timed<T>(stage: &str, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let result = f();
    info!("{} in {:?}", stage, start.elapsed());
    result
}

impl ItqTrainer {
    /// Construct a new [ItqTrainer].
    ///
    /// # Arguments
    ///
    /// * `options` - The index options providing the bit length, iteration count, and random seed.
    ///
    /// # Returns
    ///
    /// An [ItqTrainer], or a configuration error if `options` are invalid.
    pub fn new(options: &ItqIndexOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            bit_length: options.bit_length,
            iterations: options.itq_iterations,
            random_seed: options.random_seed,
        })
    }

    fn data_matrix(descriptors: &[Descriptor]) -> Result<DMatrix<f64>> {
        let Some(first) = descriptors.first() else {
            return Err(ItqError::Input("no descriptors given".to_owned()));
        };
        let dimension = first.dimension();
        if dimension == 0 {
            return Err(ItqError::Input(
                "descriptors must have at least one dimension".to_owned(),
            ));
        }
        for descriptor in descriptors {
            if descriptor.dimension() != dimension {
                return Err(ItqError::Input(format!(
                    "descriptor {} has {} dimensions, expected {}",
                    descriptor.id(),
                    descriptor.dimension(),
                    dimension
                )));
            }
            if descriptor.vector().iter().any(|x| !x.is_finite()) {
                return Err(ItqError::Input(format!(
                    "descriptor {} has non-finite components",
                    descriptor.id()
                )));
            }
        }
        Ok(DMatrix::from_fn(descriptors.len(), dimension, |i, j| {
            f64::from(descriptors[i].vector()[j])
        }))
    }

    /// Centre the data and project it onto its top `bit_length` principal components.
    ///
    /// If there are fewer dimensions than bits, the projection is padded with zero columns.
    fn principal_components(
        &self,
        data: &DMatrix<f64>,
    ) -> (DVector<f64>, DMatrix<f64>, DMatrix<f64>) {
        let (n, dimension) = data.shape();
        let mean = DVector::from_iterator(dimension, data.column_iter().map(|c| c.mean()));
        let centered = DMatrix::from_fn(n, dimension, |i, j| data[(i, j)] - mean[j]);

        debug!("covariance of {} x {} data", n, dimension);
        let covariance = centered.tr_mul(&centered) / (n.max(2) - 1) as f64;

        // The covariance is symmetric, so its eigenpairs are real.
        let eigen = SymmetricEigen::new(covariance);
        let mut order: Vec<usize> = (0..dimension).collect();
        order.sort_by(|a, b| eigen.eigenvalues[*b].total_cmp(&eigen.eigenvalues[*a]));

        let components = DMatrix::from_fn(dimension, self.bit_length, |i, j| {
            order
                .get(j)
                .map_or(0.0, |&column| eigen.eigenvectors[(i, column)])
        });
        let projected = &centered * &components;
        (mean, components, projected)
    }

    fn random_rotation<R: Rng>(&self, rng: &mut R) -> Result<DMatrix<f64>> {
        let gaussian = DMatrix::from_fn(self.bit_length, self.bit_length, |_, _| {
            rng.sample::<f64, _>(StandardNormal)
        });
        gaussian.svd(true, false).u.ok_or_else(|| {
            ItqError::Input("unable to orthonormalise the initial rotation".to_owned())
        })
    }

    /// Find the rotation of the projected data that minimises its quantisation error.
    ///
    /// Each iteration binarises the rotated data, then solves the orthogonal Procrustes problem aligning the projection to its own binarisation.
    fn find_rotation(&self, projected: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let mut rng = match self.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut rotation = self.random_rotation(&mut rng)?;

        debug!(
            "ITQ iterations to determine optimal rotation: {}",
            self.iterations
        );
        for iteration in 0..self.iterations {
            let rotated = projected * &rotation;
            let quantized = rotated.map(|x| if x >= 0.0 { 1.0 } else { -1.0 });
            debug!(
                "ITQ iteration {}, quantisation loss {}",
                iteration + 1,
                (&quantized - &rotated).norm_squared()
            );

            let correlation = quantized.tr_mul(projected);
            let svd = correlation.svd(true, true);
            let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
                return Err(ItqError::Input(format!(
                    "singular value decomposition failed in ITQ iteration {}",
                    iteration + 1
                )));
            };
            rotation = v_t.transpose() * u.transpose();
        }
        Ok(rotation)
    }

    /// Learn a hasher from a corpus of descriptors.
    ///
    /// # Arguments
    ///
    /// * `descriptors` - The training corpus. All descriptors must share one dimension.
    ///
    /// # Returns
    ///
    /// The learned hasher and the code of each training descriptor.
    pub fn train(&self, descriptors: &[Descriptor]) -> Result<TrainingOutput> {
        debug!("Using {} length bit-vectors", self.bit_length);
        let data = timed("Created descriptor matrix", || {
            Self::data_matrix(descriptors)
        })?;
        let (mean, components, projected) = timed("Computed PCA transformation", || {
            self.principal_components(&data)
        });
        let rotation = timed("Performed ITQ to find optimal rotation", || {
            self.find_rotation(&projected)
        })?;

        // Fuse the projection and rotation so that hashing needs a single product.
        let hasher = ItqHasher::new(mean, &components * &rotation)?;

        let codes = timed("Computed small codes", || {
            descriptors
                .par_iter()
                .map(|descriptor| hasher.small_code(descriptor.vector()))
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(TrainingOutput { hasher, codes })
    }
}
