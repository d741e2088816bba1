use super::{index::memory::MemoryCodeIndex, index::CodeIndex, persistence};
use crate::{
    descriptor::Descriptor,
    distance::{from_unit, DistanceMethod, DistanceUnit},
    error::{ItqError, Result},
    itq::{
        hasher::{hamming_distance, HashedVector, ItqHasher, SmallCode, MAX_BIT_LENGTH},
        trainer::{ItqTrainer, TrainingOutput},
    },
    EmbeddingPrecision,
};
use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use rayon::{
    iter::{IntoParallelIterator, ParallelIterator},
    slice::ParallelSliceMut,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use space::Metric;
use std::{
    collections::{BTreeSet, BinaryHeap},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Creation options for an [`ItqIndex`].
pub struct ItqIndexOptions {
    /// The number of bits in each descriptor's code, between 1 and 64. Longer codes separate descriptors into more buckets, making candidate retrieval more selective.
    pub bit_length: usize,
    /// The number of iterations spent refining the rotation during training; 50 is usually enough.
    pub itq_iterations: usize,
    /// The distance metric used to re-rank candidates.
    pub distance_method: DistanceMethod,
    /// A seed for the random initial rotation. Training is only reproducible when this is set.
    pub random_seed: Option<u64>,
}

impl Default for ItqIndexOptions {
    fn default() -> Self {
        Self {
            bit_length: 8,
            itq_iterations: 50,
            distance_method: DistanceMethod::default(),
            random_seed: None,
        }
    }
}

impl ItqIndexOptions {
    /// Check that these options describe a valid index.
    ///
    /// # Returns
    ///
    /// A configuration error if the bit length or iteration count is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.bit_length == 0 || self.bit_length > MAX_BIT_LENGTH {
            return Err(ItqError::Config(format!(
                "bit length must be between 1 and {}, got {}",
                MAX_BIT_LENGTH, self.bit_length
            )));
        }
        if self.itq_iterations == 0 {
            return Err(ItqError::Config(
                "ITQ iteration count must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Select the `n` codes nearest to `target` in Hamming distance, nearest first.
///
/// Codes equally distant from `target` are ordered by value.
///
/// # Arguments
///
/// * `codes` - The codes to choose from.
///
/// * `target` - The code to measure distances from.
///
/// * `n` - The number of codes to select.
///
/// # Returns
///
/// At most `n` codes from `codes`, in ascending order of distance from `target`.
pub fn nearest_codes(codes: &BTreeSet<SmallCode>, target: SmallCode, n: usize) -> Vec<SmallCode> {
    let mut heap = BinaryHeap::with_capacity(n.min(codes.len()).saturating_add(1));
    for &code in codes {
        heap.push((hamming_distance(target, code), code));
        if heap.len() > n {
            heap.pop();
        }
    }
    heap.into_sorted_vec()
        .into_iter()
        .map(|(_, code)| code)
        .collect()
}

/// Everything produced by one successful training pass: the options it ran with, the learned hasher, and the populated code index.
///
/// A trained state is never modified once built; rebuilding an index replaces it wholesale.
/// A state replaced by a rebuild destroys its code index once the last snapshot of it is dropped.
pub struct TrainedState<I: CodeIndex> {
    options: ItqIndexOptions,
    hasher: ItqHasher,
    code_index: I,
    superseded: AtomicBool,
}

impl<I: CodeIndex> Drop for TrainedState<I> {
    fn drop(&mut self) {
        if self.superseded.load(Ordering::Acquire) {
            if let Err(e) = self.code_index.destroy() {
                warn!("Unable to remove superseded code index: {}", e);
            }
        }
    }
}

impl<I: CodeIndex> TrainedState<I> {
    pub(crate) fn new(options: ItqIndexOptions, hasher: ItqHasher, code_index: I) -> Self {
        Self {
            options,
            hasher,
            code_index,
            superseded: AtomicBool::new(false),
        }
    }

    /// The options this state was trained with.
    pub fn options(&self) -> &ItqIndexOptions {
        &self.options
    }

    /// The learned hasher.
    pub fn hasher(&self) -> &ItqHasher {
        &self.hasher
    }

    /// The code index populated by training.
    pub fn code_index(&self) -> &I {
        &self.code_index
    }

    /// Perform an approximate *n* nearest neighbours search.
    ///
    /// The codes nearest to the query's code are visited in order of Hamming distance, collecting their descriptors until at least `n` are found, then those candidates are re-ranked by exact distance.
    /// Only the `n` nearest codes are ever visited, so if they hold fewer than `n` descriptors, fewer results are returned, and true neighbours in further codes can be missed.
    ///
    /// # Arguments
    ///
    /// * `query` - The query vector.
    ///
    /// * `n` - The number of approximate neighbours to return.
    ///
    /// # Returns
    ///
    /// Up to `n` descriptors with their distances from `query`, nearest first.
    pub fn nn(
        &self,
        query: &[EmbeddingPrecision],
        n: usize,
    ) -> Result<Vec<(Descriptor, EmbeddingPrecision)>> {
        if n == 0 {
            return Err(ItqError::Input(
                "number of neighbours must be greater than zero".to_owned(),
            ));
        }
        let total = self.code_index.count()?;
        if total == 0 {
            return Err(ItqError::EmptyIndex);
        }
        let HashedVector { vector, code, .. } = self.hasher.encode(query)?;

        let near_codes = nearest_codes(&self.code_index.codes()?, code, n);
        let termination_count = n.min(total);
        let mut candidates = Vec::new();
        for near_code in near_codes.iter() {
            candidates.extend(self.code_index.get_descriptors(*near_code)?);
            // Descriptors from more distant codes are unlikely to be any closer.
            if candidates.len() >= termination_count {
                break;
            }
        }
        debug!(
            "{} candidates from {} nearest codes to {:#x}",
            candidates.len(),
            near_codes.len(),
            code
        );

        let metric = self.options.distance_method;
        let mut sorted_candidates: Vec<(Descriptor, DistanceUnit)> = candidates
            .into_par_iter()
            .map(|candidate| {
                let distance = metric.distance(&vector, candidate.vector());
                (candidate, distance)
            })
            .collect();
        sorted_candidates
            .par_sort_unstable_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.id().cmp(&b.0.id())));
        Ok(sorted_candidates
            .into_iter()
            .take(n)
            .map(|(descriptor, distance)| (descriptor, from_unit(distance)))
            .collect())
    }
}

/// A similarity index over descriptors, searched through binary codes learned with Iterative Quantization (ITQ).
///
/// Training publishes a complete [`TrainedState`] at once, so queries running alongside a rebuild see either the old state or the new one, never a mixture.
///
/// # Arguments
///
/// * `I` - The code index holding descriptors by code. A fresh one is created for every training pass.
pub struct ItqIndex<I: CodeIndex = MemoryCodeIndex> {
    options: RwLock<ItqIndexOptions>,
    state: ArcSwapOption<TrainedState<I>>,
    factory: Box<dyn Fn() -> anyhow::Result<I> + Send + Sync>,
    writer: Mutex<()>,
}

impl ItqIndex<MemoryCodeIndex> {
    /// Construct an untrained [ItqIndex] that keeps its code index in memory.
    ///
    /// # Arguments
    ///
    /// * `options` - The creation options for the index.
    ///
    /// # Returns
    ///
    /// An [ItqIndex], or a configuration error if `options` are invalid.
    pub fn new(options: ItqIndexOptions) -> Result<Self> {
        Self::with_code_index(options, || Ok(MemoryCodeIndex::new()))
    }
}

impl<I: CodeIndex> ItqIndex<I> {
    /// Construct an untrained [ItqIndex] with a custom code index.
    ///
    /// # Arguments
    ///
    /// * `options` - The creation options for the index.
    ///
    /// * `factory` - Produces an empty code index; called once per training pass.
    ///
    /// # Returns
    ///
    /// An [ItqIndex], or a configuration error if `options` are invalid.
    pub fn with_code_index<F>(options: ItqIndexOptions, factory: F) -> Result<Self>
    where
        F: Fn() -> anyhow::Result<I> + Send + Sync + 'static,
    {
        options.validate()?;
        Ok(Self {
            options: RwLock::new(options),
            state: ArcSwapOption::empty(),
            factory: Box::new(factory),
            writer: Mutex::new(()),
        })
    }

    /// The options the next training pass will use.
    ///
    /// Loading a saved index replaces these with the saved options.
    pub fn options(&self) -> ItqIndexOptions {
        *self.options.read()
    }

    /// The current trained state, if any.
    ///
    /// The returned state stays valid, and unchanged, even if the index is rebuilt or reset afterwards.
    pub fn snapshot(&self) -> Option<Arc<TrainedState<I>>> {
        self.state.load_full()
    }

    /// Whether or not a training pass or load has succeeded.
    pub fn is_trained(&self) -> bool {
        self.state.load().is_some()
    }

    /// The number of descriptors in the index.
    ///
    /// # Returns
    ///
    /// The number of indexed descriptors, zero if the index has not been built.
    pub fn count(&self) -> Result<usize> {
        match self.snapshot() {
            Some(state) => Ok(state.code_index.count()?),
            None => Ok(0),
        }
    }

    /// Build the index over a corpus of descriptors, replacing anything previously indexed.
    ///
    /// If training fails, the previous state is left untouched.
    ///
    /// # Arguments
    ///
    /// * `descriptors` - The descriptors to index. There must be at least one, and all must share one dimension.
    pub fn build_index(&self, descriptors: impl IntoIterator<Item = Descriptor>) -> Result<()> {
        let _writer = self.writer.lock();
        let options = self.options();
        let start = Instant::now();
        let descriptors: Vec<Descriptor> = descriptors.into_iter().collect();
        let number_of_descriptors = descriptors.len();

        let TrainingOutput { hasher, codes } = ItqTrainer::new(&options)?.train(&descriptors)?;

        let build_start = Instant::now();
        let mut code_index = (self.factory)()?;
        if let Err(e) =
            code_index.add_many_descriptors(codes.into_iter().zip(descriptors).collect())
        {
            if let Err(destroy_error) = code_index.destroy() {
                warn!("Unable to remove partial code index: {}", destroy_error);
            }
            return Err(e.into());
        }
        info!("Populated code index in {:?}", build_start.elapsed());

        let previous = self.state.swap(Some(Arc::new(TrainedState::new(
            options, hasher, code_index,
        ))));
        if let Some(previous) = previous {
            previous.superseded.store(true, Ordering::Release);
        }
        info!(
            "Built index over {} descriptors in {:?}",
            number_of_descriptors,
            start.elapsed()
        );
        Ok(())
    }

    /// Hash a vector with the trained hasher.
    ///
    /// # Arguments
    ///
    /// * `vector` - The vector to hash.
    ///
    /// # Returns
    ///
    /// The vector, its bit vector, and its packed code.
    pub fn get_small_code(&self, vector: &[EmbeddingPrecision]) -> Result<HashedVector> {
        self.snapshot()
            .ok_or(ItqError::NotTrained)?
            .hasher
            .encode(vector)
    }

    /// Perform an approximate *n* nearest neighbours search against the current state.
    ///
    /// See [`TrainedState::nn`].
    ///
    /// # Arguments
    ///
    /// * `query` - The query vector.
    ///
    /// * `n` - The number of approximate neighbours to return.
    ///
    /// # Returns
    ///
    /// Up to `n` descriptors with their distances from `query`, nearest first.
    pub fn nn(
        &self,
        query: &[EmbeddingPrecision],
        n: usize,
    ) -> Result<Vec<(Descriptor, EmbeddingPrecision)>> {
        self.snapshot().ok_or(ItqError::NotTrained)?.nn(query, n)
    }

    /// Discard the trained state, returning the index to its untrained condition.
    pub fn reset(&self) {
        let _writer = self.writer.lock();
        self.state.store(None);
    }
}

impl<I: CodeIndex + Serialize + DeserializeOwned> ItqIndex<I> {
    /// Save the trained state to a directory, overwriting any state previously saved there.
    ///
    /// # Arguments
    ///
    /// * `path` - The directory to save to. Created if it does not exist.
    pub fn save_index(&self, path: impl AsRef<Path>) -> Result<()> {
        let state = self
            .snapshot()
            .ok_or_else(|| ItqError::Save("no index built yet to save".to_owned()))?;
        let file = persistence::save_state(&state, path.as_ref())?;
        info!("Saved index to {}", file.display());
        Ok(())
    }

    /// Load a trained state saved to a directory, replacing the current state and options.
    ///
    /// If loading fails, the current state is left untouched.
    ///
    /// # Arguments
    ///
    /// * `path` - The directory the state was saved to.
    pub fn load_index(&self, path: impl AsRef<Path>) -> Result<()> {
        let _writer = self.writer.lock();
        let state: TrainedState<I> = persistence::load_state(path.as_ref())
            .inspect_err(|e| warn!("Rejected saved index: {}", e))?;
        *self.options.write() = state.options;
        self.state.store(Some(Arc::new(state)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_codes_are_ordered_by_hamming_distance() {
        let codes = BTreeSet::from([0b0000, 0b0001, 0b0011, 0b0111, 0b1111]);
        assert_eq!(nearest_codes(&codes, 0b0000, 3), vec![0b0000, 0b0001, 0b0011]);
        assert_eq!(nearest_codes(&codes, 0b1111, 2), vec![0b1111, 0b0111]);
        assert_eq!(nearest_codes(&codes, 0b0000, 10).len(), 5);
        assert!(nearest_codes(&codes, 0b0000, 0).is_empty());
        assert_eq!(nearest_codes(&codes, 0b0000, usize::MAX).len(), 5);
    }

    #[test]
    fn equidistant_codes_are_ordered_by_value() {
        let codes = BTreeSet::from([0b100, 0b010, 0b001]);
        assert_eq!(nearest_codes(&codes, 0b000, 2), vec![0b001, 0b010]);
    }

    #[test]
    fn options_are_validated() {
        let default = ItqIndexOptions::default();
        assert!(default.validate().is_ok());
        for options in [
            ItqIndexOptions {
                bit_length: 0,
                ..default
            },
            ItqIndexOptions {
                bit_length: 65,
                ..default
            },
            ItqIndexOptions {
                itq_iterations: 0,
                ..default
            },
        ] {
            assert!(matches!(options.validate(), Err(ItqError::Config(_))));
            assert!(matches!(
                ItqIndex::new(options),
                Err(ItqError::Config(_))
            ));
        }
    }

    #[test]
    fn untrained_index() {
        let index = ItqIndex::new(ItqIndexOptions::default()).unwrap();
        assert!(!index.is_trained());
        assert_eq!(index.count().unwrap(), 0);
        assert!(matches!(index.nn(&[0.0], 1), Err(ItqError::NotTrained)));
        assert!(matches!(
            index.get_small_code(&[0.0]),
            Err(ItqError::NotTrained)
        ));
    }

    #[test]
    fn empty_code_index_is_reported() {
        let index = ItqIndex::with_code_index(
            ItqIndexOptions {
                random_seed: Some(1),
                ..Default::default()
            },
            || Ok(MemoryCodeIndex::new()),
        )
        .unwrap();
        let hasher = ItqHasher::new(
            nalgebra::DVector::zeros(2),
            nalgebra::DMatrix::from_element(2, 8, 1.0),
        )
        .unwrap();
        index.state.store(Some(Arc::new(TrainedState::new(
            index.options(),
            hasher,
            MemoryCodeIndex::new(),
        ))));
        assert!(matches!(index.nn(&[0.0, 0.0], 1), Err(ItqError::EmptyIndex)));
    }
}
