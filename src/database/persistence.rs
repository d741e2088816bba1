use super::{
    core::{ItqIndexOptions, TrainedState},
    index::CodeIndex,
};
use crate::{
    distance::DistanceMethod,
    error::{ItqError, Result},
    itq::hasher::{ItqHasher, MAX_BIT_LENGTH},
};
use nalgebra::{DMatrix, DVector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fs::{self, OpenOptions},
    io::{self, BufReader, BufWriter, Cursor, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

/// The name of the file holding a saved index, inside the directory it was saved to.
pub const SAVE_FILE: &str = "itq_index.bin";

/// The version of the saved index layout; files with any other version are rejected.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct StateRecordRef<'a, I> {
    format_version: u32,
    bit_length: usize,
    itq_iterations: usize,
    random_seed: Option<u64>,
    mean: &'a DVector<f64>,
    rotation: &'a DMatrix<f64>,
    code_index: &'a I,
    distance_method: DistanceMethod,
}

#[derive(Deserialize)]
struct StateRecord<I> {
    format_version: u32,
    bit_length: usize,
    itq_iterations: usize,
    random_seed: Option<u64>,
    mean: DVector<f64>,
    rotation: DMatrix<f64>,
    code_index: I,
    distance_method: DistanceMethod,
}

impl<I: CodeIndex> StateRecord<I> {
    fn into_state(self) -> Result<TrainedState<I>> {
        if self.format_version != FORMAT_VERSION {
            return Err(ItqError::Load(format!(
                "unsupported format version {}, expected {}",
                self.format_version, FORMAT_VERSION
            )));
        }
        let options = ItqIndexOptions {
            bit_length: self.bit_length,
            itq_iterations: self.itq_iterations,
            distance_method: self.distance_method,
            random_seed: self.random_seed,
        };
        options
            .validate()
            .map_err(|e| ItqError::Load(e.to_string()))?;
        if self.rotation.ncols() != self.bit_length {
            return Err(ItqError::Load(format!(
                "rotation produces {} bits but the index is configured for {}",
                self.rotation.ncols(),
                self.bit_length
            )));
        }
        let hasher =
            ItqHasher::new(self.mean, self.rotation).map_err(|e| ItqError::Load(e.to_string()))?;
        check_contents(&self.code_index, hasher.dimension(), self.bit_length)?;
        Ok(TrainedState::new(options, hasher, self.code_index))
    }
}

/// Check that every stored code fits the bit length and every stored descriptor has the hasher's dimension.
fn check_contents<I: CodeIndex>(
    code_index: &I,
    dimension: usize,
    bit_length: usize,
) -> Result<()> {
    let load_error = |e: anyhow::Error| ItqError::Load(e.to_string());
    for code in code_index.codes().map_err(load_error)? {
        if bit_length < MAX_BIT_LENGTH && code >> bit_length != 0 {
            return Err(ItqError::Load(format!(
                "stored code {:#x} is wider than {} bits",
                code, bit_length
            )));
        }
        for descriptor in code_index.get_descriptors(code).map_err(load_error)? {
            if descriptor.dimension() != dimension {
                return Err(ItqError::Load(format!(
                    "stored descriptor {} has {} dimensions, expected {}",
                    descriptor.id(),
                    descriptor.dimension(),
                    dimension
                )));
            }
        }
    }
    Ok(())
}

/// Write a trained state into a directory.
///
/// The state is written to a temporary file which replaces the save file only once fully written, so an interrupted save never leaves a partial file behind.
///
/// # Arguments
///
/// * `state` - The state to save.
///
/// * `directory` - The directory to save into. Created if it does not exist.
///
/// # Returns
///
/// The path of the save file.
pub fn save_state<I: CodeIndex + Serialize>(
    state: &TrainedState<I>,
    directory: &Path,
) -> Result<PathBuf> {
    let save_error = |e: &dyn std::fmt::Display| ItqError::Save(e.to_string());
    fs::create_dir_all(directory).map_err(|e| save_error(&e))?;
    let options = state.options();
    let record = StateRecordRef {
        format_version: FORMAT_VERSION,
        bit_length: options.bit_length,
        itq_iterations: options.itq_iterations,
        random_seed: options.random_seed,
        mean: state.hasher().mean(),
        rotation: state.hasher().rotation(),
        code_index: state.code_index(),
        distance_method: options.distance_method,
    };
    let bytes = bincode::serde::encode_to_vec(&record, bincode::config::legacy())
        .map_err(|e| save_error(&e))?;

    let file = NamedTempFile::new_in(directory).map_err(|e| save_error(&e))?;
    let mut reader = BufReader::new(Cursor::new(bytes));
    let mut compressor = lz4_flex::frame::FrameEncoder::new(BufWriter::new(file));
    io::copy(&mut reader, &mut compressor).map_err(|e| save_error(&e))?;
    let mut buf = compressor.finish().map_err(|e| save_error(&e))?;
    buf.flush().map_err(|e| save_error(&e))?;
    let file = buf.into_inner().map_err(|e| save_error(e.error()))?;
    file.as_file().sync_all().map_err(|e| save_error(&e))?;

    let path = directory.join(SAVE_FILE);
    file.persist(&path).map_err(|e| save_error(&e.error))?;
    Ok(path)
}

/// Read a trained state from a directory.
///
/// # Arguments
///
/// * `directory` - The directory the state was saved into.
///
/// # Returns
///
/// The saved state, or an error if the save file is missing, unreadable, or does not describe a valid index.
pub fn load_state<I: CodeIndex + DeserializeOwned>(directory: &Path) -> Result<TrainedState<I>> {
    let path = directory.join(SAVE_FILE);
    let file = OpenOptions::new().read(true).open(&path).map_err(|e| {
        ItqError::Load(format!("expected save file {}: {}", path.display(), e))
    })?;
    let mut decompressor = lz4_flex::frame::FrameDecoder::new(BufReader::new(file));
    let mut writer = BufWriter::new(Vec::new());
    io::copy(&mut decompressor, &mut writer).map_err(|e| {
        ItqError::Load(format!("unable to read {}: {}", path.display(), e))
    })?;
    let bytes = writer
        .into_inner()
        .map_err(|e| ItqError::Load(e.error().to_string()))?;
    let (record, _): (StateRecord<I>, usize) =
        bincode::serde::decode_from_slice(&bytes, bincode::config::legacy()).map_err(|e| {
            ItqError::Load(format!("unable to decode {}: {}", path.display(), e))
        })?;
    record.into_state()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::index::{kv::KvCodeIndexLocation, memory::MemoryCodeIndex},
        descriptor::Descriptor,
        itq::hasher::SmallCode,
        KvCodeIndex,
    };

    fn write_record<I: Serialize>(
        directory: &Path,
        format_version: u32,
        bit_length: usize,
        code_index: &I,
    ) {
        let mean = DVector::zeros(3);
        let rotation = DMatrix::from_element(3, 4, 0.5);
        let record = StateRecordRef {
            format_version,
            bit_length,
            itq_iterations: 50,
            random_seed: None,
            mean: &mean,
            rotation: &rotation,
            code_index,
            distance_method: DistanceMethod::Euclidean,
        };
        let bytes = bincode::serde::encode_to_vec(&record, bincode::config::legacy()).unwrap();
        let file = fs::File::create(directory.join(SAVE_FILE)).unwrap();
        let mut compressor = lz4_flex::frame::FrameEncoder::new(file);
        compressor.write_all(&bytes).unwrap();
        compressor.finish().unwrap();
    }

    fn memory_index(entries: Vec<(SmallCode, Descriptor)>) -> MemoryCodeIndex {
        let mut code_index = MemoryCodeIndex::new();
        code_index.add_many_descriptors(entries).unwrap();
        code_index
    }

    #[test]
    fn accepts_current_version() {
        let dir = tempfile::tempdir().unwrap();
        let code_index = memory_index(vec![(0b1010, Descriptor::new(vec![1.0, 2.0, 3.0]))]);
        write_record(dir.path(), FORMAT_VERSION, 4, &code_index);
        let state: TrainedState<MemoryCodeIndex> = load_state(dir.path()).unwrap();
        assert_eq!(state.options().bit_length, 4);
        assert_eq!(state.hasher().dimension(), 3);
        assert_eq!(state.code_index().count().unwrap(), 1);
    }

    #[test]
    fn rejects_other_versions() {
        let dir = tempfile::tempdir().unwrap();
        write_record(dir.path(), FORMAT_VERSION + 1, 4, &MemoryCodeIndex::new());
        assert!(matches!(
            load_state::<MemoryCodeIndex>(dir.path()),
            Err(ItqError::Load(_))
        ));
    }

    #[test]
    fn rejects_mismatched_bit_length() {
        let dir = tempfile::tempdir().unwrap();
        write_record(dir.path(), FORMAT_VERSION, 6, &MemoryCodeIndex::new());
        assert!(matches!(
            load_state::<MemoryCodeIndex>(dir.path()),
            Err(ItqError::Load(_))
        ));
    }

    #[test]
    fn rejects_codes_wider_than_bit_length() {
        let dir = tempfile::tempdir().unwrap();
        let code_index = memory_index(vec![(1 << 4, Descriptor::new(vec![1.0, 2.0, 3.0]))]);
        write_record(dir.path(), FORMAT_VERSION, 4, &code_index);
        assert!(matches!(
            load_state::<MemoryCodeIndex>(dir.path()),
            Err(ItqError::Load(_))
        ));
    }

    #[test]
    fn rejects_descriptors_of_other_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let code_index = memory_index(vec![(0b0001, Descriptor::new(vec![1.0, 2.0]))]);
        write_record(dir.path(), FORMAT_VERSION, 4, &code_index);
        assert!(matches!(
            load_state::<MemoryCodeIndex>(dir.path()),
            Err(ItqError::Load(_))
        ));
    }

    #[test]
    fn rejects_missing_kv_keyspace() {
        let dir = tempfile::tempdir().unwrap();
        let keyspace_path = dir.path().join("gone");
        let location = KvCodeIndexLocation {
            path: keyspace_path.clone(),
            partition: "gone-codes".to_owned(),
        };
        write_record(dir.path(), FORMAT_VERSION, 4, &location);
        assert!(matches!(
            load_state::<KvCodeIndex>(dir.path()),
            Err(ItqError::Load(_))
        ));
        assert!(!keyspace_path.exists());
    }
}
