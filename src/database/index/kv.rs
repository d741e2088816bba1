use super::CodeIndex;
use crate::{descriptor::Descriptor, itq::hasher::SmallCode, Embedding};
use dashmap::DashMap;
use fjall::{Keyspace, KvSeparationOptions, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::LazyLock,
};
use uuid::Uuid;

const CODE_LENGTH: usize = std::mem::size_of::<SmallCode>();

/// Keyspaces opened by this process, by path; a keyspace must only be opened once.
static KEYSPACES: LazyLock<DashMap<PathBuf, Keyspace>> = LazyLock::new(DashMap::new);

fn keyspace(path: &Path) -> anyhow::Result<Keyspace> {
    if let Some(keyspace) = KEYSPACES.get(path) {
        return Ok(keyspace.clone());
    }
    let keyspace = KEYSPACES
        .entry(path.to_path_buf())
        .or_try_insert_with(|| fjall::Config::new(path).open())?;
    Ok(keyspace.clone())
}

fn key(code: SmallCode, id: &Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(CODE_LENGTH + 16);
    key.extend_from_slice(&code.to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn code_of_key(key: &[u8]) -> anyhow::Result<SmallCode> {
    let code: [u8; CODE_LENGTH] = key
        .get(..CODE_LENGTH)
        .ok_or_else(|| anyhow::anyhow!("code index key is too short"))?
        .try_into()?;
    Ok(SmallCode::from_be_bytes(code))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Where a [`KvCodeIndex`] keeps its data.
pub struct KvCodeIndexLocation {
    /// The directory of the keyspace.
    pub path: PathBuf,
    /// The partition within the keyspace holding this index's buckets.
    pub partition: String,
}

/// A code index stored on disk in a [`fjall`] keyspace.
///
/// Each index occupies its own partition, keyed by the big-endian code followed by the descriptor's UUID, so a bucket is a prefix range and is always read back in UUID order.
/// Serialising the index records only its location; deserialising reopens it.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "KvCodeIndexLocation", into = "KvCodeIndexLocation")]
pub struct KvCodeIndex {
    location: KvCodeIndexLocation,
    keyspace: Keyspace,
    buckets: PartitionHandle,
}

impl KvCodeIndex {
    /// Create an empty code index in a new partition of the keyspace at `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - The directory of the keyspace. Created if it does not exist.
    ///
    /// # Returns
    ///
    /// A [KvCodeIndex].
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::open(KvCodeIndexLocation {
            path: path.as_ref().to_path_buf(),
            partition: format!("{}-codes", Uuid::now_v7().as_simple()),
        })
    }

    /// Open the code index at a given location, creating it if it does not exist.
    ///
    /// # Arguments
    ///
    /// * `location` - The keyspace and partition of the index.
    ///
    /// # Returns
    ///
    /// A [KvCodeIndex].
    pub fn open(location: KvCodeIndexLocation) -> anyhow::Result<Self> {
        let keyspace = keyspace(&location.path)?;
        let buckets = keyspace.open_partition(
            &location.partition,
            PartitionCreateOptions::default().with_kv_separation(KvSeparationOptions::default()),
        )?;
        Ok(Self {
            location,
            keyspace,
            buckets,
        })
    }

    /// Open the code index at a given location, failing if it does not already exist.
    ///
    /// # Arguments
    ///
    /// * `location` - The keyspace and partition of the index.
    ///
    /// # Returns
    ///
    /// A [KvCodeIndex], or an error if the keyspace directory or the partition is missing.
    pub fn open_existing(location: KvCodeIndexLocation) -> anyhow::Result<Self> {
        if !location.path.is_dir() {
            KEYSPACES.remove(&location.path);
            anyhow::bail!(
                "code index keyspace {} does not exist",
                location.path.display()
            );
        }
        if !keyspace(&location.path)?.partition_exists(&location.partition) {
            anyhow::bail!(
                "code index partition {} does not exist in {}",
                location.partition,
                location.path.display()
            );
        }
        Self::open(location)
    }

    /// A factory producing a fresh, empty code index in the keyspace at `path` on every call.
    ///
    /// # Arguments
    ///
    /// * `path` - The directory of the keyspace.
    pub fn factory(
        path: impl AsRef<Path>,
    ) -> impl Fn() -> anyhow::Result<Self> + Send + Sync + 'static {
        let path = path.as_ref().to_path_buf();
        move || Self::new(&path)
    }

    /// Where this index keeps its data.
    pub fn location(&self) -> &KvCodeIndexLocation {
        &self.location
    }

    /// The keyspace holding this index's partition.
    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }
}

impl TryFrom<KvCodeIndexLocation> for KvCodeIndex {
    type Error = anyhow::Error;

    fn try_from(location: KvCodeIndexLocation) -> Result<Self, Self::Error> {
        Self::open_existing(location)
    }
}

impl From<KvCodeIndex> for KvCodeIndexLocation {
    fn from(index: KvCodeIndex) -> Self {
        index.location
    }
}

impl CodeIndex for KvCodeIndex {
    fn add_many_descriptors(
        &mut self,
        entries: Vec<(SmallCode, Descriptor)>,
    ) -> anyhow::Result<()> {
        for (code, descriptor) in entries {
            self.buckets.insert(
                key(code, &descriptor.id()),
                bincode::serde::encode_to_vec(descriptor.vector(), bincode::config::legacy())?,
            )?;
        }
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    fn codes(&self) -> anyhow::Result<BTreeSet<SmallCode>> {
        self.buckets
            .iter()
            .map(|kv| -> anyhow::Result<SmallCode> {
                let (k, _) = kv?;
                code_of_key(&k)
            })
            .collect()
    }

    fn get_descriptors(&self, code: SmallCode) -> anyhow::Result<Vec<Descriptor>> {
        self.buckets
            .prefix(code.to_be_bytes())
            .map(|kv| -> anyhow::Result<Descriptor> {
                let (k, v) = kv?;
                let id = Uuid::from_slice(
                    k.get(CODE_LENGTH..)
                        .ok_or_else(|| anyhow::anyhow!("code index key is too short"))?,
                )?;
                let vector: Embedding =
                    bincode::serde::decode_from_slice(&v, bincode::config::legacy())?.0;
                Ok(Descriptor::with_id(id, vector))
            })
            .collect()
    }

    fn count(&self) -> anyhow::Result<usize> {
        Ok(self.buckets.len()?)
    }

    fn destroy(&self) -> anyhow::Result<()> {
        self.keyspace.delete_partition(self.buckets.clone())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopening_requires_existing_keyspace() {
        let dir = tempfile::tempdir().unwrap();
        let missing = KvCodeIndexLocation {
            path: dir.path().join("missing"),
            partition: "absent-codes".to_owned(),
        };
        assert!(KvCodeIndex::open_existing(missing.clone()).is_err());
        assert!(KvCodeIndex::try_from(missing.clone()).is_err());
        assert!(!missing.path.exists());
    }

    #[test]
    fn reopening_requires_existing_partition() {
        let dir = tempfile::tempdir().unwrap();
        let index = KvCodeIndex::new(dir.path()).unwrap();
        let reopened = KvCodeIndex::open_existing(index.location().clone()).unwrap();
        assert_eq!(reopened.location(), index.location());

        let absent = KvCodeIndexLocation {
            path: dir.path().to_path_buf(),
            partition: "absent-codes".to_owned(),
        };
        assert!(KvCodeIndex::open_existing(absent).is_err());
        assert!(!index.keyspace().partition_exists("absent-codes"));
    }

    #[test]
    fn destroy_removes_partition() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = KvCodeIndex::new(dir.path()).unwrap();
        index
            .add_many_descriptors(vec![(1, Descriptor::new(vec![1.0]))])
            .unwrap();
        let partition = index.location().partition.clone();
        assert!(index.keyspace().partition_exists(&partition));
        index.destroy().unwrap();
        assert!(!index.keyspace().partition_exists(&partition));
        assert!(KvCodeIndex::open_existing(index.location().clone()).is_err());
    }
}
