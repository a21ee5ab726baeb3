use crate::analyzer::ParamCatalog;
use crate::input::{ConfItem, ConfType, Input, Seed};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can arise during seed pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The requested seed ID was not found in the pool.
    #[error("Seed ID {0} not found in pool")]
    SeedNotFound(usize),

    /// An operation could not be performed because the pool is empty.
    #[error("Seed pool is empty, cannot select a seed")]
    PoolIsEmpty,

    #[error("Seed pool I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::Io(err.to_string())
    }
}

/// Where a pooled seed came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeedOrigin {
    Baseline,
    Injected { path: PathBuf },
    /// A passing testcase mutated from seed `parent`.
    Mutated { parent: usize },
    /// A minimized failing testcase derived from seed `parent`.
    Minimized { parent: usize },
}

#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub seed: Seed,
    pub origin: SeedOrigin,
    pub fingerprint: [u8; 16],
}

/// Defines the common interface of a collection of seeds.
///
/// The fuzzing loop only calls [`SeedPool::next`] and [`SeedPool::add`];
/// the size is readable for reporting.
pub trait SeedPool: Send + Sync {
    /// Adds a seed and returns the ID assigned to it.
    fn add(&mut self, seed: Seed, origin: SeedOrigin) -> Result<usize, PoolError>;

    fn get(&self, id: usize) -> Option<&PoolEntry>;

    /// Picks the next seed to mutate, uniformly at random.
    fn next(&mut self, rng: &mut dyn RngCore) -> Result<(usize, &Seed), PoolError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An in-memory seed pool. Not persistent across runs.
#[derive(Debug, Default)]
pub struct InMemoryPool {
    entries: Vec<PoolEntry>,
}

impl InMemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }
}

impl SeedPool for InMemoryPool {
    fn add(&mut self, seed: Seed, origin: SeedOrigin) -> Result<usize, PoolError> {
        let id = self.entries.len();
        debug!(id, items = seed.len(), ?origin, "Seed added to pool");
        self.entries.push(PoolEntry {
            fingerprint: seed.fingerprint(),
            seed,
            origin,
        });
        Ok(id)
    }

    fn get(&self, id: usize) -> Option<&PoolEntry> {
        self.entries.get(id)
    }

    fn next(&mut self, rng: &mut dyn RngCore) -> Result<(usize, &Seed), PoolError> {
        if self.entries.is_empty() {
            return Err(PoolError::PoolIsEmpty);
        }
        let index = rng.next_u64() as usize % self.entries.len();
        self.entries
            .get(index)
            .map(|entry| (index, &entry.seed))
            .ok_or(PoolError::SeedNotFound(index))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct SeedFile {
    #[serde(default)]
    item: Vec<SeedFileItem>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct SeedFileItem {
    name: String,
    #[serde(rename = "type", default)]
    ty: Option<ConfType>,
    value: String,
}

/// Parses one injected seed. Items without a declared type take the type the
/// catalog gives them; items the catalog does not know either are skipped.
pub fn parse_seed(raw: &str, catalog: &ParamCatalog) -> Result<Seed, toml::de::Error> {
    let file: SeedFile = toml::from_str(raw)?;
    let items = file.item.into_iter().filter_map(|entry| {
        let ty = entry.ty.or_else(|| catalog.type_of(&entry.name));
        match ty {
            Some(ty) => Some(ConfItem::new(entry.name, ty, entry.value)),
            None => {
                warn!(name = %entry.name, "Injected item has no known type, skipping");
                None
            }
        }
    });
    Ok(Seed::from_items(items))
}

/// Loads injected seeds from files or directories (not recursive) into `pool`.
///
/// Unreadable or malformed seeds are logged and skipped; empty seeds are kept.
/// Returns the number of seeds added.
pub fn load_seed_files<P: SeedPool + ?Sized>(
    pool: &mut P,
    seed_paths: &[PathBuf],
    catalog: &ParamCatalog,
) -> Result<usize, PoolError> {
    let mut files = Vec::new();
    for path in seed_paths {
        if path.is_dir() {
            for entry in fs::read_dir(path)? {
                let file = entry?.path();
                if file.is_file() {
                    files.push(file);
                }
            }
        } else {
            files.push(path.clone());
        }
    }
    files.sort();

    let mut loaded = 0;
    for file in files {
        match load_one(&file, catalog) {
            Ok(seed) => {
                if seed.is_empty() {
                    warn!(path = ?file, "Injected seed carries no items");
                }
                pool.add(seed, SeedOrigin::Injected { path: file })?;
                loaded += 1;
            }
            Err(reason) => warn!(path = ?file, %reason, "Skipping malformed seed"),
        }
    }
    Ok(loaded)
}

fn load_one(path: &Path, catalog: &ParamCatalog) -> Result<Seed, String> {
    let raw = fs::read_to_string(path).map_err(|e| e.to_string())?;
    parse_seed(&raw, catalog).map_err(|e| e.to_string())
}
