//! Puzzle acquisition: procedural generation and dataset sampling.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use ponder_types::{GRID_CELLS, GRID_SIDE, Grid};

use crate::error::SourceError;

/// Where a candidate initial grid comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PuzzleSpec {
    /// Procedurally masked from a fixed full solution.
    Random,
    /// Sampled uniformly from an indexed dataset file.
    Dataset { path: PathBuf },
}

impl PuzzleSpec {
    /// Parse the boundary representation: a source kind plus optional path.
    pub fn parse(kind: &str, path: Option<PathBuf>) -> Result<Self, SourceError> {
        match kind {
            "random" => Ok(Self::Random),
            "dataset" => path.map(|path| Self::Dataset { path }).ok_or_else(|| {
                SourceError::InvalidSource("dataset source requires a path".to_owned())
            }),
            other => Err(SourceError::InvalidSource(other.to_owned())),
        }
    }
}

/// A generated grid plus, for dataset sampling, the index it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedPuzzle {
    pub grid: Grid,
    /// Index of the sampled dataset entry; `None` for procedural puzzles.
    /// Reported so a sampled puzzle can be reproduced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

/// Best-effort geometry of a dataset's entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetShape {
    Square(usize),
    Flat(usize),
    Unknown,
}

/// A dataset file visible under the data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetEntry {
    pub file_name: String,
    pub size_bytes: u64,
    /// Number of entries, when the file parses.
    pub entries: Option<usize>,
    pub shape: DatasetShape,
}

/// Removal bounds for procedural generation: between 51 and 61 of the 81
/// cells are blanked, leaving 20-30 givens. Counts and positions are
/// uniform. The result is structurally plausible, not necessarily uniquely
/// solvable; the solver does not require uniqueness.
const MIN_REMOVED: usize = 51;
const MAX_REMOVED: usize = 61;

/// One fixed valid full solution used as the base for procedural masking.
const BASE_SOLUTION: [[u8; GRID_SIDE]; GRID_SIDE] = [
    [5, 3, 4, 6, 7, 8, 9, 1, 2],
    [6, 7, 2, 1, 9, 5, 3, 4, 8],
    [1, 9, 8, 3, 4, 2, 5, 6, 7],
    [8, 5, 9, 7, 6, 1, 4, 2, 3],
    [4, 2, 6, 8, 5, 3, 7, 9, 1],
    [7, 1, 3, 9, 2, 4, 8, 5, 6],
    [9, 6, 1, 5, 3, 7, 2, 8, 4],
    [2, 8, 7, 4, 1, 9, 6, 3, 5],
    [3, 4, 5, 2, 8, 6, 9, 1, 7],
];

struct DatasetHandle {
    path: PathBuf,
    grids: Arc<Vec<Grid>>,
}

/// Supplies candidate initial grids.
///
/// The dataset handle for a given path is loaded once and reused across
/// calls; requesting a different path invalidates and reloads it.
pub struct PuzzleSource {
    data_root: PathBuf,
    cache: Mutex<Option<DatasetHandle>>,
}

impl PuzzleSource {
    #[must_use]
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            cache: Mutex::new(None),
        }
    }

    /// Produce one grid per `spec`.
    ///
    /// `seed` makes the request reproducible; `None` draws from OS entropy.
    pub fn generate(
        &self,
        spec: &PuzzleSpec,
        seed: Option<u64>,
    ) -> Result<GeneratedPuzzle, SourceError> {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        match spec {
            PuzzleSpec::Random => {
                let grid = random_puzzle(&mut rng)?;
                Ok(GeneratedPuzzle { grid, index: None })
            }
            PuzzleSpec::Dataset { path } => {
                let grids = self.dataset(path)?;
                if grids.is_empty() {
                    return Err(SourceError::Shape("dataset holds no entries".to_owned()));
                }
                let index = rng.gen_range(0..grids.len());
                Ok(GeneratedPuzzle {
                    grid: grids[index].clone(),
                    index: Some(index),
                })
            }
        }
    }

    /// Enumerate dataset files directly under the data directory.
    ///
    /// Best-effort: files that do not parse are still listed, with
    /// [`DatasetShape::Unknown`]. A missing directory yields an empty list.
    #[must_use]
    pub fn list_datasets(&self) -> Vec<DatasetEntry> {
        let Ok(read_dir) = fs::read_dir(&self.data_root) else {
            return Vec::new();
        };
        let mut entries: Vec<DatasetEntry> = read_dir
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    return None;
                }
                let metadata = entry.metadata().ok()?;
                let (count, shape) = inspect_dataset(&path);
                Some(DatasetEntry {
                    file_name: entry.file_name().to_string_lossy().into_owned(),
                    size_bytes: metadata.len(),
                    entries: count,
                    shape,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        entries
    }

    fn dataset(&self, path: &Path) -> Result<Arc<Vec<Grid>>, SourceError> {
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_root.join(path)
        };

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = cache.as_ref() {
            if handle.path == resolved {
                return Ok(Arc::clone(&handle.grids));
            }
        }

        let grids = Arc::new(load_dataset(&resolved)?);
        info!(
            dataset = %resolved.display(),
            entries = grids.len(),
            "loaded dataset"
        );
        *cache = Some(DatasetHandle {
            path: resolved,
            grids: Arc::clone(&grids),
        });
        Ok(grids)
    }
}

impl std::fmt::Debug for PuzzleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PuzzleSource")
            .field("data_root", &self.data_root)
            .finish_non_exhaustive()
    }
}

fn random_puzzle(rng: &mut StdRng) -> Result<Grid, SourceError> {
    let mut cells: Vec<u8> = BASE_SOLUTION.iter().flatten().copied().collect();
    let removed = rng.gen_range(MIN_REMOVED..=MAX_REMOVED);
    for index in rand::seq::index::sample(rng, GRID_CELLS, removed) {
        cells[index] = 0;
    }
    Grid::from_flat(&cells).map_err(|err| SourceError::Shape(err.to_string()))
}

/// A dataset entry as stored on disk: a flat row-major array of 81 cells or
/// a 9×9 array of rows. Both decode to the same grid.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Flat(Vec<i64>),
    Rows(Vec<Vec<i64>>),
}

impl RawEntry {
    fn into_grid(self) -> Result<Grid, String> {
        match self {
            RawEntry::Flat(values) => {
                let cells = convert_cells(&values)?;
                Grid::from_flat(&cells).map_err(|err| err.to_string())
            }
            RawEntry::Rows(rows) => {
                let rows: Vec<Vec<u8>> = rows
                    .iter()
                    .map(|row| convert_cells(row))
                    .collect::<Result<_, _>>()?;
                Grid::from_rows(&rows).map_err(|err| err.to_string())
            }
        }
    }
}

fn convert_cells(values: &[i64]) -> Result<Vec<u8>, String> {
    values
        .iter()
        .map(|&value| u8::try_from(value).map_err(|_| format!("cell value {value} out of range")))
        .collect()
}

fn load_dataset(path: &Path) -> Result<Vec<Grid>, SourceError> {
    if !path.is_file() {
        return Err(SourceError::PathNotFound(path.to_path_buf()));
    }
    let raw = fs::read_to_string(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let entries: Vec<RawEntry> = serde_json::from_str(&raw)
        .map_err(|err| SourceError::Shape(format!("not a dataset array: {err}")))?;
    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            entry
                .into_grid()
                .map_err(|msg| SourceError::Shape(format!("entry {index}: {msg}")))
        })
        .collect()
}

fn inspect_dataset(path: &Path) -> (Option<usize>, DatasetShape) {
    let Ok(raw) = fs::read_to_string(path) else {
        return (None, DatasetShape::Unknown);
    };
    let Ok(entries) = serde_json::from_str::<Vec<RawEntry>>(&raw) else {
        return (None, DatasetShape::Unknown);
    };
    let shape = match entries.first() {
        Some(RawEntry::Flat(values)) => DatasetShape::Flat(values.len()),
        Some(RawEntry::Rows(rows)) => DatasetShape::Square(rows.len()),
        None => DatasetShape::Unknown,
    };
    (Some(entries.len()), shape)
}
