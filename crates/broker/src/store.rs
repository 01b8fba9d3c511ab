use std::{
    collections::HashMap,
    io::Cursor,
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use image::{
    codecs::pnm::{PnmEncoder, PnmSubtype, SampleEncoding},
    GrayImage, ImageFormat,
};
use shared::domain::{Grid, ALIVE, DEAD};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("grid '{0}' not found")]
    NotFound(String),
    #[error("invalid grid name '{0}'")]
    InvalidName(String),
    #[error("grid '{name}' is malformed: {reason}")]
    Malformed { name: String, reason: String },
    #[error("i/o error on grid '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Where initial grids come from and where saved grids go.
#[async_trait]
pub trait GridStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Grid, StoreError>;
    async fn save(&self, name: &str, grid: &Grid) -> Result<(), StoreError>;
}

/// Name a grid snapshot is saved under: `{width}x{height}x{turn}`.
pub fn output_name(grid: &Grid, turn: u64) -> String {
    format!("{}x{}x{}", grid.width(), grid.height(), turn)
}

/// Binary PGM (`P5`) files, read from `input_dir` and written to `output_dir`.
pub struct PgmStore {
    input_dir: PathBuf,
    output_dir: PathBuf,
}

impl PgmStore {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    fn resolve(dir: &Path, name: &str) -> Result<PathBuf, StoreError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        let relative = Path::new(trimmed);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        let mut path = dir.join(relative);
        if path.extension().is_none() {
            path.set_extension("pgm");
        }
        Ok(path)
    }
}

#[async_trait]
impl GridStore for PgmStore {
    async fn load(&self, name: &str) -> Result<Grid, StoreError> {
        let path = Self::resolve(&self.input_dir, name)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(name.to_string())
            } else {
                StoreError::Io {
                    name: name.to_string(),
                    source: e,
                }
            }
        })?;
        decode_pgm(&bytes).map_err(|reason| StoreError::Malformed {
            name: name.to_string(),
            reason,
        })
    }

    async fn save(&self, name: &str, grid: &Grid) -> Result<(), StoreError> {
        let path = Self::resolve(&self.output_dir, name)?;
        let io = |source| StoreError::Io {
            name: name.to_string(),
            source,
        };
        let bytes = encode_pgm(grid).map_err(|reason| StoreError::Malformed {
            name: name.to_string(),
            reason,
        })?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        tokio::fs::write(&path, bytes).await.map_err(io)
    }
}

/// Keeps grids in memory; used by tests and embedded setups.
#[derive(Default)]
pub struct MemoryStore {
    grids: RwLock<HashMap<String, Grid>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, name: impl Into<String>, grid: Grid) {
        self.grids.write().await.insert(name.into(), grid);
    }

    pub async fn get(&self, name: &str) -> Option<Grid> {
        self.grids.read().await.get(name).cloned()
    }
}

#[async_trait]
impl GridStore for MemoryStore {
    async fn load(&self, name: &str) -> Result<Grid, StoreError> {
        self.get(name)
            .await
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn save(&self, name: &str, grid: &Grid) -> Result<(), StoreError> {
        self.insert(name, grid.clone()).await;
        Ok(())
    }
}

/// Binary graymap (`P5`, maxval 255) with live cells at full intensity.
pub fn encode_pgm(grid: &Grid) -> Result<Vec<u8>, String> {
    let width = u32::try_from(grid.width()).map_err(|_| "grid too wide for PGM".to_string())?;
    let height = u32::try_from(grid.height()).map_err(|_| "grid too tall for PGM".to_string())?;
    let cells = grid
        .cells()
        .iter()
        .map(|cell| if *cell == DEAD { DEAD } else { ALIVE })
        .collect();
    let gray = GrayImage::from_raw(width, height, cells)
        .ok_or_else(|| "cell buffer does not match grid size".to_string())?;
    let mut out = Cursor::new(Vec::new());
    gray.write_with_encoder(
        PnmEncoder::new(&mut out).with_subtype(PnmSubtype::Graymap(SampleEncoding::Binary)),
    )
    .map_err(|err| err.to_string())?;
    Ok(out.into_inner())
}

/// Any netpbm graymap; every non-zero sample is a live cell.
pub fn decode_pgm(bytes: &[u8]) -> Result<Grid, String> {
    let gray = image::load_from_memory_with_format(bytes, ImageFormat::Pnm)
        .map_err(|err| err.to_string())?
        .into_luma8();
    let (width, height) = gray.dimensions();
    let cells = gray
        .into_raw()
        .into_iter()
        .map(|v| if v == DEAD { DEAD } else { ALIVE })
        .collect();
    Grid::from_cells(width as usize, height as usize, cells).map_err(|e| e.to_string())
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
