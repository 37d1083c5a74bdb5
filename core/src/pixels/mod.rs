//! Pixel-domain maps, binning and covariance handling.

pub mod binning;
pub mod io;

pub use binning::{Binner, MASK_BIT};
pub use io::{JsonMapSink, MapSink, MemorySink};

use crate::comm::Reducer;
use crate::prelude::{DestripeError, DestripeResult};
use ndarray::{Array2, ArrayView1, ArrayViewMut1};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Dense map with `nnz` values per pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelMap {
    npix: usize,
    nnz: usize,
    data: Array2<f64>,
}

impl PixelMap {
    pub fn zeros(npix: usize, nnz: usize) -> Self {
        Self {
            npix,
            nnz,
            data: Array2::zeros((npix, nnz)),
        }
    }

    pub fn from_data(data: Array2<f64>) -> Self {
        let (npix, nnz) = data.dim();
        Self { npix, nnz, data }
    }

    pub fn npix(&self) -> usize {
        self.npix
    }

    pub fn nnz(&self) -> usize {
        self.nnz
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array2<f64> {
        &mut self.data
    }

    pub fn pixel(&self, pixel: usize) -> ArrayView1<f64> {
        self.data.row(pixel)
    }

    pub fn pixel_mut(&mut self, pixel: usize) -> ArrayViewMut1<f64> {
        self.data.row_mut(pixel)
    }

    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }

    /// Sums the map over the reduction group in place.
    pub fn all_reduce(&mut self, reducer: &dyn Reducer) -> DestripeResult<()> {
        let values = self.data.as_slice_mut().ok_or_else(|| {
            DestripeError::Internal("pixel map is not stored contiguously".into())
        })?;
        reducer.all_reduce_slice(values);
        Ok(())
    }

    pub fn check_shape(&self, npix: usize, nnz: usize) -> DestripeResult<()> {
        if self.npix == npix && self.nnz == nnz && self.data.dim() == (npix, nnz) {
            Ok(())
        } else {
            Err(DestripeError::LayoutMismatch(format!(
                "map has {} pixels x {} values, expected {} x {}",
                self.npix, self.nnz, npix, nnz
            )))
        }
    }

    pub fn read_json(path: &Path) -> DestripeResult<Self> {
        if !path.is_file() {
            return Err(DestripeError::MissingInput(path.to_path_buf()));
        }
        let reader = BufReader::new(File::open(path)?);
        let map: PixelMap = serde_json::from_reader(reader)?;
        map.check_shape(map.data.nrows(), map.data.ncols())?;
        Ok(map)
    }

    pub fn write_json(&self, path: &Path) -> DestripeResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }
}
