//! Persistence of results into an out-of-core array store.
//!
//! Every array is written with its ordered dimension names so that readers
//! can recover the axis semantics without out-of-band knowledge.

pub mod npz;

use std::path::Path;

use ndarray::{Array1, Array2, ArrayD};
use tracing::info;

use crate::assemble::DisaggOutput;
use crate::binning::BinEdges;
use crate::disagg::DisaggMatrix;
use crate::error::{DisaggError, Result};

pub use npz::NpzStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    ReadOnly,
    Create,
}

/// A named array with its shape descriptor and optional labels along its
/// first axis (the TRT names, for instance).
#[derive(Debug, Clone, PartialEq)]
pub struct StoredArray {
    pub dims: Vec<String>,
    pub data: ArrayD<f64>,
    pub labels: Vec<String>,
}

impl StoredArray {
    pub fn new(dims: Vec<String>, data: ArrayD<f64>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            dims.len() == data.ndim(),
            "{} dimension names for a {}-D array",
            dims.len(),
            data.ndim()
        );
        Ok(Self {
            dims,
            data,
            labels: Vec::new(),
        })
    }

    fn vector(dim: &str, values: &[f64]) -> anyhow::Result<Self> {
        Self::new(vec![dim.to_string()], Array1::from_vec(values.to_vec()).into_dyn())
    }
}

/// Hierarchical array store with a single-writer phase.
pub trait ArrayStore: Sized {
    fn open(path: &Path, mode: StoreMode) -> anyhow::Result<Self>;

    fn read(&mut self, key: &str) -> anyhow::Result<StoredArray>;

    /// Only allowed once single-writer mode is enabled.
    fn write(&mut self, key: &str, array: &StoredArray) -> anyhow::Result<()>;

    fn enable_single_writer_mode(&mut self) -> anyhow::Result<()>;

    fn close(self) -> anyhow::Result<()>;
}

fn matrix_array(matrix: &DisaggMatrix) -> Result<StoredArray> {
    Ok(StoredArray::new(DisaggMatrix::dims(), matrix.to_array()?)?)
}

fn write_edges<S: ArrayStore>(store: &mut S, sids: &[u32], edges: &BinEdges) -> Result<()> {
    store.write("edges/mag", &StoredArray::vector("mag_edge", &edges.mag)?)?;
    store.write("edges/dist", &StoredArray::vector("dist_edge", &edges.dist)?)?;
    store.write("edges/eps", &StoredArray::vector("eps_edge", &edges.eps)?)?;
    let mut trt = StoredArray::vector(
        "trt",
        &(0..edges.trts.len()).map(|t| t as f64).collect::<Vec<_>>(),
    )?;
    trt.labels = edges.trts.clone();
    store.write("edges/trt", &trt)?;
    for (pos, sid) in sids.iter().enumerate() {
        store.write(
            &format!("edges/lon/sid-{sid}"),
            &StoredArray::vector("lon_edge", &edges.lon[pos])?,
        )?;
        store.write(
            &format!("edges/lat/sid-{sid}"),
            &StoredArray::vector("lat_edge", &edges.lat[pos])?,
        )?;
    }
    Ok(())
}

/// Write the edges, every normalized matrix, marginal and poe check, then
/// close the store.
pub fn persist<S: ArrayStore>(output: &DisaggOutput, mut store: S) -> Result<()> {
    store.enable_single_writer_mode()?;
    if let Some(edges) = &output.edges {
        write_edges(&mut store, &output.sids, edges)?;
    }

    let n_poe = output.poes.len();
    for ((sid, key), result) in &output.results {
        let base = format!("disagg/sid-{sid}/{key}");
        store.write(&format!("{base}/matrix"), &matrix_array(&result.matrix)?)?;
        for (marginal, pmf) in &result.pmfs {
            store.write(
                &format!("{base}/{marginal}"),
                &StoredArray::new(marginal.dims(), pmf.clone())?,
            )?;
        }
        if !result.qc.is_empty() {
            let computed: Vec<f64> = result.qc.iter().map(|q| q.computed_poe).collect();
            let arr = Array2::from_shape_vec((computed.len() / n_poe.max(1), n_poe), computed)
                .map_err(|e| DisaggError::invalid(format!("poe check layout: {e}")))?;
            let mut check = StoredArray::new(vec!["imt".into(), "poe".into()], arr.into_dyn())?;
            check.labels = output.imts.clone();
            store.write(&format!("{base}/poe_check"), &check)?;
        }
    }
    info!(results = output.results.len(), "disaggregation results written");
    store.close()?;
    Ok(())
}
