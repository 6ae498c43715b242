use std::ops::Range;

use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::error::{DisaggError, Result};

/// Dimension names of the disaggregation matrix, in storage order.
pub const AXES: [&str; 8] = ["trt", "mag", "dist", "lon", "lat", "eps", "imt", "poe"];

/// Dense 8-D accumulator owned by one `(site, realization)` pair.
///
/// Stored row-major in a flat buffer so that the `(imt, poe)` block of a
/// 6-D bin cell is contiguous.
///
/// A partial matrix may cover only a window of the magnitude bins. Indices
/// passed to [`offset`](Self::offset) and [`cell_offset`](Self::cell_offset)
/// are always absolute magnitude bins.
#[derive(Debug, Clone, PartialEq)]
pub struct DisaggMatrix {
    shape: [usize; 8],
    strides: [usize; 8],
    mag_start: usize,
    data: Vec<f64>,
}

impl DisaggMatrix {
    pub fn zeros(shape: [usize; 8]) -> Self {
        let mut strides = [1usize; 8];
        for d in (0..7).rev() {
            strides[d] = strides[d + 1] * shape[d + 1];
        }
        let len = shape.iter().product();
        Self {
            shape,
            strides,
            mag_start: 0,
            data: vec![0.0; len],
        }
    }

    pub fn for_bins(bins: [usize; 6], n_imt: usize, n_poe: usize) -> Self {
        let [t, m, d, lo, la, e] = bins;
        Self::zeros([t, m, d, lo, la, e, n_imt, n_poe])
    }

    /// Matrix restricted to the magnitude bins in `mags`; `bins` is the full
    /// 6-D bin shape of the site.
    pub fn for_mag_window(bins: [usize; 6], mags: Range<usize>, n_imt: usize, n_poe: usize) -> Self {
        let [t, _, d, lo, la, e] = bins;
        let mut m = Self::zeros([t, mags.len(), d, lo, la, e, n_imt, n_poe]);
        m.mag_start = mags.start;
        m
    }

    /// Absolute magnitude bins covered by this matrix.
    #[inline]
    pub fn mag_range(&self) -> Range<usize> {
        self.mag_start..self.mag_start + self.shape[1]
    }

    pub fn shape(&self) -> &[usize; 8] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn offset(&self, mut idx: [usize; 8]) -> usize {
        idx[1] -= self.mag_start;
        idx.iter().zip(&self.strides).map(|(i, s)| i * s).sum()
    }

    /// Offset of the `(imt = 0, poe = 0)` entry of a 6-D bin cell.
    #[inline]
    pub fn cell_offset(&self, mut bin: [usize; 6]) -> usize {
        bin[1] -= self.mag_start;
        bin.iter().zip(&self.strides[..6]).map(|(i, s)| i * s).sum()
    }

    /// Number of `(imt, poe)` entries following each cell offset.
    #[inline]
    pub fn block_len(&self) -> usize {
        self.strides[5]
    }

    #[inline]
    pub fn get(&self, idx: [usize; 8]) -> f64 {
        self.data[self.offset(idx)]
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Element-wise sum with a partial matrix whose magnitude window lies
    /// inside this one's. Every other axis must match.
    pub fn add_assign(&mut self, other: &DisaggMatrix) -> Result<()> {
        let (outer, inner) = (self.mag_range(), other.mag_range());
        if self.shape[0] != other.shape[0]
            || self.shape[2..] != other.shape[2..]
            || inner.start < outer.start
            || inner.end > outer.end
        {
            return Err(DisaggError::invalid(format!(
                "cannot merge matrices of shapes {:?} (mag {:?}) and {:?} (mag {:?})",
                self.shape, outer, other.shape, inner
            )));
        }
        // one contiguous run per TRT
        let run = other.strides[0];
        let shift = (inner.start - outer.start) * self.strides[1];
        for t in 0..self.shape[0] {
            let dst = t * self.strides[0] + shift;
            let src = t * run;
            for (a, b) in self.data[dst..dst + run].iter_mut().zip(&other.data[src..src + run]) {
                *a += b;
            }
        }
        Ok(())
    }

    /// `self += weight * other`.
    pub fn add_scaled(&mut self, other: &DisaggMatrix, weight: f64) -> Result<()> {
        if self.shape != other.shape || self.mag_start != other.mag_start {
            return Err(DisaggError::invalid(format!(
                "cannot average matrices of shapes {:?} and {:?}",
                self.shape, other.shape
            )));
        }
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += weight * b;
        }
        Ok(())
    }

    pub fn view(&self) -> Result<ArrayViewD<'_, f64>> {
        ArrayViewD::from_shape(IxDyn(&self.shape), &self.data)
            .map_err(|e| DisaggError::invalid(format!("matrix view: {e}")))
    }

    pub fn to_array(&self) -> Result<ArrayD<f64>> {
        Ok(self.view()?.to_owned())
    }

    /// Axis names, the shape descriptor persisted alongside the data.
    pub fn dims() -> Vec<String> {
        AXES.iter().map(|s| s.to_string()).collect()
    }
}
