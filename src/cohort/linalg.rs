use ndarray::prelude::*;
use tracing::trace;

use crate::{AppError, AppResult};
use crate::model::Embedding;

/// Smallest norm a row is divided by; keeps all-zero rows at zero instead of NaN.
pub const MIN_NORM: f64 = 1e-8;

/// Replace NaN and infinities with zero.
#[inline]
pub fn sanitize(v: f64) -> f64 {
    if v.is_finite() { v } else { 0.0 }
}

pub fn row_norms(x: &Array2<f64>, squared: bool) -> Array1<f64> {
    let sum: Array1<f64> = (x * x).sum_axis(Axis(1));
    if squared { sum } else { sum.sqrt() }
}

/// Stack equally sized embeddings into a `(rows, dim)` matrix, sanitizing as it goes.
#[tracing::instrument(name = "Stacking embeddings", level = "trace", skip(embs))]
pub fn embeddings_to_ndarray(embs: &[&[f32]]) -> AppResult<Array2<f64>> {
    let Some(first) = embs.first() else {
        return Err(AppError::Other("cannot stack zero embeddings".to_string()));
    };
    let cols = first.len();
    let mut arr: Array2<f64> = Array2::<f64>::zeros((embs.len(), cols));
    trace!("Initialized ndarray with shape: {:?}", arr.dim());
    for (mut row, emb) in arr.axis_iter_mut(Axis(0)).zip(embs) {
        if emb.len() != cols {
            return Err(AppError::Dimension {
                expected: cols,
                actual: emb.len(),
            });
        }
        for (dst, src) in row.iter_mut().zip(emb.iter()) {
            *dst = sanitize(*src as f64);
        }
    }
    Ok(arr)
}

/// Scale every row to unit L2 norm, dividing by at least [`MIN_NORM`].
pub fn normalize_rows(mut data: Array2<f64>) -> Array2<f64> {
    data.mapv_inplace(sanitize);
    let norms = row_norms(&data, false);
    for (mut row, norm) in data.axis_iter_mut(Axis(0)).zip(norms.iter()) {
        let denom = norm.max(MIN_NORM);
        row.mapv_inplace(|v| v / denom);
    }
    data
}

/// Element-wise mean of the rows, with no NaN components.
pub fn mean_vector(data: &Array2<f64>) -> Embedding {
    match data.mean_axis(Axis(0)) {
        Some(mean) => mean.iter().map(|v| sanitize(*v) as f32).collect(),
        None => vec![0.0; data.ncols()],
    }
}
