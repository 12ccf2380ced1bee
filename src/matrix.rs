//! Input normalization: dense or CSR matrices are converted into a
//! row-major `f64` matrix with samples as rows before any neighbor
//! search runs.

use crate::error::NetworkError;

/// Dense row-major matrix of 64-bit floats.
///
/// Immutable once constructed; the builder only ever reads it.
#[derive(Debug, Clone)]
pub struct DenseMatrix {
    data: Vec<f64>,
    n_rows: usize,
    n_cols: usize,
}

impl DenseMatrix {
    /// Build from a row-major slice, validating shape and finiteness.
    pub fn from_row_major(data: &[f64], n_rows: usize, n_cols: usize) -> Result<Self, NetworkError> {
        if n_rows < 2 {
            return Err(NetworkError::InvalidShape(format!(
                "need at least 2 rows, got {}",
                n_rows
            )));
        }
        if n_cols == 0 {
            return Err(NetworkError::InvalidShape("matrix has no columns".into()));
        }
        if data.len() != n_rows * n_cols {
            return Err(NetworkError::InvalidShape(format!(
                "buffer holds {} values, expected {}x{}",
                data.len(),
                n_rows,
                n_cols
            )));
        }
        if let Some(pos) = data.iter().position(|v| !v.is_finite()) {
            return Err(NetworkError::InvalidShape(format!(
                "non-finite entry at flat index {}",
                pos
            )));
        }
        Ok(DenseMatrix {
            data: data.to_vec(),
            n_rows,
            n_cols,
        })
    }

    /// Densify a CSR matrix. Unreferenced entries are zero.
    pub fn from_csr(
        indptr: &[i64],
        indices: &[i32],
        values: &[f64],
        n_rows: usize,
        n_cols: usize,
    ) -> Result<Self, NetworkError> {
        if indptr.len() != n_rows + 1 {
            return Err(NetworkError::InvalidShape(format!(
                "indptr has {} entries, expected {}",
                indptr.len(),
                n_rows + 1
            )));
        }
        if indices.len() != values.len() {
            return Err(NetworkError::InvalidShape(format!(
                "indices/values length mismatch: {} vs {}",
                indices.len(),
                values.len()
            )));
        }
        let nnz = values.len() as i64;
        if indptr[0] != 0 || indptr[n_rows] != nnz {
            return Err(NetworkError::InvalidShape(
                "indptr does not span the value buffer".into(),
            ));
        }

        let mut dense = vec![0.0f64; n_rows * n_cols];
        for row in 0..n_rows {
            let start = indptr[row];
            let end = indptr[row + 1];
            if start > end || end > nnz {
                return Err(NetworkError::InvalidShape(format!(
                    "indptr not monotone at row {}",
                    row
                )));
            }
            for p in start as usize..end as usize {
                let col = indices[p];
                if col < 0 || col as usize >= n_cols {
                    return Err(NetworkError::InvalidShape(format!(
                        "column index {} out of range for {} columns",
                        col, n_cols
                    )));
                }
                dense[row * n_cols + col as usize] = values[p];
            }
        }
        DenseMatrix::from_row_major(&dense, n_rows, n_cols)
    }

    /// Transposed copy, for callers whose convention stores samples as
    /// columns. The builder always receives samples as rows.
    pub fn transposed(&self) -> Result<Self, NetworkError> {
        let mut out = vec![0.0f64; self.data.len()];
        for r in 0..self.n_rows {
            for c in 0..self.n_cols {
                out[c * self.n_rows + r] = self.data[r * self.n_cols + c];
            }
        }
        DenseMatrix::from_row_major(&out, self.n_cols, self.n_rows)
    }

    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    #[inline]
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n_cols..(i + 1) * self.n_cols]
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_single_row() {
        let err = DenseMatrix::from_row_major(&[1.0, 2.0], 1, 2).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidShape(_)));
    }

    #[test]
    fn rejects_length_mismatch() {
        let err = DenseMatrix::from_row_major(&[1.0, 2.0, 3.0], 2, 2).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidShape(_)));
    }

    #[test]
    fn rejects_non_finite_entries() {
        let err = DenseMatrix::from_row_major(&[1.0, f64::NAN, 0.0, 1.0], 2, 2).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidShape(_)));
        let err = DenseMatrix::from_row_major(&[1.0, f64::INFINITY, 0.0, 1.0], 2, 2).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidShape(_)));
    }

    #[test]
    fn densifies_csr() {
        // [[0, 2, 0], [1, 0, 3]]
        let m = DenseMatrix::from_csr(&[0, 1, 3], &[1, 0, 2], &[2.0, 1.0, 3.0], 2, 3).unwrap();
        assert_eq!(m.row(0), &[0.0, 2.0, 0.0]);
        assert_eq!(m.row(1), &[1.0, 0.0, 3.0]);
    }

    #[test]
    fn rejects_csr_column_out_of_range() {
        let err = DenseMatrix::from_csr(&[0, 1, 2], &[0, 3], &[1.0, 1.0], 2, 3).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidShape(_)));
    }

    #[test]
    fn rejects_csr_bad_indptr() {
        let err = DenseMatrix::from_csr(&[0, 2, 1], &[0, 1], &[1.0, 1.0], 2, 3).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidShape(_)));
    }

    #[test]
    fn transpose_swaps_axes() {
        let m = DenseMatrix::from_row_major(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3).unwrap();
        let t = m.transposed().unwrap();
        assert_eq!(t.n_rows(), 3);
        assert_eq!(t.n_cols(), 2);
        assert_eq!(t.row(0), &[1.0, 4.0]);
        assert_eq!(t.row(1), &[2.0, 5.0]);
        assert_eq!(t.row(2), &[3.0, 6.0]);
    }
}
