//! Nearest-neighbor network construction from an archetype-weight
//! embedding.
//!
//! Pipeline: normalize the input matrix, grow a randomized projection
//! forest over its rows, query each row's approximate nearest neighbors
//! in parallel, convert distances to weights, optionally keep only
//! mutual edges, and emit the adjacency as CSR.
//!
//! Neighbor count scales with `density`: `k = ceil(10 * density)`,
//! clamped to `n_obs - 1`. Within a row, candidates are kept while
//! their distance stays under `(1 + 0.5 * density) * d_min`, so a point
//! sitting in a tight neighborhood does not drag in far-away edges.
//! Weights are `1 / (1 + d)` with Euclidean `d`; a mutual edge stores
//! the minimum of its two directed weights.

use ahash::AHashMap;
use numpy::{IntoPyArray, PyArray1, PyReadonlyArray1, PyReadonlyArray2, PyUntypedArrayMethods};
use pyo3::prelude::*;
use rayon::prelude::*;
use tracing::debug;

use crate::ann::NeighborForest;
use crate::error::{InvalidShapeError, NetworkError};
use crate::matrix::DenseMatrix;

const K_BASE: f64 = 10.0;
/// Minimum candidate pool per row; fewer observations than this is a
/// degenerate input rather than a clampable one.
const MIN_POOL: usize = 4;
const N_TREES: usize = 10;
const LEAF_SIZE: usize = 32;
const FOREST_SEED: u64 = 0x5eed_ac71;
const RETENTION_SLACK: f64 = 0.5;
const MAX_THREADS: usize = 512;

/// Sparse adjacency matrix in CSR form, row-major with column indices
/// ascending inside each row. No self-loops; all stored weights are
/// finite and positive.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseNetwork {
    pub indptr: Vec<i64>,
    pub indices: Vec<i32>,
    pub values: Vec<f64>,
    pub n_obs: usize,
}

impl SparseNetwork {
    #[inline]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Stored weight at (row, col), or 0.0 if the entry is absent.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        let start = self.indptr[row] as usize;
        let end = self.indptr[row + 1] as usize;
        match self.indices[start..end].binary_search(&(col as i32)) {
            Ok(p) => self.values[start + p],
            Err(_) => 0.0,
        }
    }
}

/// Effective neighbor count for `density` over `n_obs` observations.
///
/// The requested count is `ceil(10 * density)`; it clamps to
/// `n_obs - 1` when the dataset is smaller, but a dataset that cannot
/// even provide `min(requested, 4)` neighbors is rejected as
/// degenerate.
pub fn neighbor_count(density: f64, n_obs: usize) -> Result<usize, NetworkError> {
    if !density.is_finite() || density <= 0.0 {
        return Err(NetworkError::InvalidShape(format!(
            "density must be a positive finite number, got {}",
            density
        )));
    }
    let k_req = (K_BASE * density).ceil() as usize;
    let k_req = k_req.max(1);
    let pool = k_req.min(MIN_POOL);
    if n_obs.saturating_sub(1) < pool {
        return Err(NetworkError::DegenerateInput {
            n_obs,
            needed: pool + 1,
        });
    }
    Ok(k_req.min(n_obs - 1))
}

#[inline(always)]
fn edge_weight(dist: f64) -> f64 {
    1.0 / (1.0 + dist)
}

/// Build the nearest-neighbor network over the rows of `matrix`.
///
/// `thread_no = 0` uses all available workers. With
/// `mutual_edges_only` the result is exactly symmetric; otherwise it is
/// the union of directed edges and may be asymmetric. The same input
/// and parameters always produce the same matrix, independent of the
/// thread count.
pub fn build_network(
    matrix: &DenseMatrix,
    density: f64,
    thread_no: usize,
    mutual_edges_only: bool,
) -> Result<SparseNetwork, NetworkError> {
    let n_obs = matrix.n_rows();
    let n_arch = matrix.n_cols();
    let k = neighbor_count(density, n_obs)?;

    if n_obs > i32::MAX as usize {
        return Err(NetworkError::InvalidShape(format!(
            "{} observations exceed the addressable maximum",
            n_obs
        )));
    }
    if thread_no > MAX_THREADS {
        return Err(NetworkError::Resource(format!(
            "requested {} threads, limit is {}",
            thread_no, MAX_THREADS
        )));
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(thread_no)
        .build()
        .map_err(|e| NetworkError::Resource(e.to_string()))?;

    let search_k = k * N_TREES * 2;
    let cutoff_factor = 1.0 + RETENTION_SLACK * density;

    let rows: Result<Vec<Vec<(u32, f64)>>, NetworkError> = pool.install(|| {
        // The forest must be complete before any query starts; queries
        // only ever read it.
        let forest = NeighborForest::build(
            matrix.values(),
            n_obs,
            n_arch,
            N_TREES,
            LEAF_SIZE,
            FOREST_SEED,
        );
        debug!(n_obs, n_arch, k, search_k, "neighbor forest built");

        (0..n_obs)
            .into_par_iter()
            .map(|i| {
                let neighbors = forest.query(matrix.row(i), i as u32, k, search_k);
                directed_edges(&neighbors, cutoff_factor, i)
            })
            .collect()
    });
    let rows = rows?;

    let network = finalize(rows, n_obs, mutual_edges_only)?;
    debug!(
        n_obs,
        nnz = network.nnz(),
        mutual_edges_only,
        "network finalized"
    );
    Ok(network)
}

/// Turn one row's sorted neighbor candidates into directed edges.
///
/// Candidates arrive in ascending `(distance, index)` order. A
/// candidate is retained while its distance stays within
/// `cutoff_factor * d_min`; the returned list is ordered by descending
/// weight. A row whose nearest neighbor sits at distance zero keeps
/// every zero-distance candidate.
fn directed_edges(
    neighbors: &[(u32, f64)],
    cutoff_factor: f64,
    source: usize,
) -> Result<Vec<(u32, f64)>, NetworkError> {
    let Some(&(_, d_min)) = neighbors.first() else {
        return Ok(Vec::new());
    };
    let cutoff = cutoff_factor * d_min;

    let mut edges = Vec::with_capacity(neighbors.len());
    for &(target, dist) in neighbors {
        if dist > cutoff {
            break;
        }
        let w = edge_weight(dist);
        if !w.is_finite() {
            return Err(NetworkError::Numeric(format!(
                "non-finite weight for edge {} -> {}",
                source, target
            )));
        }
        if w > 0.0 {
            edges.push((target, w));
        }
    }
    Ok(edges)
}

/// Assemble per-row directed edge lists into the final CSR matrix.
fn finalize(
    rows: Vec<Vec<(u32, f64)>>,
    n_obs: usize,
    mutual_edges_only: bool,
) -> Result<SparseNetwork, NetworkError> {
    let lookup: Vec<AHashMap<u32, f64>> = if mutual_edges_only {
        rows.iter()
            .map(|edges| edges.iter().map(|&(t, w)| (t, w)).collect())
            .collect()
    } else {
        Vec::new()
    };

    let mut indptr = Vec::with_capacity(n_obs + 1);
    indptr.push(0i64);
    let mut indices = Vec::new();
    let mut values = Vec::new();

    for (i, edges) in rows.iter().enumerate() {
        let mut row_out: Vec<(i32, f64)> = Vec::with_capacity(edges.len());
        for &(target, w) in edges {
            let j = target as usize;
            if j == i {
                continue;
            }
            let w = if mutual_edges_only {
                match lookup[j].get(&(i as u32)) {
                    // Both directions agree on the metric; min keeps the
                    // matrix symmetric even if they ever diverge.
                    Some(&w_rev) => w.min(w_rev),
                    None => continue,
                }
            } else {
                w
            };
            if !w.is_finite() {
                return Err(NetworkError::Numeric(format!(
                    "non-finite weight at ({}, {})",
                    i, j
                )));
            }
            if w > 0.0 {
                row_out.push((j as i32, w));
            }
        }
        row_out.sort_unstable_by_key(|&(col, _)| col);

        for (col, w) in row_out {
            indices.push(col);
            values.push(w);
        }
        indptr.push(indices.len() as i64);
    }

    Ok(SparseNetwork {
        indptr,
        indices,
        values,
        n_obs,
    })
}

// ── Python bindings ─────────────────────────────────────────────────

type CsrTriple<'py> = (
    Bound<'py, PyArray1<i64>>,
    Bound<'py, PyArray1<i32>>,
    Bound<'py, PyArray1<f64>>,
    usize,
);

/// Build the network from a dense f64 matrix. Returns the CSR triple
/// `(indptr, indices, values)` plus `n_obs`.
#[pyfunction]
#[pyo3(signature = (data, density=1.0, thread_no=0, mutual_edges_only=true, samples_in_columns=false))]
pub fn build_network_dense<'py>(
    py: Python<'py>,
    data: PyReadonlyArray2<f64>,
    density: f64,
    thread_no: usize,
    mutual_edges_only: bool,
    samples_in_columns: bool,
) -> PyResult<CsrTriple<'py>> {
    let shape = data.shape();
    let slice = data
        .as_slice()
        .map_err(|_| InvalidShapeError::new_err("input array must be C-contiguous"))?;

    let mut matrix = DenseMatrix::from_row_major(slice, shape[0], shape[1])?;
    if samples_in_columns {
        matrix = matrix.transposed()?;
    }

    let network = build_network(&matrix, density, thread_no, mutual_edges_only)?;
    Ok((
        network.indptr.into_pyarray(py),
        network.indices.into_pyarray(py),
        network.values.into_pyarray(py),
        network.n_obs,
    ))
}

/// Build the network from a CSR matrix, densified before the search.
#[pyfunction]
#[pyo3(signature = (indptr, indices, values, n_rows, n_cols, density=1.0, thread_no=0, mutual_edges_only=true, samples_in_columns=false))]
#[allow(clippy::too_many_arguments)]
pub fn build_network_csr<'py>(
    py: Python<'py>,
    indptr: PyReadonlyArray1<i64>,
    indices: PyReadonlyArray1<i32>,
    values: PyReadonlyArray1<f64>,
    n_rows: usize,
    n_cols: usize,
    density: f64,
    thread_no: usize,
    mutual_edges_only: bool,
    samples_in_columns: bool,
) -> PyResult<CsrTriple<'py>> {
    let mut matrix = DenseMatrix::from_csr(
        indptr.as_slice()?,
        indices.as_slice()?,
        values.as_slice()?,
        n_rows,
        n_cols,
    )?;
    if samples_in_columns {
        matrix = matrix.transposed()?;
    }

    let network = build_network(&matrix, density, thread_no, mutual_edges_only)?;
    Ok((
        network.indptr.into_pyarray(py),
        network.indices.into_pyarray(py),
        network.values.into_pyarray(py),
        network.n_obs,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(data: &[f64], n_rows: usize, n_cols: usize) -> DenseMatrix {
        DenseMatrix::from_row_major(data, n_rows, n_cols).unwrap()
    }

    /// Deterministic filler for property tests.
    fn pseudo_random_matrix(n: usize, d: usize, mut state: u64) -> DenseMatrix {
        let mut data = Vec::with_capacity(n * d);
        for _ in 0..n * d {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            data.push((state % 10_000) as f64 / 10_000.0);
        }
        matrix(&data, n, d)
    }

    #[test]
    fn neighbor_count_scales_with_density() {
        assert_eq!(neighbor_count(1.0, 100).unwrap(), 10);
        assert_eq!(neighbor_count(1.5, 100).unwrap(), 15);
        assert_eq!(neighbor_count(0.25, 100).unwrap(), 3);
        // Clamped by the dataset.
        assert_eq!(neighbor_count(1.0, 8).unwrap(), 7);
        let mut prev = 0;
        for i in 1..=40 {
            let k = neighbor_count(i as f64 * 0.25, 1000).unwrap();
            assert!(k >= prev);
            prev = k;
        }
    }

    #[test]
    fn neighbor_count_rejects_bad_density() {
        assert!(matches!(
            neighbor_count(0.0, 100),
            Err(NetworkError::InvalidShape(_))
        ));
        assert!(matches!(
            neighbor_count(-1.0, 100),
            Err(NetworkError::InvalidShape(_))
        ));
        assert!(matches!(
            neighbor_count(f64::NAN, 100),
            Err(NetworkError::InvalidShape(_))
        ));
    }

    #[test]
    fn too_few_observations_is_degenerate() {
        let m = pseudo_random_matrix(3, 4, 9);
        let err = build_network(&m, 1.0, 1, true).unwrap_err();
        assert!(matches!(err, NetworkError::DegenerateInput { n_obs: 3, .. }));
    }

    #[test]
    fn output_is_square_with_zero_diagonal() {
        let m = pseudo_random_matrix(30, 5, 17);
        let net = build_network(&m, 1.0, 1, true).unwrap();
        assert_eq!(net.n_obs, 30);
        assert_eq!(net.indptr.len(), 31);
        for i in 0..30 {
            assert_eq!(net.get(i, i), 0.0);
        }
        for &col in &net.indices {
            assert!(col >= 0 && (col as usize) < 30);
        }
    }

    #[test]
    fn weights_are_positive_and_finite() {
        for mutual in [true, false] {
            let m = pseudo_random_matrix(40, 6, 23);
            let net = build_network(&m, 1.0, 1, mutual).unwrap();
            assert!(net.nnz() > 0);
            for &w in &net.values {
                assert!(w.is_finite());
                assert!(w > 0.0);
                assert!(w <= 1.0);
            }
        }
    }

    #[test]
    fn mutual_network_is_symmetric() {
        let m = pseudo_random_matrix(50, 4, 31);
        let net = build_network(&m, 1.0, 1, true).unwrap();
        for row in 0..50 {
            let start = net.indptr[row] as usize;
            let end = net.indptr[row + 1] as usize;
            for p in start..end {
                let col = net.indices[p] as usize;
                assert_eq!(
                    net.values[p],
                    net.get(col, row),
                    "asymmetry at ({}, {})",
                    row,
                    col
                );
            }
        }
    }

    #[test]
    fn csr_columns_sorted_within_rows() {
        let m = pseudo_random_matrix(35, 5, 41);
        let net = build_network(&m, 1.2, 1, false).unwrap();
        for row in 0..35 {
            let start = net.indptr[row] as usize;
            let end = net.indptr[row + 1] as usize;
            for p in start + 1..end {
                assert!(net.indices[p - 1] < net.indices[p]);
            }
        }
    }

    #[test]
    fn edge_count_grows_with_density() {
        // n below the leaf size keeps the search exact, so loosening
        // density can only add edges.
        let m = pseudo_random_matrix(30, 4, 57);
        for mutual in [true, false] {
            let mut prev = 0;
            for density in [0.3, 0.6, 1.0, 1.5, 2.5] {
                let net = build_network(&m, density, 1, mutual).unwrap();
                assert!(
                    net.nnz() >= prev,
                    "density {} shrank the edge set ({} < {})",
                    density,
                    net.nnz(),
                    prev
                );
                prev = net.nnz();
            }
        }
    }

    #[test]
    fn single_thread_runs_are_bit_identical() {
        let m = pseudo_random_matrix(45, 5, 71);
        let a = build_network(&m, 1.0, 1, true).unwrap();
        let b = build_network(&m, 1.0, 1, true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn thread_count_does_not_change_the_network() {
        let m = pseudo_random_matrix(60, 5, 83);
        for mutual in [true, false] {
            let single = build_network(&m, 1.0, 1, mutual).unwrap();
            let multi = build_network(&m, 1.0, 4, mutual).unwrap();
            assert_eq!(single, multi);
        }
    }

    #[test]
    fn square_corners_and_center() {
        // Four corners of the unit square plus its center, embedded in
        // three dimensions with the last coordinate zero.
        #[rustfmt::skip]
        let pts = [
            0.0, 0.0, 0.0,
            1.0, 0.0, 0.0,
            1.0, 1.0, 0.0,
            0.0, 1.0, 0.0,
            0.5, 0.5, 0.0,
        ];
        let m = matrix(&pts, 5, 3);
        let net = build_network(&m, 1.0, 1, true).unwrap();

        let degree =
            |i: usize| (net.indptr[i + 1] - net.indptr[i]) as usize;

        // Center keeps all four corners.
        assert_eq!(degree(4), 4);
        for corner in 0..4 {
            assert!(net.get(4, corner) > 0.0);
            assert_eq!(net.get(4, corner), net.get(corner, 4));
        }
        // Each corner keeps the center and its two adjacent corners;
        // the diagonal edge is dropped.
        for corner in 0..4 {
            assert_eq!(degree(corner), 3, "corner {}", corner);
        }
        assert_eq!(net.get(0, 2), 0.0);
        assert_eq!(net.get(1, 3), 0.0);

        let w_center = 1.0 / (1.0 + 0.5f64.sqrt());
        let w_side = 1.0 / 2.0;
        assert!((net.get(0, 4) - w_center).abs() < 1e-12);
        assert!((net.get(0, 1) - w_side).abs() < 1e-12);
    }

    #[test]
    fn zero_matrix_ties_break_by_index() {
        // No variance at all: every pairwise distance is zero, so the
        // neighbor choice is purely the index tie-break.
        let m = matrix(&vec![0.0; 8 * 3], 8, 3);
        // density 0.3 -> k = 3
        let a = build_network(&m, 0.3, 1, true).unwrap();
        let b = build_network(&m, 0.3, 1, true).unwrap();
        assert_eq!(a, b);

        // Each row lists its three lowest-indexed peers; the mutual
        // intersection is the complete graph over rows 0..4.
        assert_eq!(a.nnz(), 12);
        for i in 0..4 {
            for j in 0..4 {
                if i != j {
                    assert_eq!(a.get(i, j), 1.0);
                }
            }
        }
        for i in 4..8 {
            let deg = (a.indptr[i + 1] - a.indptr[i]) as usize;
            assert_eq!(deg, 0, "row {} should have lost all edges", i);
        }
    }

    #[test]
    fn non_mutual_keeps_directed_union() {
        let m = matrix(&vec![0.0; 8 * 3], 8, 3);
        let net = build_network(&m, 0.3, 1, false).unwrap();
        // Every row keeps its three lowest-indexed peers.
        assert_eq!(net.nnz(), 24);
        let row7: Vec<i32> = {
            let s = net.indptr[7] as usize;
            let e = net.indptr[8] as usize;
            net.indices[s..e].to_vec()
        };
        assert_eq!(row7, vec![0, 1, 2]);
    }

    #[test]
    fn thread_request_over_cap_fails() {
        let m = pseudo_random_matrix(20, 3, 97);
        let err = build_network(&m, 1.0, 100_000, true).unwrap_err();
        assert!(matches!(err, NetworkError::Resource(_)));
    }
}
