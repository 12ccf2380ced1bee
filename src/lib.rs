use pyo3::prelude::*;
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod ann;
pub mod error;
pub mod matrix;
pub mod network;

pub use error::NetworkError;
pub use matrix::DenseMatrix;
pub use network::{build_network, SparseNetwork};

#[pymodule]
fn _actionet(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(network::build_network_dense, m)?)?;
    m.add_function(wrap_pyfunction!(network::build_network_csr, m)?)?;
    m.add("InvalidShapeError", m.py().get_type::<error::InvalidShapeError>())?;
    m.add("DegenerateInputError", m.py().get_type::<error::DegenerateInputError>())?;
    m.add("ResourceError", m.py().get_type::<error::ResourceError>())?;
    m.add("NumericError", m.py().get_type::<error::NumericError>())?;
    Ok(())
}
