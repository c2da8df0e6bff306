//! Python bindings of the scope, built with the `python` feature.
//!
//! # Example (python)
//! ```python
//! import time
//! from niscope_backend import Scope, devices
//!
//! print(devices())
//! scope = Scope()            # or Scope("scope.toml")
//! scope.start()
//! time.sleep(1.0)
//! block = scope.latest_block()   # numpy array, shape (channels, samples)
//! scope.stop()
//! ```

use std::sync::Arc;
use std::time::Duration;

use numpy::{IntoPyArray, PyArray2};
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;

use nisession_backend::{DaqResult, SampleBlock, SessionRegistry};

use crate::config::ScopeConfig;
use crate::nidaqmx::NiDriver;
use crate::scope;

fn to_py_err<E: std::fmt::Display>(err: E) -> PyErr {
    PyRuntimeError::new_err(err.to_string())
}

fn block_to_py(py: Python<'_>, block: DaqResult<Option<SampleBlock>>) -> PyResult<Option<&PyArray2<f64>>> {
    Ok(block
        .map_err(to_py_err)?
        .map(|block| block.into_data().into_pyarray(py)))
}

#[pyclass(name = "Scope")]
pub struct PyScope {
    inner: scope::Scope<NiDriver>,
}

#[pymethods]
impl PyScope {
    /// Configures the scope from a TOML file, or with the stock configuration when no path
    /// is given.
    #[new]
    #[pyo3(signature = (config_path=None))]
    fn new(config_path: Option<&str>) -> PyResult<Self> {
        let config = match config_path {
            Some(path) => ScopeConfig::load(path).map_err(to_py_err)?,
            None => ScopeConfig::default(),
        };
        let registry = Arc::new(SessionRegistry::new(NiDriver::new()));
        let inner = scope::Scope::new(registry, config).map_err(to_py_err)?;
        Ok(Self { inner })
    }

    fn start(&mut self) -> PyResult<()> {
        self.inner.start().map_err(to_py_err)
    }

    fn stop(&mut self) -> PyResult<()> {
        self.inner.stop().map_err(to_py_err)
    }

    /// Oldest queued block, waiting up to `timeout_s` seconds for one (no wait by default).
    #[pyo3(signature = (timeout_s=None))]
    fn pop_block<'py>(&self, py: Python<'py>, timeout_s: Option<f64>) -> PyResult<Option<&'py PyArray2<f64>>> {
        let block = match timeout_s {
            None => self.inner.pop(),
            Some(seconds) => {
                let timeout = Duration::try_from_secs_f64(seconds).map_err(to_py_err)?;
                let blocks = self.inner.receiver().clone();
                py.allow_threads(move || blocks.pop_timeout(timeout))
            }
        };
        block_to_py(py, block)
    }

    /// Freshest block; older queued blocks are discarded.
    fn latest_block<'py>(&self, py: Python<'py>) -> PyResult<Option<&'py PyArray2<f64>>> {
        block_to_py(py, self.inner.latest())
    }

    fn dropped_blocks(&self) -> u64 {
        self.inner.dropped()
    }

    fn channel_names(&self) -> PyResult<Vec<String>> {
        self.inner.channel_names().map_err(to_py_err)
    }
}

/// Devices known to the driver.
#[pyfunction]
fn devices() -> PyResult<Vec<String>> {
    SessionRegistry::new(NiDriver::new())
        .devices()
        .map_err(to_py_err)
}

/// Driver version as `(major, minor)`.
#[pyfunction]
fn version() -> PyResult<(u32, u32)> {
    SessionRegistry::new(NiDriver::new())
        .version()
        .map_err(to_py_err)
}

#[pymodule]
fn niscope_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyScope>()?;
    m.add_function(wrap_pyfunction!(devices, m)?)?;
    m.add_function(wrap_pyfunction!(version, m)?)?;
    Ok(())
}
