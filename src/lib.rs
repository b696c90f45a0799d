//! glacierflow: orbital bias correction for glacier surface velocity fields
//!
//! Velocity fields derived from optical image pairs carry a geolocation bias that depends on
//! the two viewing geometries. This library groups fields by the orbit pair that produced them,
//! builds a reference field from repeat-track pairs, estimates a per-pair offset against it and
//! writes corrected, filtered fields with off-ice uncertainty metadata.

pub mod config;
pub mod core;
pub mod io;
pub mod pipeline;
pub mod types;

// Re-export main types and functions for easier access
pub use config::{AoiSource, MaskTileConfig, ProcessingConfig, ProjectInfo, Thresholds};
pub use pipeline::{process_glaciers, GlacierPipeline, GlacierReport, GlacierSummary};
pub use types::{
    BoundingBox, FlowError, FlowResult, GeoTransform, GridContext, OrbitId, OrbitPair, SkipReason,
    VelocityComponent, VelocityImage,
};

#[cfg(feature = "python")]
mod python {
    use super::*;
    use pyo3::prelude::*;

    fn to_py_err(e: FlowError) -> PyErr {
        PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e))
    }

    /// Python wrapper for a finished glacier
    #[pyclass(name = "GlacierSummary")]
    struct PyGlacierSummary {
        inner: GlacierSummary,
    }

    #[pymethods]
    impl PyGlacierSummary {
        #[getter]
        fn glacier(&self) -> String {
            self.inner.glacier.clone()
        }

        #[getter]
        fn records(&self) -> usize {
            self.inner.records
        }

        #[getter]
        fn corrected(&self) -> usize {
            self.inner.corrected
        }

        #[getter]
        fn skipped(&self) -> usize {
            self.inner.skipped
        }

        #[getter]
        fn already_present(&self) -> usize {
            self.inner.already_present
        }

        fn __repr__(&self) -> String {
            format!(
                "GlacierSummary(glacier='{}', corrected={}, skipped={}, already_present={})",
                self.inner.glacier, self.inner.corrected, self.inner.skipped, self.inner.already_present
            )
        }
    }

    /// Run one glacier from a TOML configuration, optionally overriding the glacier name
    #[pyfunction]
    #[pyo3(signature = (config_path, glacier=None))]
    fn run_glacier(config_path: String, glacier: Option<String>) -> PyResult<PyGlacierSummary> {
        let mut config = ProcessingConfig::from_toml_file(&config_path).map_err(to_py_err)?;
        if let Some(name) = glacier {
            config = config.for_glacier(&name);
        }
        let inner = GlacierPipeline::new(config).run().map_err(to_py_err)?;
        Ok(PyGlacierSummary { inner })
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_class::<PyGlacierSummary>()?;
        m.add_function(wrap_pyfunction!(run_glacier, m)?)?;
        Ok(())
    }
}
