//! canopy: AOI-aware Sentinel-2 cloud filtering and vegetation index compositing
//!
//! Decides which Sentinel-2 images are usable for an area of interest by
//! scoring clouds inside the (optionally buffered) polygon rather than over the
//! whole tile, then reduces band math over the clear-sky composite into
//! per-AOI statistics, time series, scatter samples and heatmaps.

pub mod config;
pub mod core;
pub mod io;
pub mod models;
pub mod service;
pub mod types;

// Re-export main types and functions for easier access
pub use config::{EscalationPolicy, ResolverConfig, ServiceConfig, SuitabilityRule};
pub use core::{Aoi, BandMath, CollectionResolver, EscalationOutcome, ResolveParams};
pub use io::{ArchivePlatform, HttpPlatform, ImageryPlatform, PlatformClient};
pub use service::IndexService;
pub use types::{
    Band, BoundingBox, CanopyError, CanopyResult, CloudCoverageResult, Collection, DateRange,
    GeoTransform, ImageRecord, IndexRaster, Scene, Statistics, VegetationIndex,
};

#[cfg(feature = "python")]
mod python {
    use crate::core::geometry::Aoi;
    use crate::core::statistics;
    use crate::types::{Band, GeoTransform, ImageRecord, Scene, VegetationIndex};
    use crate::BandMath;
    use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
    use pyo3::prelude::*;
    use std::collections::HashMap;

    fn runtime_error(e: impl std::fmt::Display) -> PyErr {
        PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e))
    }

    fn value_error(e: impl std::fmt::Display) -> PyErr {
        PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("{}", e))
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_class::<PyAoi>()?;
        m.add_function(wrap_pyfunction!(compute_index, m)?)?;
        m.add_function(wrap_pyfunction!(summarize_values, m)?)?;
        Ok(())
    }

    /// Python wrapper for an AOI polygon
    #[pyclass(name = "Aoi")]
    #[derive(Clone)]
    struct PyAoi {
        inner: Aoi,
    }

    #[pymethods]
    impl PyAoi {
        #[new]
        fn new(ring: Vec<(f64, f64)>, name: Option<String>) -> PyResult<Self> {
            let ring = ring.into_iter().map(|(lon, lat)| [lon, lat]).collect();
            let inner = Aoi::new(ring, name).map_err(value_error)?;
            Ok(PyAoi { inner })
        }

        fn contains(&self, lon: f64, lat: f64) -> bool {
            self.inner.contains(lon, lat)
        }

        fn area_hectares(&self) -> f64 {
            self.inner.area_hectares()
        }

        fn bounding_box(&self) -> (f64, f64, f64, f64) {
            let b = self.inner.bounds();
            (b.min_lon, b.min_lat, b.max_lon, b.max_lat)
        }

        fn __repr__(&self) -> String {
            format!(
                "Aoi(name={:?}, vertices={})",
                self.inner.name(),
                self.inner.ring().len()
            )
        }
    }

    /// Compute one index from a dict of band name to 2-D float32 array
    #[pyfunction]
    fn compute_index<'py>(
        py: Python<'py>,
        index: &str,
        bands: HashMap<String, PyReadonlyArray2<'py, f32>>,
    ) -> PyResult<&'py PyArray2<f32>> {
        let index: VegetationIndex = index.parse().map_err(value_error)?;
        let mut rasters = HashMap::with_capacity(bands.len());
        for (name, array) in &bands {
            let band: Band = name.parse().map_err(value_error)?;
            rasters.insert(band, array.as_array().to_owned());
        }

        let scene = Scene {
            record: ImageRecord::new("python", chrono::NaiveDate::MIN, 0.0),
            geo_transform: GeoTransform::north_up(0.0, 0.0, 1.0, 1.0),
            bands: rasters,
        };
        let raster = BandMath::compute_index(&scene, index).ok_or_else(|| {
            runtime_error(format!(
                "{} needs bands {:?}",
                index,
                index.required_bands()
            ))
        })?;
        Ok(raster.data.into_pyarray(py))
    }

    /// Summary statistics of a list of values, NaN entries ignored
    #[pyfunction]
    fn summarize_values(values: Vec<f64>, percentiles: Option<Vec<f64>>) -> HashMap<String, f64> {
        let extra = percentiles.unwrap_or_default();
        let stats = statistics::summarize(&values, &extra);
        let mut out: HashMap<String, f64> = [
            ("min", stats.min),
            ("max", stats.max),
            ("mean", stats.mean),
            ("median", stats.median),
            ("p10", stats.p10),
            ("p25", stats.p25),
            ("p75", stats.p75),
            ("p90", stats.p90),
            ("std", stats.std),
            ("count", stats.count as f64),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        for pv in &stats.percentiles {
            out.insert(format!("p{}", pv.percentile), pv.value);
        }
        out
    }
}
