//! Local GeoTIFF export of index rasters

use crate::types::{CanopyError, CanopyResult, GeoTransform, IndexRaster, VegetationIndex};
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::Array2;
use std::path::Path;

/// EPSG code of the geographic grid rasters are stored on
pub const OUTPUT_EPSG: u32 = 4326;

/// Write the raster as a single-band float GeoTIFF, NaN as no-data
pub fn write_geotiff<P: AsRef<Path>>(
    raster: &IndexRaster,
    output_path: P,
    compression: Option<&str>,
) -> CanopyResult<()> {
    log::info!(
        "Saving {} raster as GeoTIFF: {}",
        raster.index,
        output_path.as_ref().display()
    );

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (height, width) = raster.dim();
    let mut dataset = driver.create_with_band_type::<f32, _>(
        output_path.as_ref(),
        width as isize,
        height as isize,
        1,
    )?;

    dataset.set_geo_transform(&raster.geo_transform.to_gdal())?;
    dataset.set_spatial_ref(&gdal::spatial_ref::SpatialRef::from_epsg(OUTPUT_EPSG)?)?;
    dataset.set_metadata_item("INDEX", raster.index.name(), "")?;
    if let Some(date) = raster.date {
        dataset.set_metadata_item("ACQUISITION_DATE", &date.to_string(), "")?;
    }

    let mut band = dataset.rasterband(1)?;
    let flat: Vec<f32> = raster.data.iter().copied().collect();
    let buffer = gdal::raster::Buffer::new((width, height), flat);
    band.write((0, 0), (width, height), &buffer)?;
    band.set_no_data_value(Some(f32::NAN as f64))?;

    if let Some(compression_type) = compression {
        dataset.set_metadata_item("COMPRESS", compression_type, "")?;
    }

    log::debug!("GeoTIFF written: {}x{}", width, height);
    Ok(())
}

/// Read back a raster written by [`write_geotiff`]
pub fn read_geotiff<P: AsRef<Path>>(path: P) -> CanopyResult<IndexRaster> {
    let dataset = Dataset::open(path.as_ref())?;
    let gt = dataset.geo_transform()?;
    let (width, height) = dataset.raster_size();

    let index: VegetationIndex = dataset
        .metadata_item("INDEX", "")
        .ok_or_else(|| CanopyError::Processing("GeoTIFF has no INDEX metadata".to_string()))?
        .parse()?;
    let date = dataset
        .metadata_item("ACQUISITION_DATE", "")
        .and_then(|d| crate::types::parse_date(&d).ok());

    let band = dataset.rasterband(1)?;
    let buffer = band.read_as::<f32>((0, 0), (width, height), (width, height), None)?;
    let data = Array2::from_shape_vec((height, width), buffer.data)
        .map_err(|e| CanopyError::Processing(format!("Failed to reshape GeoTIFF data: {}", e)))?;

    Ok(IndexRaster {
        index,
        data,
        geo_transform: GeoTransform {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        },
        date,
    })
}
