//! Platform access and file formats

pub mod archive;
pub mod geojson;
pub mod http;
pub mod platform;

#[cfg(feature = "gdal")]
pub mod export;

pub use archive::ArchivePlatform;
pub use http::HttpPlatform;
pub use platform::{ExportFormat, ExportParams, ImageryPlatform, PlatformClient, Reducer};
