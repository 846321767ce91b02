use crate::types::{CanopyError, CanopyResult};
use serde_json::{json, Value};

/// Outer ring of a GeoJSON Polygon, MultiPolygon (first polygon) or Feature
pub fn outer_ring(geometry: &Value) -> CanopyResult<Vec<[f64; 2]>> {
    let kind = geometry
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CanopyError::Validation("GeoJSON object has no type".to_string()))?;

    match kind {
        "Feature" => {
            let inner = geometry
                .get("geometry")
                .ok_or_else(|| CanopyError::Validation("Feature has no geometry".to_string()))?;
            outer_ring(inner)
        }
        "Polygon" => {
            let rings = coordinates(geometry)?;
            let ring = rings
                .first()
                .ok_or_else(|| CanopyError::Validation("Polygon has no rings".to_string()))?;
            parse_ring(ring)
        }
        "MultiPolygon" => {
            let polygons = coordinates(geometry)?;
            if polygons.len() > 1 {
                log::warn!(
                    "MultiPolygon with {} parts, using the first polygon only",
                    polygons.len()
                );
            }
            let ring = polygons
                .first()
                .and_then(Value::as_array)
                .and_then(|rings| rings.first())
                .ok_or_else(|| CanopyError::Validation("MultiPolygon has no rings".to_string()))?;
            parse_ring(ring)
        }
        other => Err(CanopyError::Validation(format!(
            "Unsupported AOI geometry type: {}",
            other
        ))),
    }
}

/// GeoJSON Polygon value for a closed ring
pub fn polygon_value(ring: &[[f64; 2]]) -> Value {
    let coords: Vec<Value> = ring.iter().map(|p| json!([p[0], p[1]])).collect();
    json!({
        "type": "Polygon",
        "coordinates": [coords],
    })
}

fn coordinates(geometry: &Value) -> CanopyResult<&Vec<Value>> {
    geometry
        .get("coordinates")
        .and_then(Value::as_array)
        .ok_or_else(|| CanopyError::Validation("Geometry has no coordinates array".to_string()))
}

fn parse_ring(ring: &Value) -> CanopyResult<Vec<[f64; 2]>> {
    let vertices = ring
        .as_array()
        .ok_or_else(|| CanopyError::Validation("Polygon ring must be an array".to_string()))?;

    vertices
        .iter()
        .map(|vertex| {
            let pair = vertex.as_array().filter(|v| v.len() >= 2).ok_or_else(|| {
                CanopyError::Validation(format!("Invalid ring vertex: {}", vertex))
            })?;
            match (pair[0].as_f64(), pair[1].as_f64()) {
                (Some(lon), Some(lat)) => Ok([lon, lat]),
                _ => Err(CanopyError::Validation(format!(
                    "Ring vertex must be numeric: {}",
                    vertex
                ))),
            }
        })
        .collect()
}
