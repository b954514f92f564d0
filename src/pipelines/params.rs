//! Operation catalog and parameter validation
//!
//! Every `(modality, operation)` pair the service accepts is described here.
//! `OperationSpec::parse` turns a submission's raw parameter map into a typed
//! spec or a `ValidationError`; the raw map itself still travels to the
//! compute service untouched, so optional tuning knobs we do not model are
//! passed through rather than stripped.

use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::types::Modality;

const LIDAR_PRODUCTS: [&str; 5] = ["dem", "dsm", "chm", "contours", "intensity"];
const DESPECKLE_FILTERS: [&str; 3] = ["lee", "frost", "gamma_map"];

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("unsupported operation for {modality}: {operation}")]
    InvalidOperation {
        modality: Modality,
        operation: String,
    },

    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("at least {required} {noun} required")]
    InsufficientInputs {
        required: usize,
        noun: &'static str,
    },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidOperation { .. } => "INVALID_OPERATION",
            ValidationError::MissingParameter(_) => "MISSING_PARAMETER",
            ValidationError::InvalidParameter { .. } => "INVALID_PARAMETER",
            ValidationError::InsufficientInputs { .. } => "INSUFFICIENT_INPUTS",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LidarProcessParams {
    /// Raster products to derive, from the `operations` parameter.
    pub products: Vec<String>,
    pub resolution: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpectralUnmixParams {
    pub endmembers: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpectralIdentifyParams {
    pub library: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpectralIndicesParams {
    pub indices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RadarDespeckleParams {
    pub filter: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThermalAnomalyParams {
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThermalHeatmapParams {
    pub colormap: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThermalSegmentParams {
    pub zones: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionStrategy {
    Pixel,
    #[default]
    Feature,
    Decision,
}

impl FusionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionStrategy::Pixel => "pixel",
            FusionStrategy::Feature => "feature",
            FusionStrategy::Decision => "decision",
        }
    }
}

impl fmt::Display for FusionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FusionStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pixel" => Ok(FusionStrategy::Pixel),
            "feature" => Ok(FusionStrategy::Feature),
            "decision" => Ok(FusionStrategy::Decision),
            other => Err(ValidationError::InvalidParameter {
                name: "strategy",
                reason: format!("unknown strategy {other}, expected pixel, feature or decision"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionFuseParams {
    pub strategy: FusionStrategy,
    /// Modality of each source ref, in submission order.
    pub modalities: Vec<Modality>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionReportParams {
    /// References to previously completed analysis artifacts.
    pub analyses: Vec<String>,
    pub format: String,
}

/// A validated `(modality, operation)` with its typed parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationSpec {
    LidarProcess(LidarProcessParams),
    LidarClassify,
    SpectralUnmix(SpectralUnmixParams),
    SpectralIdentify(SpectralIdentifyParams),
    SpectralIndices(SpectralIndicesParams),
    RadarInterferometry,
    RadarChangeDetection,
    RadarDespeckle(RadarDespeckleParams),
    ThermalAnomalies(ThermalAnomalyParams),
    ThermalHeatmap(ThermalHeatmapParams),
    ThermalSegment(ThermalSegmentParams),
    FusionFuse(FusionFuseParams),
    FusionReport(FusionReportParams),
}

impl OperationSpec {
    pub fn parse(
        modality: Modality,
        operation: &str,
        params: &Map<String, Value>,
    ) -> Result<Self, ValidationError> {
        match (modality, operation) {
            (Modality::Lidar, "process") => {
                let products = opt_str_list(params, "operations")?
                    .unwrap_or_else(|| vec!["dem".to_string(), "dsm".to_string()]);
                for product in &products {
                    if !LIDAR_PRODUCTS.contains(&product.as_str()) {
                        return Err(ValidationError::InvalidParameter {
                            name: "operations",
                            reason: format!(
                                "unknown product {product}, expected one of {}",
                                LIDAR_PRODUCTS.join(", ")
                            ),
                        });
                    }
                }
                let resolution = positive_f64(params, "resolution", 1.0)?;
                Ok(OperationSpec::LidarProcess(LidarProcessParams {
                    products,
                    resolution,
                }))
            }
            (Modality::Lidar, "classify") => Ok(OperationSpec::LidarClassify),
            (Modality::Spectral, "unmix") => {
                let endmembers = u32_param(params, "endmembers", 5)?;
                if endmembers < 2 {
                    return Err(ValidationError::InvalidParameter {
                        name: "endmembers",
                        reason: "must be at least 2".to_string(),
                    });
                }
                Ok(OperationSpec::SpectralUnmix(SpectralUnmixParams {
                    endmembers,
                }))
            }
            (Modality::Spectral, "identify") => {
                let library = str_param(params, "library")
                    .unwrap_or("usgs")
                    .to_string();
                Ok(OperationSpec::SpectralIdentify(SpectralIdentifyParams {
                    library,
                }))
            }
            (Modality::Spectral, "indices") => {
                let indices = require_str_list(params, "indices")?;
                Ok(OperationSpec::SpectralIndices(SpectralIndicesParams {
                    indices,
                }))
            }
            (Modality::Radar, "interferometry") => Ok(OperationSpec::RadarInterferometry),
            (Modality::Radar, "change_detection") => Ok(OperationSpec::RadarChangeDetection),
            (Modality::Radar, "despeckle") => {
                let filter = str_param(params, "filter").unwrap_or("lee").to_string();
                if !DESPECKLE_FILTERS.contains(&filter.as_str()) {
                    return Err(ValidationError::InvalidParameter {
                        name: "filter",
                        reason: format!(
                            "unknown filter {filter}, expected one of {}",
                            DESPECKLE_FILTERS.join(", ")
                        ),
                    });
                }
                Ok(OperationSpec::RadarDespeckle(RadarDespeckleParams {
                    filter,
                }))
            }
            (Modality::Thermal, "detect_anomalies") => {
                let threshold = positive_f64(params, "threshold", 2.0)?;
                Ok(OperationSpec::ThermalAnomalies(ThermalAnomalyParams {
                    threshold,
                }))
            }
            (Modality::Thermal, "heatmap") => {
                let colormap = str_param(params, "colormap").unwrap_or("inferno").to_string();
                Ok(OperationSpec::ThermalHeatmap(ThermalHeatmapParams {
                    colormap,
                }))
            }
            (Modality::Thermal, "segment") => {
                let zones = u32_param(params, "zones", 5)?;
                if zones == 0 {
                    return Err(ValidationError::InvalidParameter {
                        name: "zones",
                        reason: "must be positive".to_string(),
                    });
                }
                Ok(OperationSpec::ThermalSegment(ThermalSegmentParams {
                    zones,
                }))
            }
            (Modality::Fusion, "fuse") => {
                let strategy = match str_param(params, "strategy") {
                    Some(raw) => raw.parse()?,
                    None => FusionStrategy::default(),
                };
                let modalities = require_str_list(params, "modalities")?
                    .iter()
                    .map(|raw| {
                        raw.parse::<Modality>().map_err(|_| {
                            ValidationError::InvalidParameter {
                                name: "modalities",
                                reason: format!("unknown modality {raw}"),
                            }
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(OperationSpec::FusionFuse(FusionFuseParams {
                    strategy,
                    modalities,
                }))
            }
            (Modality::Fusion, "report") => {
                let analyses = require_str_list(params, "analyses")?;
                let format = str_param(params, "format").unwrap_or("markdown").to_string();
                Ok(OperationSpec::FusionReport(FusionReportParams {
                    analyses,
                    format,
                }))
            }
            (modality, operation) => Err(ValidationError::InvalidOperation {
                modality,
                operation: operation.to_string(),
            }),
        }
    }

    /// Endpoint path on the compute service.
    pub fn compute_path(&self) -> &'static str {
        match self {
            OperationSpec::LidarProcess(_) => "/lidar/process",
            OperationSpec::LidarClassify => "/lidar/classify",
            OperationSpec::SpectralUnmix(_) => "/spectral/unmix",
            OperationSpec::SpectralIdentify(_) => "/spectral/identify",
            OperationSpec::SpectralIndices(_) => "/spectral/indices",
            OperationSpec::RadarInterferometry => "/sar/interferometry",
            OperationSpec::RadarChangeDetection => "/sar/change_detection",
            OperationSpec::RadarDespeckle(_) => "/sar/despeckle",
            OperationSpec::ThermalAnomalies(_) => "/thermal/detect_anomalies",
            OperationSpec::ThermalHeatmap(_) => "/thermal/heatmap",
            OperationSpec::ThermalSegment(_) => "/thermal/segment",
            OperationSpec::FusionFuse(_) => "/fusion/fuse",
            OperationSpec::FusionReport(_) => "/fusion/report",
        }
    }

    pub fn required_inputs(&self) -> usize {
        match self {
            OperationSpec::RadarInterferometry
            | OperationSpec::RadarChangeDetection
            | OperationSpec::FusionFuse(_) => 2,
            // The report operation reads prior analyses, not source imagery.
            OperationSpec::FusionReport(_) => 0,
            _ => 1,
        }
    }

    fn input_noun(&self) -> &'static str {
        match self {
            OperationSpec::RadarInterferometry | OperationSpec::RadarChangeDetection => "images",
            OperationSpec::FusionFuse(_) => "inputs",
            _ => "input",
        }
    }

    /// Validate the number of submitted source refs against this operation,
    /// including the fuse-specific alignment rules.
    pub fn check_inputs(&self, count: usize) -> Result<(), ValidationError> {
        let required = self.required_inputs();
        if count < required {
            return Err(ValidationError::InsufficientInputs {
                required,
                noun: self.input_noun(),
            });
        }
        if let OperationSpec::FusionFuse(params) = self {
            if params.modalities.len() != count {
                return Err(ValidationError::InvalidParameter {
                    name: "modalities",
                    reason: format!(
                        "{} entries do not match {} source refs",
                        params.modalities.len(),
                        count
                    ),
                });
            }
            let mut distinct: Vec<Modality> = params.modalities.clone();
            distinct.sort_by_key(|m| m.as_str());
            distinct.dedup();
            if distinct.len() < 2 {
                return Err(ValidationError::InvalidParameter {
                    name: "modalities",
                    reason: "fusion needs at least 2 distinct modalities".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn str_param<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn opt_str_list(
    params: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<Vec<String>>, ValidationError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(Some(coerce_str_list(value, key)?)),
    }
}

fn require_str_list(
    params: &Map<String, Value>,
    key: &'static str,
) -> Result<Vec<String>, ValidationError> {
    match params.get(key) {
        None | Some(Value::Null) => Err(ValidationError::MissingParameter(key)),
        Some(value) => {
            let list = coerce_str_list(value, key)?;
            if list.is_empty() {
                return Err(ValidationError::InvalidParameter {
                    name: key,
                    reason: "must not be empty".to_string(),
                });
            }
            Ok(list)
        }
    }
}

fn coerce_str_list(value: &Value, key: &'static str) -> Result<Vec<String>, ValidationError> {
    let Some(items) = value.as_array() else {
        return Err(ValidationError::InvalidParameter {
            name: key,
            reason: "expected an array of strings".to_string(),
        });
    };
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                ValidationError::InvalidParameter {
                    name: key,
                    reason: "expected an array of strings".to_string(),
                }
            })
        })
        .collect()
}

fn positive_f64(
    params: &Map<String, Value>,
    key: &'static str,
    default: f64,
) -> Result<f64, ValidationError> {
    let value = match params.get(key) {
        None | Some(Value::Null) => return Ok(default),
        Some(value) => value.as_f64().ok_or_else(|| ValidationError::InvalidParameter {
            name: key,
            reason: "expected a number".to_string(),
        })?,
    };
    if value <= 0.0 || !value.is_finite() {
        return Err(ValidationError::InvalidParameter {
            name: key,
            reason: "must be positive".to_string(),
        });
    }
    Ok(value)
}

fn u32_param(
    params: &Map<String, Value>,
    key: &'static str,
    default: u32,
) -> Result<u32, ValidationError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ValidationError::InvalidParameter {
                name: key,
                reason: "expected a non-negative integer".to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_lidar_process_defaults() {
        let spec = OperationSpec::parse(Modality::Lidar, "process", &Map::new()).unwrap();
        let OperationSpec::LidarProcess(params) = spec else {
            panic!("wrong spec");
        };
        assert_eq!(params.products, vec!["dem", "dsm"]);
        assert_eq!(params.resolution, 1.0);
    }

    #[test]
    fn test_lidar_process_rejects_unknown_product() {
        let params = map(serde_json::json!({"operations": ["dem", "bathymetry"]}));
        let err = OperationSpec::parse(Modality::Lidar, "process", &params).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETER");
        assert!(err.to_string().contains("bathymetry"));
    }

    #[test]
    fn test_negative_resolution_rejected() {
        let params = map(serde_json::json!({"resolution": -0.5}));
        let err = OperationSpec::parse(Modality::Lidar, "process", &params).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidParameter {
                name: "resolution",
                ..
            }
        ));
    }

    #[test]
    fn test_unsupported_operation() {
        let err = OperationSpec::parse(Modality::Thermal, "unmix", &Map::new()).unwrap_err();
        assert_eq!(err.code(), "INVALID_OPERATION");
        assert_eq!(
            err.to_string(),
            "unsupported operation for thermal: unmix"
        );
    }

    #[test]
    fn test_spectral_indices_requires_list() {
        let err = OperationSpec::parse(Modality::Spectral, "indices", &Map::new()).unwrap_err();
        assert_eq!(err.code(), "MISSING_PARAMETER");
        assert_eq!(err.to_string(), "missing required parameter: indices");

        let params = map(serde_json::json!({"indices": "ndvi"}));
        let err = OperationSpec::parse(Modality::Spectral, "indices", &params).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETER");

        let params = map(serde_json::json!({"indices": ["ndvi", "ndwi"]}));
        let spec = OperationSpec::parse(Modality::Spectral, "indices", &params).unwrap();
        assert_eq!(spec.compute_path(), "/spectral/indices");
    }

    #[test]
    fn test_despeckle_filter_catalog() {
        let params = map(serde_json::json!({"filter": "frost"}));
        let spec = OperationSpec::parse(Modality::Radar, "despeckle", &params).unwrap();
        assert!(matches!(spec, OperationSpec::RadarDespeckle(p) if p.filter == "frost"));

        let params = map(serde_json::json!({"filter": "median"}));
        let err = OperationSpec::parse(Modality::Radar, "despeckle", &params).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETER");
    }

    #[test]
    fn test_interferometry_needs_two_images() {
        let spec = OperationSpec::parse(Modality::Radar, "interferometry", &Map::new()).unwrap();
        assert_eq!(spec.required_inputs(), 2);

        let err = spec.check_inputs(1).unwrap_err();
        assert_eq!(err.to_string(), "at least 2 images required");
        assert_eq!(err.code(), "INSUFFICIENT_INPUTS");
        assert!(spec.check_inputs(2).is_ok());
    }

    #[test]
    fn test_fuse_modalities_must_align_with_inputs() {
        let params = map(serde_json::json!({"modalities": ["lidar", "thermal"]}));
        let spec = OperationSpec::parse(Modality::Fusion, "fuse", &params).unwrap();
        assert!(spec.check_inputs(2).is_ok());
        assert!(matches!(
            spec.check_inputs(3).unwrap_err(),
            ValidationError::InvalidParameter {
                name: "modalities",
                ..
            }
        ));
        assert_eq!(
            spec.check_inputs(1).unwrap_err().to_string(),
            "at least 2 inputs required"
        );
    }

    #[test]
    fn test_fuse_requires_distinct_modalities() {
        let params = map(serde_json::json!({"modalities": ["lidar", "lidar"]}));
        let spec = OperationSpec::parse(Modality::Fusion, "fuse", &params).unwrap();
        let err = spec.check_inputs(2).unwrap_err();
        assert!(err.to_string().contains("distinct"));
    }

    #[test]
    fn test_fuse_accepts_modality_aliases() {
        let params = map(serde_json::json!({
            "strategy": "decision",
            "modalities": ["hyperspectral", "sar"]
        }));
        let spec = OperationSpec::parse(Modality::Fusion, "fuse", &params).unwrap();
        let OperationSpec::FusionFuse(params) = spec else {
            panic!("wrong spec");
        };
        assert_eq!(params.strategy, FusionStrategy::Decision);
        assert_eq!(params.modalities, vec![Modality::Spectral, Modality::Radar]);
    }

    #[test]
    fn test_report_reads_prior_analyses() {
        let err = OperationSpec::parse(Modality::Fusion, "report", &Map::new()).unwrap_err();
        assert_eq!(err.to_string(), "missing required parameter: analyses");

        let params = map(serde_json::json!({"analyses": ["s3://b/jobs/1/analysis.json"]}));
        let spec = OperationSpec::parse(Modality::Fusion, "report", &params).unwrap();
        assert_eq!(spec.required_inputs(), 0);
        assert!(spec.check_inputs(0).is_ok());
    }

    #[test]
    fn test_thermal_segment_zone_floor() {
        let params = map(serde_json::json!({"zones": 0}));
        let err = OperationSpec::parse(Modality::Thermal, "segment", &params).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidParameter { name: "zones", .. }
        ));
    }

    #[test]
    fn test_spectral_unmix_endmember_floor() {
        let params = map(serde_json::json!({"endmembers": 1}));
        let err = OperationSpec::parse(Modality::Spectral, "unmix", &params).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETER");

        let spec = OperationSpec::parse(Modality::Spectral, "unmix", &Map::new()).unwrap();
        assert!(matches!(
            spec,
            OperationSpec::SpectralUnmix(SpectralUnmixParams { endmembers: 5 })
        ));
    }
}
