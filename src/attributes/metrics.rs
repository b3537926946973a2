use std::collections::HashSet;

use log::debug;

use super::FlatAttributeMap;

const DEFAULT_DIMENSIONS: [&str; 5] = ["service.name", "status", "stage", "name", "resource.name"];

/// Values and dimensions extracted from a flattened entity for metric export.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSelection {
    pub duration: f64,
    pub queued_duration: f64,
    pub dimensions: FlatAttributeMap,
}

/// Picks the metric values and the low-cardinality dimension subset out of a
/// flattened attribute map.
#[derive(Debug, Clone)]
pub struct MetricsAttributeSelector {
    dimensions: HashSet<String>,
}

impl MetricsAttributeSelector {
    /// `extra_dimensions` are added to the built-in dimension set.
    pub fn new(extra_dimensions: &[String]) -> Self {
        let dimensions = DEFAULT_DIMENSIONS
            .iter()
            .map(|d| (*d).to_string())
            .chain(extra_dimensions.iter().map(|d| d.trim().to_lowercase()))
            .filter(|d| !d.is_empty())
            .collect();

        Self { dimensions }
    }

    pub fn select(&self, attributes: &FlatAttributeMap) -> MetricSelection {
        let dimensions = attributes
            .iter()
            .filter(|(key, _)| self.dimensions.contains(&key.to_lowercase()))
            .map(|(key, value)| (key.to_lowercase(), value.clone()))
            .collect();

        MetricSelection {
            duration: parse_seconds(attributes, "duration"),
            queued_duration: parse_seconds(attributes, "queued_duration"),
            dimensions,
        }
    }
}

fn parse_seconds(attributes: &FlatAttributeMap, key: &str) -> f64 {
    attributes.get(key).map_or(0.0, |raw| {
        raw.parse::<f64>().unwrap_or_else(|_| {
            debug!("Ignoring non-numeric {key} value '{raw}'");
            0.0
        })
    })
}
