mod environment;
mod flatten;
mod metrics;
mod resource;
mod service_name;

use indexmap::IndexMap;

pub use environment::environment_attributes;
pub use flatten::AttributeFlattener;
pub use metrics::MetricsAttributeSelector;
pub use resource::ResourceAttributeBuilder;
pub use service_name::service_name;

/// Flat mapping of dotted/bracketed attribute path to string value.
///
/// Insertion order is preserved so exported attribute sets are deterministic.
pub type FlatAttributeMap = IndexMap<String, String>;

/// Values a telemetry backend must never receive.
pub(crate) fn is_valid_value(value: &str) -> bool {
    !value.is_empty() && value != "None"
}
