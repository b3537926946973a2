use super::{is_valid_value, FlatAttributeMap};

const INSTRUMENTATION_NAME: &str = "gitlab-integration";
const SOURCE: &str = "gitlab-exporter";
const RESOURCE_TYPE: &str = "span";

/// Builds the resource attribute set attached to every span, log record and
/// metric emitted for one entity.
///
/// Seeds the service identity markers, overlays entity attributes (later
/// values win) and removes null-like values as the very last step.
#[derive(Debug, Clone)]
pub struct ResourceAttributeBuilder {
    attributes: FlatAttributeMap,
}

impl ResourceAttributeBuilder {
    pub fn new(service_name: &str) -> Self {
        let mut attributes = FlatAttributeMap::new();
        attributes.insert("service.name".to_string(), service_name.to_string());
        attributes.insert(
            "instrumentation.name".to_string(),
            INSTRUMENTATION_NAME.to_string(),
        );
        attributes.insert("gitlab.source".to_string(), SOURCE.to_string());
        attributes.insert("gitlab.resource.type".to_string(), RESOURCE_TYPE.to_string());

        Self { attributes }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value.into());
        self
    }

    /// Overlays `attributes`; a plain `name` key becomes `resource.name` so it
    /// cannot shadow the service identity.
    pub fn with_attributes(mut self, attributes: &FlatAttributeMap) -> Self {
        for (key, value) in attributes {
            self.insert(key, value.clone());
        }
        self
    }

    fn insert(&mut self, key: &str, value: String) {
        let key = if key == "name" { "resource.name" } else { key };
        self.attributes.insert(key.to_string(), value);
    }

    pub fn build(mut self) -> FlatAttributeMap {
        self.attributes.retain(|_, value| is_valid_value(value));
        self.attributes
    }

    /// `build(flat_attrs, service_name)` in one call.
    pub fn from_flat(attributes: &FlatAttributeMap, service_name: &str) -> FlatAttributeMap {
        Self::new(service_name).with_attributes(attributes).build()
    }
}
