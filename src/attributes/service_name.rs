use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

static NON_SLUG_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"[^a-z0-9/]+").unwrap()
});

/// Derives the telemetry service name for a GitLab project.
///
/// Uses `name_with_namespace` with spaces removed, or the namespace slug
/// (`path_with_namespace`) when `take_namespace_slug` is set. Falls back to
/// `fallback` when the project carries neither.
pub fn service_name(project: &Map<String, Value>, take_namespace_slug: bool, fallback: &str) -> String {
    let field = |name: &str| {
        project
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let name = if take_namespace_slug {
        field("path_with_namespace")
            .or_else(|| field("name_with_namespace").map(|n| to_slug(&n)))
    } else {
        field("name_with_namespace").map(|n| n.to_lowercase().replace(' ', ""))
    };

    name.filter(|n| !n.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn to_slug(name_with_namespace: &str) -> String {
    let lowered = name_with_namespace.to_lowercase();
    let replaced = NON_SLUG_CHARS.replace_all(&lowered, "-");

    replaced
        .split('/')
        .map(|segment| segment.trim_matches('-'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
