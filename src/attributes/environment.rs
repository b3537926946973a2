use std::collections::HashSet;

use super::{is_valid_value, FlatAttributeMap};

const KEPT_PREFIXES: [&str; 5] = ["CI", "GIT", "GLAB", "NEW", "OTEL"];

const SENSITIVE_VARIABLES: [&str; 19] = [
    "NEW_RELIC_API_KEY",
    "GITLAB_FEATURES",
    "CI_SERVER_TLS_CA_FILE",
    "CI_RUNNER_TAGS",
    "CI_JOB_JWT",
    "CI_JOB_JWT_V1",
    "CI_JOB_JWT_V2",
    "GLAB_TOKEN",
    "GIT_ASKPASS",
    "CI_COMMIT_BEFORE_SHA",
    "CI_BUILD_TOKEN",
    "CI_DEPENDENCY_PROXY_PASSWORD",
    "CI_RUNNER_SHORT_TOKEN",
    "CI_BUILD_BEFORE_SHA",
    "CI_BEFORE_SHA",
    "OTEL_EXPORTER_OTEL_ENDPOINT",
    "GLAB_EXPORT_PATHS",
    "GLAB_EXPORT_PATHS_ALL",
    "GLAB_EXPORT_PROJECTS_REGEX",
];

/// Selects the CI environment variables worth attaching to spans.
///
/// Keeps `CI*`, `GIT*`, `GLAB*`, `NEW*` and `OTEL*` variables, minus secrets
/// and the user-supplied `dropped` names. The input is never modified.
pub fn environment_attributes<I>(vars: I, dropped: &HashSet<String>) -> FlatAttributeMap
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut attributes: FlatAttributeMap = vars
        .into_iter()
        .filter(|(name, value)| {
            KEPT_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
                && !SENSITIVE_VARIABLES.contains(&name.as_str())
                && !dropped.contains(name)
                && is_valid_value(value)
        })
        .collect();

    attributes.sort_keys();
    attributes
}
