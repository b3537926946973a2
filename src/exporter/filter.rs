use std::collections::HashSet;

use log::debug;

use crate::providers::ExecutionRecord;

/// Stages the exporter itself runs in. Their jobs are never exported.
const EXPORTER_STAGES: [&str; 2] = ["new-relic-exporter", "new-relic-metrics-exporter"];

/// Job/bridge names and stage names that must not be exported.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    names: HashSet<String>,
}

impl ExclusionSet {
    pub fn new(entries: &[String]) -> Self {
        let names = entries
            .iter()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { names }
    }

    /// Matches on the lowercased name or stage.
    pub fn is_excluded(&self, record: &ExecutionRecord) -> bool {
        let name = record.name().to_lowercase();
        let stage = record.stage().to_lowercase();

        EXPORTER_STAGES.contains(&stage.as_str())
            || self.names.contains(&name)
            || self.names.contains(&stage)
    }

    /// Splits `records` into the ones to export and the number excluded.
    pub fn filter(&self, records: Vec<ExecutionRecord>) -> (Vec<ExecutionRecord>, usize) {
        let total = records.len();
        let kept: Vec<_> = records
            .into_iter()
            .filter(|record| {
                let excluded = self.is_excluded(record);
                if excluded {
                    debug!("Excluding '{}' (stage '{}')", record.name(), record.stage());
                }
                !excluded
            })
            .collect();
        let excluded = total - kept.len();
        (kept, excluded)
    }
}
