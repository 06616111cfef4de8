use fanin_common::types::ProcessRecord;

const METRIC_SEGMENT: &str = "metric";
const META_SEGMENT: &str = "meta";

pub const VALUE_FIELD: &str = "value";
pub const SUM_FIELD: &str = "sum";
pub const COUNT_FIELD: &str = "count";
pub const TIMESTAMP_FIELD: &str = "ts";

/// `{prefix}:{process}:metric:{hash}` holds the numeric payload,
/// `{prefix}:{process}:meta:{hash}` the JSON series metadata.
#[derive(Debug, Clone)]
pub struct KeyScheme {
    prefix: String,
}

impl KeyScheme {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn metric_key(&self, process: &ProcessRecord, series_hash: &str) -> String {
        format!("{}:{}:{METRIC_SEGMENT}:{series_hash}", self.prefix, process.token())
    }

    pub fn meta_key(&self, process: &ProcessRecord, series_hash: &str) -> String {
        format!("{}:{}:{META_SEGMENT}:{series_hash}", self.prefix, process.token())
    }

    pub fn process_pattern(&self, process: &ProcessRecord) -> String {
        format!("{}:{}:*", self.prefix, process.token())
    }

    pub fn meta_pattern(&self) -> String {
        format!("{}:*:{META_SEGMENT}:*", self.prefix)
    }

    /// Splits a meta key back into its owner and series hash.
    pub fn parse_meta_key(&self, key: &str) -> Option<(ProcessRecord, String)> {
        let rest = key.strip_prefix(&self.prefix)?.strip_prefix(':')?;
        let mut parts = rest.split(':');
        let token = parts.next()?;
        let segment = parts.next()?;
        let hash = parts.next()?;
        if segment != META_SEGMENT || hash.is_empty() || parts.next().is_some() {
            return None;
        }
        Some((ProcessRecord::parse_token(token)?, hash.to_string()))
    }
}

pub fn bucket_field(index: usize) -> String {
    format!("b{index}")
}
