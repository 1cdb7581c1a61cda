use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a generated code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CodeStatus {
    Generated,
    Active,
    Consumed,
    Inactive,
}

impl CodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeStatus::Generated => "generated",
            CodeStatus::Active => "active",
            CodeStatus::Consumed => "consumed",
            CodeStatus::Inactive => "inactive",
        }
    }

    pub fn parse_status(value: &str) -> Option<Self> {
        match value {
            "generated" => Some(CodeStatus::Generated),
            "active" => Some(CodeStatus::Active),
            "consumed" => Some(CodeStatus::Consumed),
            "inactive" => Some(CodeStatus::Inactive),
            _ => None,
        }
    }
}

/// One code document as persisted in a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeRecord {
    pub id: String,
    pub value: String,
    pub batch: String,
    pub sequence: String,
    pub status: CodeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CodeRecord {
    /// Swap in a freshly generated code value. Identity (`id`) is kept.
    pub fn replace_value(&mut self, value: String) {
        self.value = value;
        self.updated_at = Utc::now();
    }
}

/// Request accepted by the trigger layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationRequest {
    pub total_count: u64,
    pub code_length: usize,
    pub batch: String,
    pub sequence: String,
}

/// One entry of the batch plan derived from a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchPlanEntry {
    pub batch_index: u64,
    pub size: u64,
}

/// Split `total_count` into batches of `batch_size`, the last one holding the remainder.
pub fn plan_batches(total_count: u64, batch_size: u64) -> Vec<BatchPlanEntry> {
    if total_count == 0 || batch_size == 0 {
        return Vec::new();
    }
    let total_batches = total_count.div_ceil(batch_size);
    (0..total_batches)
        .map(|i| {
            let size = if i == total_batches - 1 {
                total_count - i * batch_size
            } else {
                batch_size
            };
            BatchPlanEntry {
                batch_index: i,
                size,
            }
        })
        .collect()
}

/// Throughput captured for one container before the raise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThroughputSnapshot {
    pub container_id: String,
    pub original_max_throughput: Option<u32>,
}

/// Which record field a container partitions on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKeyPath {
    Value,
    Batch,
}

/// Storage key of a record inside one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemKey {
    pub partition_key: String,
    pub item_key: String,
}

impl PartitionKeyPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionKeyPath::Value => "value",
            PartitionKeyPath::Batch => "batch",
        }
    }

    pub fn partition_key<'a>(&self, record: &'a CodeRecord) -> &'a str {
        match self {
            PartitionKeyPath::Value => &record.value,
            PartitionKeyPath::Batch => &record.batch,
        }
    }

    /// The code value is unique per container for `Value`, per batch partition for `Batch`.
    pub fn item_key(&self, record: &CodeRecord) -> ItemKey {
        ItemKey {
            partition_key: self.partition_key(record).to_string(),
            item_key: record.value.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(plan: &[BatchPlanEntry]) -> Vec<u64> {
        plan.iter().map(|e| e.size).collect()
    }

    #[test]
    fn plan_splits_remainder_into_last_batch() {
        let plan = plan_batches(25_000, 10_000);
        assert_eq!(sizes(&plan), vec![10_000, 10_000, 5_000]);
        assert_eq!(plan[2].batch_index, 2);
    }

    #[test]
    fn plan_single_small_batch() {
        assert_eq!(sizes(&plan_batches(1, 10_000)), vec![1]);
    }

    #[test]
    fn plan_exact_multiple_has_no_empty_tail() {
        assert_eq!(sizes(&plan_batches(20_000, 10_000)), vec![10_000, 10_000]);
        assert!(plan_batches(0, 10_000).is_empty());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            CodeStatus::Generated,
            CodeStatus::Active,
            CodeStatus::Consumed,
            CodeStatus::Inactive,
        ] {
            assert_eq!(CodeStatus::parse_status(s.as_str()), Some(s));
        }
        assert_eq!(CodeStatus::parse_status("bogus"), None);
    }

    #[test]
    fn partition_key_follows_path() {
        let now = Utc::now();
        let record = CodeRecord {
            id: "id-1".into(),
            value: "ABC123".into(),
            batch: "B1".into(),
            sequence: "S1".into(),
            status: CodeStatus::Generated,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(PartitionKeyPath::Value.partition_key(&record), "ABC123");
        let key = PartitionKeyPath::Batch.item_key(&record);
        assert_eq!(key.partition_key, "B1");
        assert_eq!(key.item_key, "ABC123");
    }
}
