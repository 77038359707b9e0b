use serde::{Deserialize, Serialize};

use crate::codec::WireCodec;
use crate::error::CodecError;
use crate::types::ConfigRecord;

/// Flattened storage row for a node configuration.
///
/// Relational stores keep the scalar settings as columns and the nested
/// lists as JSON text. An empty column means an empty list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDbRow {
    pub node_secret: String,
    pub pull_interval: i64,
    pub push_interval: i64,
    pub traffic_report_threshold: i64,
    pub ip_strategy: String,
    pub dns: String,
    pub block: String,
    pub outbound: String,
}

impl ConfigRecord {
    /// Flatten into a storage row.
    pub fn to_db_row(&self) -> Result<NodeDbRow, CodecError> {
        Ok(NodeDbRow {
            node_secret: self.node_secret.clone(),
            pull_interval: self.pull_interval,
            push_interval: self.push_interval,
            traffic_report_threshold: self.traffic_report_threshold,
            ip_strategy: self.ip_strategy.clone(),
            dns: serde_json::to_string(&self.dns)?,
            block: serde_json::to_string(&self.block)?,
            outbound: serde_json::to_string(&self.outbound)?,
        })
    }

    /// Rebuild a record from a storage row and validate it.
    pub fn from_db_row(row: &NodeDbRow) -> Result<Self, CodecError> {
        let record = Self {
            node_secret: row.node_secret.clone(),
            pull_interval: row.pull_interval,
            push_interval: row.push_interval,
            traffic_report_threshold: row.traffic_report_threshold,
            ip_strategy: row.ip_strategy.clone(),
            dns: json_column(&row.dns)?,
            block: json_column(&row.block)?,
            outbound: json_column(&row.outbound)?,
        };
        record.validate()?;
        Ok(record)
    }
}

fn json_column<T>(column: &str) -> Result<Vec<T>, CodecError>
where
    T: serde::de::DeserializeOwned,
{
    let column = column.trim();
    if column.is_empty() || column == "null" {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(column)?)
}
