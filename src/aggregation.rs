// Aggregation
// Group-by over the filtered result set of a query: by field value or
// by time bucket, with an optional second grouping level, percentages
// over the filtered total and top-N truncation.

use anyhow::Result;
use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::query_engine::{QueryEngine, QueryOptions};
use crate::query_parser::Query;
use crate::store::Tables;
use crate::types::{NodeId, NormalizedName};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Period {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(Period::Day),
            "week" => Some(Period::Week),
            "month" => Some(Period::Month),
            "quarter" => Some(Period::Quarter),
            "year" => Some(Period::Year),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateField {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Field(String),
    TimeBucket { period: Period, date_field: DateField },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub group_by: GroupBy,
    /// Optional second level; its counts nest under each first-level
    /// group.
    pub second_group: Option<GroupBy>,
    pub show_percent: bool,
    pub top: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRow {
    pub key: String,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<GroupRow>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub groups: Vec<GroupRow>,
    /// Total nodes in the filtered set (percent base).
    pub total: usize,
    pub warnings: Vec<String>,
}

/// Key used when a node has no value for the grouping field or date.
const MISSING_KEY: &str = "(none)";

/// Run the aggregation over everything the query matches. Paging on
/// the query is ignored; aggregation is over the full filtered set.
pub fn aggregate(
    engine: &QueryEngine,
    query: &Query,
    spec: &AggregateSpec,
    opts: &QueryOptions,
) -> Result<AggregateResult> {
    let (tables, ids) = engine.filter_ids(query, opts)?;
    let total = ids.len();

    let mut buckets: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
    for id in ids {
        let key = group_key(&tables, &id, &spec.group_by);
        buckets.entry(key).or_default().push(id);
    }

    let mut groups: Vec<GroupRow> = buckets
        .into_iter()
        .map(|(key, members)| {
            let children = spec.second_group.as_ref().map(|second| {
                let mut nested: BTreeMap<String, usize> = BTreeMap::new();
                for id in &members {
                    *nested.entry(group_key(&tables, id, second)).or_default() += 1;
                }
                let mut rows: Vec<GroupRow> = nested
                    .into_iter()
                    .map(|(key, count)| GroupRow {
                        key,
                        count,
                        percent: None,
                        children: None,
                    })
                    .collect();
                sort_groups(&mut rows);
                rows
            });
            GroupRow {
                key,
                count: members.len(),
                percent: if spec.show_percent && total > 0 {
                    Some(round1(members.len() as f64 * 100.0 / total as f64))
                } else {
                    None
                },
                children,
            }
        })
        .collect();
    sort_groups(&mut groups);

    let mut warnings = Vec::new();
    if let Some(top) = spec.top {
        if groups.len() > top {
            warnings.push(format!(
                "showing top {top} of {} groups; {} truncated",
                groups.len(),
                groups.len() - top
            ));
            groups.truncate(top);
        }
    }

    Ok(AggregateResult {
        groups,
        total,
        warnings,
    })
}

/// Largest groups first, key as the tie-break.
fn sort_groups(groups: &mut [GroupRow]) {
    groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn group_key(tables: &Tables, id: &NodeId, group_by: &GroupBy) -> String {
    match group_by {
        GroupBy::Field(field) => {
            let wanted = NormalizedName::of(field.strip_prefix("fields.").unwrap_or(field));
            tables
                .field_values_of(id)
                .find(|row| NormalizedName::of(&row.field_name) == wanted)
                .and_then(|row| row.value_text.clone())
                .unwrap_or_else(|| MISSING_KEY.to_string())
        }
        GroupBy::TimeBucket { period, date_field } => {
            let node = tables.node(id);
            let ms = node.and_then(|n| match date_field {
                DateField::Created => n.created,
                DateField::Updated => n.updated,
            });
            match ms {
                None => MISSING_KEY.to_string(),
                Some(ms) => bucket_label(ms, period),
            }
        }
    }
}

/// Stable textual bucket labels that also sort chronologically.
pub fn bucket_label(epoch_ms: i64, period: &Period) -> String {
    let dt = match Utc.timestamp_millis_opt(epoch_ms).single() {
        Some(dt) => dt,
        None => return MISSING_KEY.to_string(),
    };
    match period {
        Period::Day => dt.format("%Y-%m-%d").to_string(),
        Period::Week => {
            let week = dt.iso_week();
            format!("{}-W{:02}", week.year(), week.week())
        }
        Period::Month => dt.format("%Y-%m").to_string(),
        Period::Quarter => format!("{}-Q{}", dt.year(), (dt.month() - 1) / 3 + 1),
        Period::Year => dt.year().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_labels() {
        // 2025-11-05T10:00:00Z
        let ms = 1_762_336_800_000;
        assert_eq!(bucket_label(ms, &Period::Day), "2025-11-05");
        assert_eq!(bucket_label(ms, &Period::Month), "2025-11");
        assert_eq!(bucket_label(ms, &Period::Quarter), "2025-Q4");
        assert_eq!(bucket_label(ms, &Period::Year), "2025");
        assert_eq!(bucket_label(ms, &Period::Week), "2025-W45");
    }

    #[test]
    fn group_sorting_is_count_then_key() {
        let mut groups = vec![
            GroupRow {
                key: "b".into(),
                count: 2,
                percent: None,
                children: None,
            },
            GroupRow {
                key: "a".into(),
                count: 2,
                percent: None,
                children: None,
            },
            GroupRow {
                key: "c".into(),
                count: 5,
                percent: None,
                children: None,
            },
        ];
        sort_groups(&mut groups);
        let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn percent_rounding() {
        assert_eq!(round1(33.333), 33.3);
        assert_eq!(round1(66.666), 66.7);
    }
}
