// Query Engine
// Plans and executes parsed queries against one store snapshot. The
// planner resolves the target supertag and field references up front;
// evaluation then walks the candidate set with pure predicates. Unknown
// tags or fields yield empty results, never errors: a filter over a
// field the schema does not know simply matches nothing.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::contracts::{CancellationToken, Clock};
use crate::database::Database;
use crate::fts::FtsIndex;
use crate::query_parser::{
    Clause, DateUnit, Operator, OrderBy, Query, QueryValue, RelativeDate, WhereEntry,
};
use crate::schema::supertag_by_name_in;
use crate::store::{NodeRow, Store, Tables};
use crate::types::{NodeId, NormalizedName, ValidatedLimit};

const CANCEL_CHECK_INTERVAL: usize = 4096;

/// How raw matches are resolved before being returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    /// Climb to the nearest ancestor carrying any tag (default).
    Tagged,
    /// Climb to the nearest ancestor with a non-null name.
    Named,
    /// Return matches as-is.
    Raw,
}

impl Default for ResolutionMode {
    fn default() -> Self {
        ResolutionMode::Tagged
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub cancellation: CancellationToken,
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHit {
    pub id: NodeId,
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub created: Option<i64>,
    pub updated: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub hits: Vec<QueryHit>,
    /// Matches before paging.
    pub total_matched: usize,
    pub limit: usize,
    pub offset: usize,
}

/// A resolved full-text match: the semantically meaningful ancestor and
/// how many raw matches collapsed into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMatch {
    pub id: NodeId,
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub match_count: usize,
}

pub struct QueryEngine {
    store: Arc<Store>,
    fts: Arc<parking_lot::Mutex<FtsIndex>>,
    clock: Arc<dyn Clock>,
}

impl QueryEngine {
    pub fn new(db: &Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: db.store.clone(),
            fts: db.fts.clone(),
            clock,
        }
    }

    /// Execute a query with ordering and paging applied.
    pub fn execute(&self, query: &Query, opts: &QueryOptions) -> Result<QueryResult> {
        crate::observability::record_query();
        let (tables, mut ids) = self.filter_ids(query, opts)?;
        let total_matched = ids.len();

        sort_ids(&tables, &mut ids, query.order_by.as_ref());

        let limit = query
            .limit
            .map(ValidatedLimit::clamped)
            .unwrap_or_default()
            .get();
        let offset = query.offset.unwrap_or(0);
        let page: Vec<NodeId> = ids.into_iter().skip(offset).take(limit).collect();

        opts.cancellation.check()?;
        let hits = page
            .iter()
            .map(|id| build_hit(&tables, id, query.select.as_deref()))
            .collect();

        Ok(QueryResult {
            hits,
            total_matched,
            limit,
            offset,
        })
    }

    /// The filtered candidate set without ordering or paging; shared by
    /// `execute` and the aggregation path.
    pub fn filter_ids(
        &self,
        query: &Query,
        opts: &QueryOptions,
    ) -> Result<(Arc<Tables>, Vec<NodeId>)> {
        let tables = self.store.snapshot();

        let candidates: Vec<NodeId> = if query.find == "*" {
            tables.nodes.keys().cloned().collect()
        } else {
            match supertag_by_name_in(&tables, &query.find) {
                Some(tag) => tables.nodes_with_tag(&tag.id).to_vec(),
                // Unknown tag filters down to the empty result.
                None => Vec::new(),
            }
        };

        let planner = FieldPlanner::new(&tables);
        let now_ms = self.clock.now_ms();

        let mut out = Vec::new();
        for (i, id) in candidates.iter().enumerate() {
            if i % CANCEL_CHECK_INTERVAL == 0 {
                opts.cancellation.check()?;
            }
            let node = match tables.node(id) {
                Some(n) => n,
                None => continue,
            };
            if query
                .where_clauses
                .iter()
                .all(|entry| eval_entry(&tables, &planner, node, entry, now_ms))
            {
                out.push(id.clone());
            }
        }
        Ok((tables, out))
    }

    /// Full-text search over node names with ancestor resolution.
    pub fn search_names(
        &self,
        text: &str,
        mode: ResolutionMode,
        limit: ValidatedLimit,
        opts: &QueryOptions,
    ) -> Result<Vec<ResolvedMatch>> {
        crate::observability::record_query();
        let matches = self.fts.lock().search_substring(text);
        opts.cancellation.check()?;
        let tables = self.store.snapshot();
        let mut resolved = resolve_matches(&tables, &matches, mode);
        resolved.truncate(limit.get());
        Ok(resolved)
    }

    pub fn tables(&self) -> Arc<Tables> {
        self.store.snapshot()
    }
}

/// Resolve raw matches to ancestors per the requested mode, deduping
/// and counting collapsed matches. Matches with no qualifying ancestor
/// are dropped in the tagged/named modes.
pub fn resolve_matches(
    tables: &Tables,
    matches: &[NodeId],
    mode: ResolutionMode,
) -> Vec<ResolvedMatch> {
    let mut counts: HashMap<NodeId, usize> = HashMap::new();
    let mut order: Vec<NodeId> = Vec::new();

    for id in matches {
        let resolved = match mode {
            ResolutionMode::Raw => tables.node(id).map(|n| n.id.clone()),
            ResolutionMode::Tagged => tables.find_tagged_ancestor(id).map(|n| n.id.clone()),
            ResolutionMode::Named => tables.find_named_ancestor(id).map(|n| n.id.clone()),
        };
        if let Some(rid) = resolved {
            match counts.entry(rid.clone()) {
                std::collections::hash_map::Entry::Vacant(v) => {
                    v.insert(1);
                    order.push(rid);
                }
                std::collections::hash_map::Entry::Occupied(mut o) => {
                    *o.get_mut() += 1;
                }
            }
        }
    }

    let mut out: Vec<ResolvedMatch> = order
        .into_iter()
        .map(|id| {
            let node = tables.node(&id);
            ResolvedMatch {
                name: node.and_then(|n| n.name.clone()),
                tags: tables
                    .tags_of(&id)
                    .iter()
                    .map(|t| t.tag_name.clone())
                    .collect(),
                match_count: counts[&id],
                id,
            }
        })
        .collect();
    out.sort_by(|a, b| {
        b.match_count
            .cmp(&a.match_count)
            .then_with(|| a.id.cmp(&b.id))
    });
    out
}

/// Pre-resolved mapping from normalized field names to definition ids.
/// Built once per execution; shared by every candidate evaluation.
struct FieldPlanner {
    defs_by_name: HashMap<NormalizedName, HashSet<NodeId>>,
}

impl FieldPlanner {
    fn new(tables: &Tables) -> Self {
        let mut defs_by_name: HashMap<NormalizedName, HashSet<NodeId>> = HashMap::new();
        for fields in tables.supertag_fields.values() {
            for field in fields.values() {
                defs_by_name
                    .entry(field.normalized_name.clone())
                    .or_default()
                    .insert(field.field_label_id.clone());
            }
        }
        for (def_id, name) in &tables.field_names {
            defs_by_name
                .entry(NormalizedName::of(name))
                .or_default()
                .insert(def_id.clone());
        }
        Self { defs_by_name }
    }

    /// Definition ids matching a (possibly `fields.`-prefixed) name.
    /// `None` means the field is unknown to the schema entirely.
    fn resolve(&self, field: &str) -> Option<&HashSet<NodeId>> {
        let bare = field.strip_prefix("fields.").unwrap_or(field);
        self.defs_by_name.get(&NormalizedName::of(bare))
    }
}

fn eval_entry(
    tables: &Tables,
    planner: &FieldPlanner,
    node: &NodeRow,
    entry: &WhereEntry,
    now_ms: i64,
) -> bool {
    match entry {
        WhereEntry::Clause(c) => eval_clause(tables, planner, node, c, now_ms),
        WhereEntry::Or(group) => group
            .clauses
            .iter()
            .any(|c| eval_clause(tables, planner, node, c, now_ms)),
    }
}

/// The resolved left-hand side of a clause.
enum FieldRef {
    Date(Option<i64>),
    Text(Option<String>),
    List(Vec<String>),
    /// Field values plus whether the field exists in the schema at all.
    Values { texts: Vec<String>, known: bool },
}

fn resolve_field(
    tables: &Tables,
    planner: &FieldPlanner,
    node: &NodeRow,
    field: &str,
) -> FieldRef {
    match field {
        "id" => FieldRef::Text(Some(node.id.to_string())),
        "name" => FieldRef::Text(node.name.clone()),
        "created" => FieldRef::Date(node.created),
        "updated" => FieldRef::Date(node.updated),
        "done_at" | "done" => FieldRef::Date(node.done_at),
        "doc_type" | "doctype" => {
            FieldRef::Text(node.doc_type.as_ref().map(|d| d.as_str().to_string()))
        }
        "tags" => FieldRef::List(
            tables
                .tags_of(&node.id)
                .iter()
                .map(|t| t.tag_name.clone())
                .collect(),
        ),
        "parent.name" => FieldRef::Text(
            node.parent_id
                .as_ref()
                .and_then(|p| tables.node(p))
                .and_then(|p| p.name.clone()),
        ),
        "parent.tags" => FieldRef::List(
            node.parent_id
                .as_ref()
                .map(|p| {
                    tables
                        .tags_of(p)
                        .iter()
                        .map(|t| t.tag_name.clone())
                        .collect()
                })
                .unwrap_or_default(),
        ),
        other => {
            let defs = planner.resolve(other);
            let known = defs.is_some();
            let mut texts = Vec::new();
            if let Some(defs) = defs {
                for row in tables.field_values_of(&node.id) {
                    if defs.contains(&row.field_def_id) {
                        if let Some(text) = &row.value_text {
                            texts.push(text.clone());
                        }
                    }
                }
            }
            FieldRef::Values { texts, known }
        }
    }
}

fn eval_clause(
    tables: &Tables,
    planner: &FieldPlanner,
    node: &NodeRow,
    clause: &Clause,
    now_ms: i64,
) -> bool {
    let field = resolve_field(tables, planner, node, &clause.field);

    let result = match (&clause.operator, &field) {
        (Operator::Exists, FieldRef::Values { texts, known }) => *known && !texts.is_empty(),
        (Operator::Exists, FieldRef::Text(v)) => v.is_some(),
        (Operator::Exists, FieldRef::Date(v)) => v.is_some(),
        (Operator::Exists, FieldRef::List(v)) => !v.is_empty(),

        // is_empty allows missing values, but a field unknown to the
        // schema entirely still evaluates to false.
        (Operator::IsEmpty, FieldRef::Values { texts, known }) => *known && texts.is_empty(),
        (Operator::IsEmpty, FieldRef::Text(v)) => v.is_none(),
        (Operator::IsEmpty, FieldRef::Date(v)) => v.is_none(),
        (Operator::IsEmpty, FieldRef::List(v)) => v.is_empty(),

        (op, FieldRef::Date(stored)) => match stored {
            None => false,
            Some(ms) => compare_dates(*op, *ms, &clause.value, now_ms),
        },
        (op, FieldRef::Text(stored)) => match stored {
            None => false,
            Some(text) => compare_texts(*op, std::slice::from_ref(text), &clause.value),
        },
        (op, FieldRef::List(items)) => compare_texts(*op, items, &clause.value),
        (op, FieldRef::Values { texts, known }) => {
            *known && compare_texts(*op, texts, &clause.value)
        }
    };

    if clause.negated {
        !result
    } else {
        result
    }
}

fn compare_dates(op: Operator, stored_ms: i64, value: &QueryValue, now_ms: i64) -> bool {
    let rhs_ms = match value {
        QueryValue::Number(n) => *n as i64,
        QueryValue::Relative(rel) => resolve_relative_ms(*rel, now_ms),
        QueryValue::Text(text) => match parse_date_text(text) {
            Some(ms) => ms,
            None => return false,
        },
        _ => return false,
    };
    match op {
        Operator::Eq => same_day(stored_ms, rhs_ms),
        Operator::Ne => !same_day(stored_ms, rhs_ms),
        Operator::Gt => stored_ms > rhs_ms,
        Operator::Lt => stored_ms < rhs_ms,
        Operator::Ge => stored_ms >= rhs_ms,
        Operator::Le => stored_ms <= rhs_ms,
        _ => false,
    }
}

fn same_day(a_ms: i64, b_ms: i64) -> bool {
    const DAY_MS: i64 = 86_400_000;
    a_ms.div_euclid(DAY_MS) == b_ms.div_euclid(DAY_MS)
}

/// Resolve a relative-date token to epoch ms against the injected
/// clock. Months and years use civil arithmetic, not fixed spans.
pub fn resolve_relative_ms(rel: RelativeDate, now_ms: i64) -> i64 {
    use chrono::{Datelike, TimeZone, Utc};
    const DAY_MS: i64 = 86_400_000;
    match rel {
        RelativeDate::Today => now_ms.div_euclid(DAY_MS) * DAY_MS,
        RelativeDate::Yesterday => (now_ms.div_euclid(DAY_MS) - 1) * DAY_MS,
        RelativeDate::Ago { n, unit } => match unit {
            DateUnit::Days => now_ms - i64::from(n) * DAY_MS,
            DateUnit::Weeks => now_ms - i64::from(n) * 7 * DAY_MS,
            DateUnit::Months | DateUnit::Years => {
                let now = Utc
                    .timestamp_millis_opt(now_ms)
                    .single()
                    .unwrap_or_else(Utc::now);
                let months = if unit == DateUnit::Months { n } else { n * 12 };
                let mut year = now.year();
                let mut month = now.month() as i32 - months as i32;
                while month < 1 {
                    month += 12;
                    year -= 1;
                }
                // Clamp the day so month arithmetic never overflows a
                // shorter month.
                let day = now.day().min(28);
                Utc.with_ymd_and_hms(year, month as u32, day, 0, 0, 0)
                    .single()
                    .map(|dt| dt.timestamp_millis())
                    .unwrap_or_else(|| now_ms - i64::from(n) * 30 * DAY_MS)
            }
        },
    }
}

fn parse_date_text(text: &str) -> Option<i64> {
    let date = chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
    Some(
        date.and_hms_opt(0, 0, 0)?
            .and_utc()
            .timestamp_millis(),
    )
}

fn compare_texts(op: Operator, stored: &[String], value: &QueryValue) -> bool {
    match op {
        Operator::Eq => stored.iter().any(|s| text_eq(s, value)),
        Operator::Ne => !stored.is_empty() && !stored.iter().any(|s| text_eq(s, value)),
        Operator::Contains => {
            let needle = value_text(value).to_lowercase();
            !needle.is_empty() && stored.iter().any(|s| s.to_lowercase().contains(&needle))
        }
        Operator::Gt | Operator::Lt | Operator::Ge | Operator::Le => {
            stored.iter().any(|s| compare_ordered(op, s, value))
        }
        _ => false,
    }
}

fn text_eq(stored: &str, value: &QueryValue) -> bool {
    match value {
        QueryValue::Text(t) => stored == t,
        QueryValue::Number(n) => stored
            .parse::<f64>()
            .map(|s| (s - n).abs() < f64::EPSILON)
            .unwrap_or(false),
        QueryValue::Bool(b) => stored.eq_ignore_ascii_case(if *b { "true" } else { "false" }),
        _ => false,
    }
}

fn compare_ordered(op: Operator, stored: &str, value: &QueryValue) -> bool {
    // Numeric when both sides are numeric, ISO-lexicographic otherwise.
    let ordering = match value {
        QueryValue::Number(n) => match stored.parse::<f64>() {
            Ok(s) => s.partial_cmp(n),
            Err(_) => None,
        },
        QueryValue::Text(t) => match (stored.parse::<f64>(), t.parse::<f64>()) {
            (Ok(a), Ok(b)) => a.partial_cmp(&b),
            _ => Some(stored.cmp(t.as_str())),
        },
        _ => None,
    };
    match ordering {
        None => false,
        Some(ord) => match op {
            Operator::Gt => ord.is_gt(),
            Operator::Lt => ord.is_lt(),
            Operator::Ge => ord.is_ge(),
            Operator::Le => ord.is_le(),
            _ => false,
        },
    }
}

fn value_text(value: &QueryValue) -> String {
    match value {
        QueryValue::Text(t) => t.clone(),
        QueryValue::Number(n) => n.to_string(),
        QueryValue::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Sort key with nulls last; ties always break on id so a fixed store
/// yields a fixed order.
#[derive(Debug, PartialEq)]
enum SortKey {
    Null,
    Num(f64),
    Str(String),
}

fn sort_key(tables: &Tables, id: &NodeId, order: &OrderBy) -> SortKey {
    let node = match tables.node(id) {
        Some(n) => n,
        None => return SortKey::Null,
    };
    match order.field.as_str() {
        "id" => SortKey::Str(id.to_string()),
        "name" => node
            .name
            .as_ref()
            .map(|n| SortKey::Str(n.to_lowercase()))
            .unwrap_or(SortKey::Null),
        "created" => node.created.map(|v| SortKey::Num(v as f64)).unwrap_or(SortKey::Null),
        "updated" => node.updated.map(|v| SortKey::Num(v as f64)).unwrap_or(SortKey::Null),
        "done_at" | "done" => node
            .done_at
            .map(|v| SortKey::Num(v as f64))
            .unwrap_or(SortKey::Null),
        field => {
            let bare = field.strip_prefix("fields.").unwrap_or(field);
            let wanted = NormalizedName::of(bare);
            let first = tables.field_values_of(id).find_map(|row| {
                if NormalizedName::of(&row.field_name) == wanted {
                    row.value_text.clone()
                } else {
                    None
                }
            });
            match first {
                None => SortKey::Null,
                Some(text) => match text.parse::<f64>() {
                    // Numerics order naturally, dates ISO-lexicographic,
                    // plain strings case-insensitive.
                    Ok(n) => SortKey::Num(n),
                    Err(_) => SortKey::Str(text.to_lowercase()),
                },
            }
        }
    }
}

fn sort_ids(tables: &Tables, ids: &mut [NodeId], order: Option<&OrderBy>) {
    use std::cmp::Ordering;
    match order {
        None => ids.sort(),
        Some(order) => {
            ids.sort_by(|a, b| {
                let ka = sort_key(tables, a, order);
                let kb = sort_key(tables, b, order);
                // Nulls sort last in both directions.
                let ord = match (&ka, &kb) {
                    (SortKey::Null, SortKey::Null) => Ordering::Equal,
                    (SortKey::Null, _) => Ordering::Greater,
                    (_, SortKey::Null) => Ordering::Less,
                    _ => {
                        let ord = compare_sort_keys(&ka, &kb);
                        if order.descending {
                            ord.reverse()
                        } else {
                            ord
                        }
                    }
                };
                ord.then_with(|| a.cmp(b))
            });
        }
    }
}

fn compare_sort_keys(a: &SortKey, b: &SortKey) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (SortKey::Null, SortKey::Null) => Ordering::Equal,
        (SortKey::Null, _) => Ordering::Greater,
        (_, SortKey::Null) => Ordering::Less,
        (SortKey::Num(x), SortKey::Num(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (SortKey::Str(x), SortKey::Str(y)) => x.cmp(y),
        (SortKey::Num(_), SortKey::Str(_)) => Ordering::Less,
        (SortKey::Str(_), SortKey::Num(_)) => Ordering::Greater,
    }
}

fn build_hit(tables: &Tables, id: &NodeId, select: Option<&[String]>) -> QueryHit {
    let node = tables.node(id);
    let mut fields = BTreeMap::new();

    if let Some(selected) = select {
        let want_all = selected.iter().any(|f| f == "*");
        for row in tables.field_values_of(id) {
            let include = want_all
                || selected.iter().any(|f| {
                    let bare = f.strip_prefix("fields.").unwrap_or(f);
                    NormalizedName::of(bare) == NormalizedName::of(&row.field_name)
                });
            if include {
                if let Some(text) = &row.value_text {
                    fields
                        .entry(row.field_name.clone())
                        .or_insert_with(Vec::new)
                        .push(text.clone());
                }
            }
        }
    }

    QueryHit {
        id: id.clone(),
        name: node.and_then(|n| n.name.clone()),
        tags: tables
            .tags_of(id)
            .iter()
            .map(|t| t.tag_name.clone())
            .collect(),
        created: node.and_then(|n| n.created),
        updated: node.and_then(|n| n.updated),
        fields,
    }
}
