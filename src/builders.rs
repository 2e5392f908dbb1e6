// Builder Patterns
// Fluent builders for constructing query ASTs and aggregation specs
// programmatically, with the same validation the parser applies to the
// string form. RPC tools and the webhook build queries this way instead
// of concatenating strings.

use anyhow::{ensure, Result};

use crate::aggregation::{AggregateSpec, DateField, GroupBy, Period};
use crate::query_parser::{
    Clause, Operator, OrGroup, OrderBy, Query, QueryValue, WhereEntry,
};
use crate::types::ValidatedLimit;

/// Fluent builder for the query AST.
///
/// ```
/// use supertag::builders::QueryBuilder;
/// use supertag::query_parser::Operator;
///
/// let query = QueryBuilder::find("task")
///     .where_field("Status", Operator::Eq, "Done")
///     .order_by_desc("created")
///     .limit(20)
///     .unwrap()
///     .build();
/// assert_eq!(query.find, "task");
/// ```
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    pub fn find(target: impl Into<String>) -> Self {
        Self {
            query: Query {
                find: target.into(),
                where_clauses: Vec::new(),
                order_by: None,
                limit: None,
                offset: None,
                select: None,
            },
        }
    }

    pub fn find_all() -> Self {
        Self::find("*")
    }

    pub fn where_field(
        mut self,
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<QueryValue>,
    ) -> Self {
        self.query.where_clauses.push(WhereEntry::Clause(Clause {
            field: field.into(),
            operator,
            value: value.into(),
            negated: false,
        }));
        self
    }

    pub fn where_not(
        mut self,
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<QueryValue>,
    ) -> Self {
        self.query.where_clauses.push(WhereEntry::Clause(Clause {
            field: field.into(),
            operator,
            value: value.into(),
            negated: true,
        }));
        self
    }

    pub fn where_exists(mut self, field: impl Into<String>) -> Self {
        self.query.where_clauses.push(WhereEntry::Clause(Clause {
            field: field.into(),
            operator: Operator::Exists,
            value: QueryValue::None,
            negated: false,
        }));
        self
    }

    pub fn where_empty(mut self, field: impl Into<String>) -> Self {
        self.query.where_clauses.push(WhereEntry::Clause(Clause {
            field: field.into(),
            operator: Operator::IsEmpty,
            value: QueryValue::None,
            negated: false,
        }));
        self
    }

    /// Parenthesized OR group. Panics in debug builds when empty; an
    /// empty group would match nothing and is always a caller bug.
    pub fn where_any(mut self, clauses: Vec<Clause>) -> Self {
        debug_assert!(!clauses.is_empty(), "empty OR group");
        self.query
            .where_clauses
            .push(WhereEntry::Or(OrGroup { clauses }));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.query.order_by = Some(OrderBy {
            field: field.into(),
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.query.order_by = Some(OrderBy {
            field: field.into(),
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Result<Self> {
        self.query.limit = Some(ValidatedLimit::new(limit)?.get());
        Ok(self)
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.query.offset = Some(offset);
        self
    }

    pub fn select(mut self, fields: Vec<String>) -> Self {
        self.query.select = Some(fields);
        self
    }

    pub fn build(self) -> Query {
        self.query
    }
}

impl From<&str> for QueryValue {
    fn from(s: &str) -> Self {
        QueryValue::Text(s.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(s: String) -> Self {
        QueryValue::Text(s)
    }
}

impl From<f64> for QueryValue {
    fn from(n: f64) -> Self {
        QueryValue::Number(n)
    }
}

impl From<i64> for QueryValue {
    fn from(n: i64) -> Self {
        QueryValue::Number(n as f64)
    }
}

impl From<bool> for QueryValue {
    fn from(b: bool) -> Self {
        QueryValue::Bool(b)
    }
}

/// Builder for aggregation specs.
#[derive(Debug, Clone)]
pub struct AggregateBuilder {
    spec: AggregateSpec,
}

impl AggregateBuilder {
    pub fn group_by_field(field: impl Into<String>) -> Self {
        Self {
            spec: AggregateSpec {
                group_by: GroupBy::Field(field.into()),
                second_group: None,
                show_percent: false,
                top: None,
            },
        }
    }

    pub fn group_by_period(period: Period, date_field: DateField) -> Self {
        Self {
            spec: AggregateSpec {
                group_by: GroupBy::TimeBucket { period, date_field },
                second_group: None,
                show_percent: false,
                top: None,
            },
        }
    }

    pub fn then_by_field(mut self, field: impl Into<String>) -> Self {
        self.spec.second_group = Some(GroupBy::Field(field.into()));
        self
    }

    pub fn show_percent(mut self) -> Self {
        self.spec.show_percent = true;
        self
    }

    pub fn top(mut self, n: usize) -> Result<Self> {
        ensure!(n > 0, "top must be greater than zero");
        self.spec.top = Some(n);
        Ok(self)
    }

    pub fn build(self) -> AggregateSpec {
        self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_parser::parse;

    #[test]
    fn builder_matches_parsed_form() {
        let built = QueryBuilder::find("task")
            .where_any(vec![
                Clause {
                    field: "Status".into(),
                    operator: Operator::Eq,
                    value: "Done".into(),
                    negated: false,
                },
                Clause {
                    field: "Status".into(),
                    operator: Operator::Eq,
                    value: "Active".into(),
                    negated: false,
                },
            ])
            .order_by_desc("created")
            .limit(20)
            .unwrap()
            .build();

        let parsed =
            parse("find task where (Status = Done or Status = Active) order by -created limit 20")
                .unwrap();
        assert_eq!(built, parsed);
    }

    #[test]
    fn limit_is_validated() {
        assert!(QueryBuilder::find("t").limit(0).is_err());
        assert!(QueryBuilder::find("t").limit(1001).is_err());
        assert!(QueryBuilder::find("t").limit(1000).is_ok());
    }

    #[test]
    fn aggregate_builder_shapes() {
        let spec = AggregateBuilder::group_by_field("Status")
            .show_percent()
            .top(5)
            .unwrap()
            .build();
        assert_eq!(spec.group_by, GroupBy::Field("Status".into()));
        assert!(spec.show_percent);
        assert_eq!(spec.top, Some(5));
    }
}
