// Payload Builder
// Turns a node description (supertag names, a node name, field values)
// into a write-API payload for the opaque mutation sink. Unknown fields
// are silently dropped; value children are typed according to the
// inferred data type of the matched field definition.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::SchemaService;
use crate::store::SupertagFieldRow;
use crate::types::{FieldDataType, NodeId, NormalizedName};

/// Payload for one node to be created through the write sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePayload {
    pub name: String,
    pub supertags: Vec<SupertagRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<PayloadChild>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupertagRef {
    pub id: String,
}

/// Either a field child (attribute id + value children) or a value
/// child (typed leaf). Absent members are omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadChild {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<PayloadChild>>,
}

/// Split a supertag argument: either already a list, or one string that
/// may carry comma-separated names.
pub fn parse_tag_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build a write payload.
///
/// Supertag names resolve case-sensitively first (exact), then via the
/// normalized fallback; the resolved set is deduplicated by id. The
/// usable fields are the union of every tag's inheritance closure,
/// deduplicated by attribute id keeping the first occurrence. Provided
/// fields that match nothing are dropped.
pub fn build_payload(
    schema: &SchemaService,
    tag_names: &[String],
    name: &str,
    fields: &serde_json::Map<String, Value>,
) -> Result<NodePayload> {
    let mut tags = Vec::new();
    let mut seen_tags = std::collections::HashSet::new();
    for tag_name in tag_names {
        let tag = schema.get_supertag(tag_name)?;
        if seen_tags.insert(tag.id.clone()) {
            tags.push(tag);
        }
    }

    // Union of all_fields across tags, first occurrence per attribute.
    let mut usable: Vec<SupertagFieldRow> = Vec::new();
    let mut seen_attrs = std::collections::HashSet::new();
    for tag in &tags {
        for field in schema.all_fields(&tag.id) {
            if seen_attrs.insert(field.field_label_id.clone()) {
                usable.push(field);
            }
        }
    }

    let mut children: Vec<PayloadChild> = Vec::new();
    for (field_name, value) in fields {
        let wanted = NormalizedName::of(field_name);
        let def = match usable.iter().find(|f| f.normalized_name == wanted) {
            Some(def) => def,
            // Graceful degradation: unknown fields are dropped.
            None => continue,
        };
        let values = value_children(def, value);
        if values.is_empty() {
            continue;
        }
        children.push(PayloadChild {
            attribute_id: Some(def.field_label_id.to_string()),
            children: Some(values),
            ..PayloadChild::default()
        });
    }

    Ok(NodePayload {
        name: name.to_string(),
        supertags: tags
            .iter()
            .map(|t| SupertagRef {
                id: t.id.to_string(),
            })
            .collect(),
        children: if children.is_empty() {
            None
        } else {
            Some(children)
        },
    })
}

/// Typed value children for one provided value. Arrays fan out to one
/// child per element; empty or whitespace-only scalars are skipped.
fn value_children(def: &SupertagFieldRow, value: &Value) -> Vec<PayloadChild> {
    match value {
        Value::Array(items) => items
            .iter()
            .flat_map(|item| value_children(def, item))
            .collect(),
        Value::Null => Vec::new(),
        other => scalar_child(def, other).into_iter().collect(),
    }
}

fn scalar_child(def: &SupertagFieldRow, value: &Value) -> Option<PayloadChild> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).ok()?,
    };
    if text.trim().is_empty() {
        return None;
    }

    let child = match def.inferred_data_type {
        FieldDataType::Date => PayloadChild {
            data_type: Some("date".into()),
            name: Some(text),
            ..PayloadChild::default()
        },
        FieldDataType::Url => PayloadChild {
            data_type: Some("url".into()),
            name: Some(text),
            ..PayloadChild::default()
        },
        FieldDataType::Reference => {
            if NodeId::looks_like_id(&text) {
                PayloadChild {
                    id: Some(text),
                    ..PayloadChild::default()
                }
            } else {
                PayloadChild {
                    name: Some(text),
                    ..PayloadChild::default()
                }
            }
        }
        FieldDataType::Checkbox => {
            let truthy = matches!(value, Value::Bool(true))
                || text.eq_ignore_ascii_case("true")
                || text == "1";
            PayloadChild {
                name: Some(if truthy { "true".into() } else { "false".into() }),
                ..PayloadChild::default()
            }
        }
        FieldDataType::Number => PayloadChild {
            name: Some(text),
            ..PayloadChild::default()
        },
        FieldDataType::Text | FieldDataType::Email | FieldDataType::Phone => PayloadChild {
            name: Some(text),
            ..PayloadChild::default()
        },
    };
    Some(child)
}
