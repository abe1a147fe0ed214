//! Extraction of prompt variables from a span payload per `VariableMap`.

use serde_json::Value;

use crate::filter::extract_field;
use crate::model::{VariableMap, VariableSource, Variables};

fn source_root(source: VariableSource) -> Option<&'static str> {
    match source {
        VariableSource::SpanInput => Some("input"),
        VariableSource::SpanOutput => Some("output"),
        VariableSource::SpanMetadata => Some("metadata"),
        VariableSource::SpanAttributes => Some("span_attributes"),
        VariableSource::TraceInput => Some("trace_input"),
        VariableSource::Direct => None,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolves one variable's value. Returns `None` when the path doesn't
/// resolve to anything, in which case the matcher simply omits the
/// variable rather than failing the job.
fn extract_one(payload: &Value, mapping: &VariableMap) -> Option<String> {
    let path = match (source_root(mapping.source), &mapping.json_path) {
        (Some(root), Some(json_path)) => format!("{root}.{json_path}"),
        (Some(root), None) => root.to_string(),
        (None, Some(json_path)) => json_path.clone(),
        (None, None) => return None,
    };

    extract_field(payload, &path).map(stringify)
}

pub fn extract_variables(payload: &Value, mappings: &[VariableMap]) -> Variables {
    mappings
        .iter()
        .filter_map(|mapping| {
            extract_one(payload, mapping).map(|value| (mapping.variable_name.clone(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_whole_subtree_when_no_json_path() {
        let payload = json!({ "output": "the answer is 4" });
        let mappings = vec![VariableMap {
            variable_name: "output".to_string(),
            source: VariableSource::SpanOutput,
            json_path: None,
        }];
        let vars = extract_variables(&payload, &mappings);
        assert_eq!(vars.get("output"), Some(&"the answer is 4".to_string()));
    }

    #[test]
    fn descends_json_path_under_source_root() {
        let payload = json!({ "metadata": { "user": { "id": "u_1" } } });
        let mappings = vec![VariableMap {
            variable_name: "user_id".to_string(),
            source: VariableSource::SpanMetadata,
            json_path: Some("user.id".to_string()),
        }];
        let vars = extract_variables(&payload, &mappings);
        assert_eq!(vars.get("user_id"), Some(&"u_1".to_string()));
    }

    #[test]
    fn direct_source_descends_json_path_from_root() {
        let payload = json!({ "custom": { "field": "value" } });
        let mappings = vec![VariableMap {
            variable_name: "custom_field".to_string(),
            source: VariableSource::Direct,
            json_path: Some("custom.field".to_string()),
        }];
        let vars = extract_variables(&payload, &mappings);
        assert_eq!(vars.get("custom_field"), Some(&"value".to_string()));
    }

    #[test]
    fn non_scalar_values_are_serialized_as_json() {
        let payload = json!({ "output": { "a": 1, "b": 2 } });
        let mappings = vec![VariableMap {
            variable_name: "output".to_string(),
            source: VariableSource::SpanOutput,
            json_path: None,
        }];
        let vars = extract_variables(&payload, &mappings);
        assert_eq!(vars.get("output"), Some(&json!({"a":1,"b":2}).to_string()));
    }

    #[test]
    fn missing_path_omits_variable() {
        let payload = json!({});
        let mappings = vec![VariableMap {
            variable_name: "missing".to_string(),
            source: VariableSource::SpanOutput,
            json_path: None,
        }];
        let vars = extract_variables(&payload, &mappings);
        assert!(vars.get("missing").is_none());
    }
}
