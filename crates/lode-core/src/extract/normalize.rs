//! Response normalization: nested JSON/XML into tabular rows

use std::collections::{BTreeMap, BTreeSet};

use lode_common::{EtlError, Result};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::config::{JsonNormalizeSpec, XmlNormalizeSpec};
use crate::row::{RowSet, Value};

/// Walk a dot-separated path into nested JSON objects.
fn navigate<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

/// Dot-flatten a JSON object. Arrays stay JSON documents.
fn flatten(prefix: &str, value: &serde_json::Value, out: &mut BTreeMap<String, Value>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&name, child, out);
            }
        },
        other => {
            out.insert(prefix.to_string(), Value::from_json(other));
        },
    }
}

/// Flatten a JSON response into one row per record.
///
/// Records come from `record_path` within each parent object (or the parents
/// themselves when no path is configured); `meta` fields are read from the
/// parent and appended to every record row under `meta_prefix` naming.
/// Columns are the sorted union of keys across all records, so the result is
/// rectangular; keys a record lacks become nulls.
pub fn json_normalize(body: &serde_json::Value, spec: &JsonNormalizeSpec) -> Result<RowSet> {
    let root = match &spec.json_key {
        Some(key) => body.get(key).ok_or_else(|| {
            EtlError::Parse(format!("json_key '{key}' not present in response"))
        })?,
        None => body,
    };

    let parents: Vec<&serde_json::Value> = match root {
        serde_json::Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    // (flattened record, owning parent) pairs
    let mut records: Vec<(BTreeMap<String, Value>, &serde_json::Value)> = Vec::new();

    for parent in parents {
        match &spec.record_path {
            Some(path) => {
                let found = navigate(parent, path).ok_or_else(|| {
                    EtlError::Parse(format!("record_path '{path}' not present in response"))
                })?;
                let items = found.as_array().ok_or_else(|| {
                    EtlError::Parse(format!("record_path '{path}' is not an array"))
                })?;
                for item in items {
                    let mut flat = BTreeMap::new();
                    flatten("", item, &mut flat);
                    records.push((flat, parent));
                }
            },
            None => {
                let mut flat = BTreeMap::new();
                flatten("", parent, &mut flat);
                records.push((flat, parent));
            },
        }
    }

    let record_columns: BTreeSet<String> = records
        .iter()
        .flat_map(|(flat, _)| flat.keys().cloned())
        .collect();

    let meta_prefix = spec.meta_prefix.as_deref().unwrap_or("");
    let mut columns: Vec<String> = record_columns.iter().cloned().collect();
    for field in &spec.meta {
        columns.push(format!("{meta_prefix}{field}"));
    }

    let mut set = RowSet::with_columns(columns);
    for (mut flat, parent) in records {
        let mut row: Vec<Value> = record_columns
            .iter()
            .map(|col| flat.remove(col).unwrap_or(Value::Null))
            .collect();
        for field in &spec.meta {
            let value = navigate(parent, field)
                .map(Value::from_json)
                .unwrap_or(Value::Null);
            row.push(value);
        }
        set.push(row)?;
    }

    Ok(set)
}

/// Flatten an XML response into one row per node matched by the selector.
///
/// Only the `//element` selector form is supported: every element with that
/// name yields a row built from its attributes and the text of its direct
/// children. Columns are the sorted union across matched nodes.
pub fn xml_normalize(text: &str, spec: &XmlNormalizeSpec) -> Result<RowSet> {
    let target = spec
        .xpath
        .strip_prefix("//")
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
        .ok_or_else(|| {
            EtlError::config(format!(
                "only //element selectors are supported, got '{}'",
                spec.xpath
            ))
        })?;

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut records: Vec<BTreeMap<String, Value>> = Vec::new();

    loop {
        match reader.read_event().map_err(|e| EtlError::Parse(e.to_string()))? {
            Event::Start(start) if start.local_name().as_ref() == target.as_bytes() => {
                let mut record = attributes_of(&start)?;
                collect_children(&mut reader, target, &mut record)?;
                records.push(record);
            },
            Event::Empty(start) if start.local_name().as_ref() == target.as_bytes() => {
                records.push(attributes_of(&start)?);
            },
            Event::Eof => break,
            _ => {},
        }
    }

    let columns: BTreeSet<String> = records
        .iter()
        .flat_map(|r| r.keys().cloned())
        .collect();

    let mut set = RowSet::with_columns(columns.iter().cloned().collect());
    for mut record in records {
        let row: Vec<Value> = columns
            .iter()
            .map(|col| record.remove(col).unwrap_or(Value::Null))
            .collect();
        set.push(row)?;
    }

    Ok(set)
}

fn attributes_of(start: &quick_xml::events::BytesStart<'_>) -> Result<BTreeMap<String, Value>> {
    let mut record = BTreeMap::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| EtlError::Parse(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| EtlError::Parse(e.to_string()))?
            .into_owned();
        record.insert(key, Value::Text(value));
    }
    Ok(record)
}

/// Collect direct-child element text until the matching close tag.
fn collect_children(
    reader: &mut Reader<&[u8]>,
    target: &str,
    record: &mut BTreeMap<String, Value>,
) -> Result<()> {
    let mut current: Option<String> = None;
    let mut depth = 0usize;

    loop {
        match reader.read_event().map_err(|e| EtlError::Parse(e.to_string()))? {
            Event::Start(start) => {
                if depth == 0 {
                    current =
                        Some(String::from_utf8_lossy(start.local_name().as_ref()).into_owned());
                }
                depth += 1;
            },
            Event::Text(text) => {
                if let (1, Some(ref name)) = (depth, &current) {
                    let value = text
                        .unescape()
                        .map_err(|e| EtlError::Parse(e.to_string()))?
                        .into_owned();
                    record.insert(name.clone(), Value::Text(value));
                }
            },
            Event::End(end) => {
                if depth == 0 {
                    if end.local_name().as_ref() == target.as_bytes() {
                        return Ok(());
                    }
                } else {
                    depth -= 1;
                    if depth == 0 {
                        current = None;
                    }
                }
            },
            Event::Eof => {
                return Err(EtlError::Parse(format!(
                    "unexpected end of XML inside <{target}>"
                )));
            },
            _ => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_record_path() {
        let body = serde_json::json!({
            "items": [
                {"id": 1, "v": "a"},
                {"id": 2, "v": "b"}
            ]
        });
        let spec = JsonNormalizeSpec {
            record_path: Some("items".to_string()),
            ..Default::default()
        };
        let set = json_normalize(&body, &spec).unwrap();
        assert_eq!(set.columns(), Some(&["id".to_string(), "v".to_string()][..]));
        assert_eq!(set.rows()[0], vec![Value::Int(1), Value::Text("a".into())]);
        assert_eq!(set.rows()[1], vec![Value::Int(2), Value::Text("b".into())]);
    }

    #[test]
    fn test_json_meta_fields_from_parents() {
        let body = serde_json::json!([
            {"id": 10, "shop_id": 7, "answers": [{"q": "a1"}, {"q": "a2"}]},
            {"id": 11, "shop_id": 8, "answers": [{"q": "b1"}]}
        ]);
        let spec = JsonNormalizeSpec {
            record_path: Some("answers".to_string()),
            meta: vec!["id".to_string(), "shop_id".to_string()],
            meta_prefix: Some("check_".to_string()),
            ..Default::default()
        };
        let set = json_normalize(&body, &spec).unwrap();
        assert_eq!(
            set.columns(),
            Some(
                &[
                    "q".to_string(),
                    "check_id".to_string(),
                    "check_shop_id".to_string()
                ][..]
            )
        );
        assert_eq!(set.len(), 3);
        assert_eq!(
            set.rows()[2],
            vec![Value::Text("b1".into()), Value::Int(11), Value::Int(8)]
        );
    }

    #[test]
    fn test_json_key_descend() {
        let body = serde_json::json!({"data": {"rows": [{"x": 1}]}});
        let spec = JsonNormalizeSpec {
            json_key: Some("data".to_string()),
            record_path: Some("rows".to_string()),
            ..Default::default()
        };
        let set = json_normalize(&body, &spec).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_json_nested_objects_dot_flattened() {
        let body = serde_json::json!({
            "items": [{"id": 1, "user": {"name": "ann", "age": 33}}]
        });
        let spec = JsonNormalizeSpec {
            record_path: Some("items".to_string()),
            ..Default::default()
        };
        let set = json_normalize(&body, &spec).unwrap();
        assert_eq!(
            set.columns(),
            Some(
                &[
                    "id".to_string(),
                    "user.age".to_string(),
                    "user.name".to_string()
                ][..]
            )
        );
    }

    #[test]
    fn test_json_missing_record_path_is_parse_error() {
        let body = serde_json::json!({"items": []});
        let spec = JsonNormalizeSpec {
            record_path: Some("rows".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            json_normalize(&body, &spec),
            Err(EtlError::Parse(_))
        ));
    }

    #[test]
    fn test_json_uneven_records_filled_with_nulls() {
        let body = serde_json::json!({"items": [{"a": 1}, {"a": 2, "b": "x"}]});
        let spec = JsonNormalizeSpec {
            record_path: Some("items".to_string()),
            ..Default::default()
        };
        let set = json_normalize(&body, &spec).unwrap();
        assert_eq!(set.rows()[0], vec![Value::Int(1), Value::Null]);
    }

    #[test]
    fn test_xml_rows_from_elements() {
        let xml = r#"
            <root>
                <KR code="11"><rate>92.5</rate><name>usd</name></KR>
                <KR code="12"><rate>101.3</rate><name>eur</name></KR>
                <other>ignored</other>
            </root>
        "#;
        let spec = XmlNormalizeSpec { xpath: "//KR".to_string() };
        let set = xml_normalize(xml, &spec).unwrap();
        assert_eq!(
            set.columns(),
            Some(
                &[
                    "code".to_string(),
                    "name".to_string(),
                    "rate".to_string()
                ][..]
            )
        );
        assert_eq!(set.len(), 2);
        assert_eq!(
            set.rows()[0],
            vec![
                Value::Text("11".into()),
                Value::Text("usd".into()),
                Value::Text("92.5".into())
            ]
        );
    }

    #[test]
    fn test_xml_self_closing_elements() {
        let xml = r#"<root><KR code="1"/><KR code="2"/></root>"#;
        let spec = XmlNormalizeSpec { xpath: "//KR".to_string() };
        let set = xml_normalize(xml, &spec).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_xml_unsupported_selector() {
        let spec = XmlNormalizeSpec { xpath: "/root/KR[1]".to_string() };
        assert!(matches!(
            xml_normalize("<root/>", &spec),
            Err(EtlError::Config(_))
        ));
    }
}
