//! Query template resolution
//!
//! SQL templates live on disk next to the job definition and carry `{name}`
//! placeholders (`start_date`, `end_date`, `source_table_name`,
//! `min_source_ts`, `max_source_ts`, ...). The resolver substitutes
//! values verbatim and performs no SQL escaping: placeholder values must
//! either come from trusted configuration (identifiers) or be pre-quoted by
//! the caller. Warehouse-side predicates never pass through here; they are
//! bound as parameters in the load stage.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use lode_common::{EtlError, Result};
use regex::Regex;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"))
}

/// Substitute every `{name}` placeholder in `text` from `values`.
///
/// A placeholder missing from `values` is fatal. Keys in `values` that the
/// template never references are permitted, so one job definition can feed
/// templates of differing shapes.
pub fn resolve(text: &str, values: &BTreeMap<String, String>) -> Result<String> {
    let mut missing = Vec::new();
    let resolved = placeholder_re().replace_all(text, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match values.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.push(name.to_string());
                String::new()
            },
        }
    });

    if missing.is_empty() {
        Ok(resolved.into_owned())
    } else {
        missing.sort();
        missing.dedup();
        Err(EtlError::Template(format!(
            "unresolved placeholders: {}",
            missing.join(", ")
        )))
    }
}

/// Read a template file and resolve it in one step.
pub fn resolve_file(path: &Path, values: &BTreeMap<String, String>) -> Result<String> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        EtlError::Template(format!("cannot read template {}: {}", path.display(), e))
    })?;
    resolve(&text, values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_resolve_substitutes_all_placeholders() {
        let text = "SELECT * FROM {source_table_name} WHERE ts >= '{min_source_ts}'";
        let values = map(&[
            ("source_table_name", "dbo.orders"),
            ("min_source_ts", "2024-01-10 00:00:00"),
        ]);
        let resolved = resolve(text, &values).unwrap();
        assert_eq!(
            resolved,
            "SELECT * FROM dbo.orders WHERE ts >= '2024-01-10 00:00:00'"
        );
    }

    #[test]
    fn test_missing_placeholder_is_fatal() {
        let err = resolve("DELETE FROM {dwh_table_name}", &map(&[])).unwrap_err();
        match err {
            EtlError::Template(msg) => assert!(msg.contains("dwh_table_name")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unused_keys_are_allowed() {
        let values = map(&[("start_date", "2024-01-01"), ("end_date", "2024-02-01")]);
        let resolved = resolve("EXEC report '{start_date}'", &values).unwrap();
        assert_eq!(resolved, "EXEC report '2024-01-01'");
    }

    #[test]
    fn test_repeated_placeholder() {
        let values = map(&[("end_date", "2024-02-01")]);
        let resolved = resolve("a={end_date} b={end_date}", &values).unwrap();
        assert_eq!(resolved, "a=2024-02-01 b=2024-02-01");
    }
}
