//! Session document schema migration (spec §4.2).
//!
//! The Session State Store loads a session's raw JSON, reads its
//! `schema_version` field, and calls [`migrate`] to bring it forward to
//! [`crate::model::CURRENT_SCHEMA_VERSION`] before any writer observes
//! it. Migrations operate on the untyped `serde_json::Value` so that a
//! document written by an older binary (missing fields the current
//! `SessionDocument` requires) can still be read.

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("cannot migrate from schema version {0}: no migration path defined")]
    NoPath(u32),
    #[error("document is not a JSON object")]
    NotAnObject,
}

/// Migrate `doc` from `from_version` up to
/// [`crate::model::CURRENT_SCHEMA_VERSION`], applying one version step at
/// a time so each step stays small and independently testable.
pub fn migrate(mut doc: Value, from_version: u32) -> Result<Value, MigrationError> {
    let mut version = from_version;
    while version < crate::model::CURRENT_SCHEMA_VERSION {
        doc = migrate_one_step(doc, version)?;
        version += 1;
    }
    Ok(doc)
}

fn migrate_one_step(doc: Value, from_version: u32) -> Result<Value, MigrationError> {
    match from_version {
        // No migrations defined yet below the current version; this arm
        // only exists so a future schema bump has a place to land without
        // reshaping the function signature.
        v if v >= crate::model::CURRENT_SCHEMA_VERSION => Ok(doc),
        v => {
            let _ = v;
            Err(MigrationError::NoPath(from_version))
        }
    }
}

/// Ensure config-level supplemental fields introduced after a document's
/// original write (e.g. `notes`, `tags`) default in rather than failing
/// to deserialize. Called defensively by migration steps that add
/// optional fields to `SessionConfig`.
#[allow(dead_code)]
fn ensure_object_field(doc: &mut Value, path: &[&str], default: Value) -> Result<(), MigrationError> {
    let mut cursor = doc.as_object_mut().ok_or(MigrationError::NotAnObject)?;
    for (i, key) in path.iter().enumerate() {
        if i == path.len() - 1 {
            cursor.entry(key.to_string()).or_insert(default.clone());
        } else {
            cursor = cursor
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Default::default()))
                .as_object_mut()
                .ok_or(MigrationError::NotAnObject)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn migrating_at_current_version_is_a_no_op() {
        let doc = json!({"schema_version": crate::model::CURRENT_SCHEMA_VERSION});
        let migrated = migrate(doc.clone(), crate::model::CURRENT_SCHEMA_VERSION).unwrap();
        assert_eq!(migrated, doc);
    }

    #[test]
    fn migrating_from_unknown_future_version_below_current_errors() {
        let doc = json!({"schema_version": 0});
        let err = migrate(doc, 0).unwrap_err();
        assert!(matches!(err, MigrationError::NoPath(0)));
    }

    #[test]
    fn ensure_object_field_sets_missing_nested_default() {
        let mut doc = json!({"config": {}});
        ensure_object_field(&mut doc, &["config", "notes"], Value::Null).unwrap();
        assert_eq!(doc["config"]["notes"], Value::Null);
    }
}
