//! Context schema migrations.
//!
//! Snapshots are migrated as raw JSON before they are deserialized, so a
//! step only has to know the shape of its own input version. Steps are pure,
//! ordered and each raises the version by exactly one.
//!
//! | version | change |
//! |---------|--------|
//! | 1 | initial: decisions and log are plain strings, no `version` field required |
//! | 2 | decisions and log entries become objects, `checkpoints` added |
//! | 3 | `started_at`, `task_status` and `archived_log_entries` added |

use crate::context::{WorkflowContext, SCHEMA_VERSION};
use crate::error::{Result, TandemError};
use serde_json::{json, Map, Value};
use tracing::debug;

type Step = fn(&mut Map<String, Value>);

/// `STEPS[i]` upgrades version `i + 1` to `i + 2`.
const STEPS: &[Step] = &[v1_to_v2, v2_to_v3];

/// Schema version of a raw snapshot. A missing `version` field means v1.
pub fn version_of(doc: &Value) -> Result<u32> {
    match doc.get("version") {
        None | Some(Value::Null) => Ok(1),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(TandemError::MigrationGap {
                found: 0,
                current: SCHEMA_VERSION,
            }),
    }
}

/// Upgrade `doc` in place to [`SCHEMA_VERSION`]. Returns the starting version.
pub fn migrate_value(doc: &mut Value) -> Result<u32> {
    let found = version_of(doc)?;
    if found == 0 || found > SCHEMA_VERSION || (found as usize) > STEPS.len() + 1 {
        return Err(TandemError::MigrationGap {
            found,
            current: SCHEMA_VERSION,
        });
    }
    let Some(obj) = doc.as_object_mut() else {
        return Err(TandemError::MigrationGap {
            found,
            current: SCHEMA_VERSION,
        });
    };
    for (idx, step) in STEPS.iter().enumerate().skip(found as usize - 1) {
        step(obj);
        obj.insert("version".to_string(), json!(idx as u32 + 2));
        debug!(from = idx + 1, to = idx + 2, "migrated context schema");
    }
    Ok(found)
}

/// Migrate and deserialize a raw snapshot.
///
/// Shape errors after migration surface as [`TandemError::Json`]; the store
/// maps those to `CorruptedContext`.
pub fn migrate(mut doc: Value) -> Result<(WorkflowContext, u32)> {
    let found = migrate_value(&mut doc)?;
    let ctx: WorkflowContext = serde_json::from_value(doc)?;
    Ok((ctx, found))
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

fn timestamp_of(obj: &Map<String, Value>) -> Value {
    obj.get("timestamp").cloned().unwrap_or(Value::Null)
}

fn v1_to_v2(obj: &mut Map<String, Value>) {
    let at = timestamp_of(obj);

    if let Some(Value::Array(items)) = obj.get_mut("decisions") {
        for item in items.iter_mut() {
            if let Value::String(s) = item {
                *item = json!({ "at": at, "summary": s });
            }
        }
    }
    if let Some(Value::Array(items)) = obj.get_mut("log") {
        for item in items.iter_mut() {
            if let Value::String(s) = item {
                *item = json!({ "at": at, "kind": "note", "message": s });
            }
        }
    }
    obj.entry("checkpoints").or_insert_with(|| json!([]));
}

fn v2_to_v3(obj: &mut Map<String, Value>) {
    let at = timestamp_of(obj);
    obj.entry("started_at").or_insert(at);
    obj.entry("task_status").or_insert_with(|| json!({}));
    obj.entry("archived_log_entries").or_insert_with(|| json!(0));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1() -> Value {
        json!({
            "workflow_id": "wf-legacy",
            "timestamp": "2024-03-01T10:00:00Z",
            "phase": "implementation",
            "decisions": ["use sessions over jwt"],
            "pending_actions": ["review auth"],
            "modified_files": ["src/auth.rs"],
            "log": ["assigned auth-red to tester"]
        })
    }

    fn v2() -> Value {
        json!({
            "version": 2,
            "workflow_id": "wf-legacy",
            "timestamp": "2024-03-01T10:00:00Z",
            "phase": "review",
            "decisions": [{ "at": "2024-03-01T09:00:00Z", "summary": "split lanes" }],
            "pending_actions": [],
            "modified_files": [],
            "checkpoints": [{
                "id": "cp-0001",
                "label": "auth lane done",
                "category": "phase_complete",
                "created_at": "2024-03-01T09:30:00Z"
            }],
            "log": []
        })
    }

    #[test]
    fn v1_migrates_to_current_and_validates() {
        let (ctx, found) = migrate(v1()).unwrap();
        assert_eq!(found, 1);
        assert_eq!(ctx.version, SCHEMA_VERSION);
        assert_eq!(ctx.decisions[0].summary, "use sessions over jwt");
        assert_eq!(ctx.log[0].message, "assigned auth-red to tester");
        assert!(ctx.checkpoints.is_empty());
        assert_eq!(ctx.started_at, ctx.timestamp);
        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn v2_keeps_checkpoints() {
        let (ctx, found) = migrate(v2()).unwrap();
        assert_eq!(found, 2);
        assert_eq!(ctx.checkpoints.len(), 1);
        assert_eq!(ctx.archived_log_entries, 0);
        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn current_version_is_untouched() {
        let ctx = WorkflowContext::new("wf-now");
        let doc = serde_json::to_value(&ctx).unwrap();
        let (back, found) = migrate(doc).unwrap();
        assert_eq!(found, SCHEMA_VERSION);
        assert_eq!(back, ctx);
    }

    #[test]
    fn newer_version_is_a_gap() {
        let mut doc = v2();
        doc["version"] = json!(SCHEMA_VERSION + 1);
        let err = migrate(doc).unwrap_err();
        assert_eq!(err.kind(), "MigrationGapError");
    }

    #[test]
    fn non_numeric_version_is_a_gap() {
        let mut doc = v2();
        doc["version"] = json!("two");
        assert!(matches!(
            migrate(doc),
            Err(TandemError::MigrationGap { found: 0, .. })
        ));
    }

    #[test]
    fn missing_required_field_fails_to_deserialize() {
        let mut doc = v1();
        doc.as_object_mut().unwrap().remove("workflow_id");
        assert!(matches!(migrate(doc), Err(TandemError::Json(_))));
    }
}
