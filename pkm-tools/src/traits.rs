use crate::error::{Result, ToolError};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// A handler the agent can invoke by name. Arguments arrive already checked against
/// `parameters_schema`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value>;
}

pub fn to_llm_tool_def(tool: &dyn Tool) -> pkm_llm::ToolDefinition {
    let spec = tool.spec();
    pkm_llm::ToolDefinition {
        name: spec.name,
        description: spec.description,
        parameters: spec.parameters_schema,
    }
}

pub(crate) fn require_string(args: &serde_json::Value, key: &str) -> Result<String> {
    let Some(v) = args.get(key) else {
        return Err(ToolError::InvalidArguments(format!("missing key: {key}")));
    };
    match v {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_string(args: &serde_json::Value, key: &str) -> Result<Option<String>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.clone())),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_u64(args: &serde_json::Value, key: &str) -> Result<Option<u64>> {
    match args.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| {
            ToolError::InvalidArguments(format!(
                "key {key} must be a non-negative integer, got {v:?}"
            ))
        }),
    }
}

pub(crate) fn optional_f64(args: &serde_json::Value, key: &str) -> Result<Option<f64>> {
    match args.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or_else(|| {
            ToolError::InvalidArguments(format!("key {key} must be a number, got {v:?}"))
        }),
    }
}

/// Joins a model-supplied path onto `root`. Only plain relative segments are accepted;
/// empty input means the root itself.
pub(crate) fn resolve_under_root(root: &Path, requested: Option<&str>) -> Result<PathBuf> {
    let raw = requested.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Ok(root.to_path_buf());
    }
    let rel = Path::new(raw);
    let refusal = rel.components().find_map(|c| match c {
        Component::Normal(_) | Component::CurDir => None,
        Component::ParentDir => Some("path traversal outside the notes root"),
        Component::RootDir | Component::Prefix(_) => Some("absolute paths are not allowed"),
    });
    match refusal {
        Some(reason) => Err(ToolError::Unauthorized(format!("{reason}: {raw:?}"))),
        None => Ok(root.join(rel)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_rejects_escapes() {
        let root = Path::new("/notes");
        assert_eq!(
            resolve_under_root(root, Some("journals")).unwrap(),
            PathBuf::from("/notes/journals")
        );
        assert_eq!(resolve_under_root(root, None).unwrap(), PathBuf::from("/notes"));
        assert_eq!(resolve_under_root(root, Some("  ")).unwrap(), PathBuf::from("/notes"));
        let err = resolve_under_root(root, Some("../etc")).unwrap_err();
        assert!(err.to_string().contains("path traversal"));
        assert!(matches!(
            resolve_under_root(root, Some("/etc")),
            Err(ToolError::Unauthorized(_))
        ));
    }

    #[test]
    fn numeric_helpers_reject_wrong_types() {
        let args = json!({ "limit": 5, "min_similarity": 0.7, "bad": "x" });
        assert_eq!(optional_u64(&args, "limit").unwrap(), Some(5));
        assert_eq!(optional_u64(&args, "absent").unwrap(), None);
        assert_eq!(optional_f64(&args, "min_similarity").unwrap(), Some(0.7));
        assert!(optional_u64(&args, "bad").is_err());
    }
}
