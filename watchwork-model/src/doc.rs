use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One action description as decoded from a structured document.
///
/// Documents arrive as already-parsed JSON (an object for one action, an
/// array for several); the reserved vocabulary below is everything the
/// decoder understands. Which fields are required depends on the `type`
/// discriminator and is validated eagerly at decode time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionDoc {
    /// Constructor discriminator (`sequence`, `parallel`, `script`,
    /// `wrapped`, or an embedder-registered kind).
    #[serde(rename = "type")]
    pub kind: String,
    /// Action name. Required at the top level of a document; inline
    /// components may omit it and are named after their parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Per-execution timeout in milliseconds; absent means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Name of the action to run after a successful terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,
    /// Name of the action to run after a failed terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
    /// Trigger pattern matched against fired string events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    /// Component list for `sequence` and `parallel`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentRef>,
    /// Base action name for `wrapped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    /// Script path for `script`, absolute or relative to the scripts root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,
    /// Argument-passing convention for `script`; defaults to `inline`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<ScriptArgs>,
    /// Environment overrides merged into the inherited environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Static parameter bindings merged beneath call parameters.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// A component of a compound action: either a name reference into the
/// catalogue or an inline anonymous child document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComponentRef {
    Name(String),
    Inline(Box<ActionDoc>),
}

/// How a script action passes parameters to the spawned process.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ScriptArgs {
    /// The whole parameter set as one serialized JSON argument.
    Inline,
    /// The parameter set written to a temporary file whose path is the
    /// single argument.
    File,
    /// An explicit ordered subset of named parameters as separate arguments.
    Named { names: Vec<String> },
}

impl Default for ScriptArgs {
    fn default() -> Self {
        Self::Inline
    }
}
