//! Decoding action documents into action graphs.
//!
//! Construction is driven by a registry of constructors keyed by the
//! `type` discriminator, so the set of buildable kinds is a closed,
//! inspectable table rather than anything name-driven and open-ended.
//! Validation is eager: an unknown kind, a missing required field, or a
//! malformed trigger pattern fails the decode of the whole document.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use super::{
    Action, ActionCommon, ActionRef, ParallelAction, ScriptAction, SequenceAction, WrappedAction,
};
use crate::{Result, WatchworkError};
use watchwork_model::{ActionDoc, ComponentRef};

/// Builds one action variant from its validated document.
///
/// Implementations for custom leaf kinds are registered with
/// [`ActionDecoder::register`]; `common` already carries the decoded
/// shared configuration (name, timeout, trigger, chains, bindings).
pub trait ActionConstructor: Send + Sync {
    fn construct(
        &self,
        decoder: &ActionDecoder,
        doc: &ActionDoc,
        common: ActionCommon,
    ) -> Result<Arc<dyn Action>>;
}

/// Document-to-action decoder with the built-in kinds (`sequence`,
/// `parallel`, `script`, `wrapped`) pre-registered.
pub struct ActionDecoder {
    constructors: HashMap<String, Arc<dyn ActionConstructor>>,
}

impl Default for ActionDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ActionDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.constructors.keys().collect();
        kinds.sort();
        f.debug_struct("ActionDecoder").field("kinds", &kinds).finish()
    }
}

impl ActionDecoder {
    pub fn new() -> Self {
        let mut decoder = Self {
            constructors: HashMap::new(),
        };
        decoder.register("sequence", Arc::new(SequenceConstructor));
        decoder.register("parallel", Arc::new(ParallelConstructor));
        decoder.register("script", Arc::new(ScriptConstructor));
        decoder.register("wrapped", Arc::new(WrappedConstructor));
        decoder
    }

    /// Register a constructor for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: impl Into<String>, constructor: Arc<dyn ActionConstructor>) {
        self.constructors.insert(kind.into(), constructor);
    }

    /// Decode a parsed document: an object yields one action, an array one
    /// action per element.
    pub fn decode_value(&self, value: &serde_json::Value) -> Result<Vec<Arc<dyn Action>>> {
        match value {
            serde_json::Value::Object(_) => {
                let doc: ActionDoc = serde_json::from_value(value.clone())?;
                Ok(vec![self.decode_doc(&doc)?])
            }
            serde_json::Value::Array(elements) => {
                let mut actions = Vec::with_capacity(elements.len());
                for element in elements {
                    let doc: ActionDoc = serde_json::from_value(element.clone())?;
                    actions.push(self.decode_doc(&doc)?);
                }
                Ok(actions)
            }
            other => Err(WatchworkError::InvalidSpec(format!(
                "action document must be an object or an array, got {}",
                json_kind(other)
            ))),
        }
    }

    /// Decode one top-level document. The name is required here; only
    /// inline components may be anonymous.
    pub fn decode_doc(&self, doc: &ActionDoc) -> Result<Arc<dyn Action>> {
        let name = doc.name.clone().ok_or_else(|| {
            WatchworkError::InvalidSpec(format!(
                "top-level '{}' action is missing a name",
                doc.kind
            ))
        })?;
        self.decode_named(doc, name)
    }

    fn decode_named(&self, doc: &ActionDoc, name: String) -> Result<Arc<dyn Action>> {
        let constructor = self.constructors.get(&doc.kind).ok_or_else(|| {
            WatchworkError::InvalidSpec(format!(
                "unknown action type '{}' for '{}'",
                doc.kind, name
            ))
        })?;
        debug!("Decoding '{}' action '{}'", doc.kind, name);
        let common = self.decode_common(doc, name)?;
        constructor.construct(self, doc, common)
    }

    fn decode_common(&self, doc: &ActionDoc, name: String) -> Result<ActionCommon> {
        let mut common = ActionCommon::new(name);
        if let Some(timeout_ms) = doc.timeout_ms {
            common.timeout = Some(Duration::from_millis(timeout_ms));
        }
        if let Some(pattern) = &doc.trigger {
            let trigger = Regex::new(pattern).map_err(|error| {
                WatchworkError::InvalidSpec(format!(
                    "bad trigger pattern for '{}': {}",
                    common.name, error
                ))
            })?;
            common.trigger = Some(trigger);
        }
        if let Some(target) = &doc.on_success {
            common.on_success = Some(ActionRef::named(target));
        }
        if let Some(target) = &doc.on_error {
            common.on_error = Some(ActionRef::named(target));
        }
        common.bindings = doc.params.clone();
        Ok(common)
    }

    /// Decode one component edge of a compound action. Anonymous inline
    /// children are named `parent[index]`.
    pub fn decode_component(
        &self,
        parent: &str,
        index: usize,
        component: &ComponentRef,
    ) -> Result<ActionRef> {
        match component {
            ComponentRef::Name(name) => Ok(ActionRef::named(name)),
            ComponentRef::Inline(doc) => {
                let name = doc
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{}[{}]", parent, index));
                Ok(ActionRef::direct(self.decode_named(doc, name)?))
            }
        }
    }

    fn decode_components(&self, doc: &ActionDoc, parent: &str) -> Result<Vec<ActionRef>> {
        doc.components
            .iter()
            .enumerate()
            .map(|(index, component)| self.decode_component(parent, index, component))
            .collect()
    }
}

struct SequenceConstructor;

impl ActionConstructor for SequenceConstructor {
    fn construct(
        &self,
        decoder: &ActionDecoder,
        doc: &ActionDoc,
        common: ActionCommon,
    ) -> Result<Arc<dyn Action>> {
        let components = decoder.decode_components(doc, &common.name)?;
        Ok(Arc::new(SequenceAction::new(common, components)))
    }
}

struct ParallelConstructor;

impl ActionConstructor for ParallelConstructor {
    fn construct(
        &self,
        decoder: &ActionDecoder,
        doc: &ActionDoc,
        common: ActionCommon,
    ) -> Result<Arc<dyn Action>> {
        let components = decoder.decode_components(doc, &common.name)?;
        Ok(Arc::new(ParallelAction::new(common, components)))
    }
}

struct ScriptConstructor;

impl ActionConstructor for ScriptConstructor {
    fn construct(
        &self,
        _decoder: &ActionDecoder,
        doc: &ActionDoc,
        common: ActionCommon,
    ) -> Result<Arc<dyn Action>> {
        let script = doc.script.clone().ok_or_else(|| {
            WatchworkError::InvalidSpec(format!(
                "script action '{}' is missing a script path",
                common.name
            ))
        })?;
        let args = doc.args.clone().unwrap_or_default();
        Ok(Arc::new(ScriptAction::new(
            common,
            script,
            args,
            doc.env.clone(),
        )))
    }
}

struct WrappedConstructor;

impl ActionConstructor for WrappedConstructor {
    fn construct(
        &self,
        _decoder: &ActionDecoder,
        doc: &ActionDoc,
        common: ActionCommon,
    ) -> Result<Arc<dyn Action>> {
        let base = doc.base.clone().ok_or_else(|| {
            WatchworkError::InvalidSpec(format!(
                "wrapped action '{}' is missing a base action name",
                common.name
            ))
        })?;
        Ok(Arc::new(WrappedAction::new(common, ActionRef::named(base))))
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
