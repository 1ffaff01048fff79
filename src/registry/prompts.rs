//! Prompt registry
//!
//! Prompts are text templates with `{argument}` placeholders. Any brace-free
//! text between braces names an argument, so `{trip-id}` and `{from.station}`
//! are placeholders too. A placeholder with no supplied value is left as
//! written so a partially filled prompt still reads sensibly.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::info;

use super::RegistryError;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([^{}]+)\}").expect("placeholder pattern compiles")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub arguments: Vec<PromptArgument>,
}

#[derive(Debug, Clone)]
pub struct PromptDefinition {
    pub info: PromptInfo,
    pub template: String,
}

pub trait PromptProvider: Send + Sync {
    fn prompts(&self) -> Vec<PromptDefinition>;
}

#[derive(Debug, Default)]
pub struct PromptRegistry {
    entries: Vec<PromptDefinition>,
    by_name: HashMap<String, usize>,
}

impl PromptRegistry {
    pub fn build(providers: &[Arc<dyn PromptProvider>]) -> Result<Self, RegistryError> {
        let mut registry = Self::default();

        for provider in providers {
            for definition in provider.prompts() {
                let name = definition.info.name.clone();
                if registry.by_name.contains_key(&name) {
                    return Err(RegistryError::Duplicate { kind: "prompt", name });
                }
                registry.by_name.insert(name, registry.entries.len());
                registry.entries.push(definition);
            }
        }

        info!(prompts = registry.entries.len(), "prompt registry built");
        Ok(registry)
    }

    pub fn list(&self) -> Vec<PromptInfo> {
        self.entries.iter().map(|entry| entry.info.clone()).collect()
    }

    /// Renders the named prompt as a `prompts/get` result, or `None` if unknown.
    pub fn get(&self, name: &str, arguments: &Map<String, Value>) -> Option<Value> {
        let entry = &self.entries[*self.by_name.get(name)?];
        let text = render_template(&entry.template, arguments);

        Some(json!({
            "description": entry.info.description,
            "messages": [{
                "role": "user",
                "content": {
                    "type": "text",
                    "text": text,
                },
            }],
        }))
    }
}

/// Substitutes `{name}` placeholders; unknown ones stay verbatim.
pub fn render_template(template: &str, arguments: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |captures: &Captures<'_>| {
            match arguments.get(&captures[1]) {
                Some(Value::String(value)) => value.clone(),
                Some(value) => value.to_string(),
                None => captures[0].to_string(),
            }
        })
        .into_owned()
}
