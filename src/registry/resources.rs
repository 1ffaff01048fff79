//! Resource registry
//!
//! Resources are addressed by URI. Fixed URIs are matched exactly first; URI
//! templates (`runtime://sessions/{sessionId}`) are tried afterwards in
//! registration order, each `{var}` matching a single path segment.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use rust_mcp_sdk::schema::{
    ReadResourceContent, ReadResourceResult, Resource, TextResourceContents,
};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::{HandlerError, RegistryError};
use crate::mcp::context::RequestContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

impl ResourceInfo {
    fn to_resource(&self) -> Resource {
        Resource {
            annotations: None,
            description: self.description.clone(),
            icons: vec![],
            meta: None,
            mime_type: self.mime_type.clone(),
            name: self.name.clone(),
            size: None,
            title: None,
            uri: self.uri.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplateInfo {
    pub uri_template: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceContents {
    pub uri: String,
    pub mime_type: Option<String>,
    pub text: String,
}

impl ResourceContents {
    pub fn json(uri: impl Into<String>, value: &Value) -> Self {
        Self {
            uri: uri.into(),
            mime_type: Some("application/json".to_string()),
            text: value.to_string(),
        }
    }
}

#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// `variables` holds the template captures; empty for fixed URIs.
    async fn read(
        &self,
        ctx: &RequestContext,
        uri: &str,
        variables: &HashMap<String, String>,
    ) -> Result<ResourceContents, HandlerError>;
}

pub enum ResourceDefinition {
    Fixed {
        info: ResourceInfo,
        handler: Arc<dyn ResourceHandler>,
    },
    Template {
        info: ResourceTemplateInfo,
        handler: Arc<dyn ResourceHandler>,
    },
}

pub trait ResourceProvider: Send + Sync {
    fn resources(&self) -> Vec<ResourceDefinition>;
}

#[derive(Debug)]
pub enum ResourceReadError {
    UnknownResource(String),
    Failed(HandlerError),
}

struct UriTemplate {
    pattern: Regex,
    variables: Vec<String>,
}

impl UriTemplate {
    fn compile(template: &str) -> Result<Self, RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let mut pattern = String::from("^");
        let mut variables = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            pattern.push_str(&regex::escape(&rest[..open]));
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| invalid("unclosed '{'"))?;
            let name = &after[..close];

            let well_formed = name
                .chars()
                .next()
                .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !well_formed {
                return Err(invalid("variable names must be identifiers"));
            }
            if variables.iter().any(|existing| existing == name) {
                return Err(invalid("variable used twice"));
            }

            pattern.push_str(&format!("(?P<{name}>[^/]+)"));
            variables.push(name.to_string());
            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            return Err(invalid("unmatched '}'"));
        }
        pattern.push_str(&regex::escape(rest));
        pattern.push('$');

        let pattern = Regex::new(&pattern).map_err(|err| invalid(&err.to_string()))?;
        Ok(Self { pattern, variables })
    }

    fn captures(&self, uri: &str) -> Option<HashMap<String, String>> {
        let captures = self.pattern.captures(uri)?;
        Some(
            self.variables
                .iter()
                .filter_map(|name| {
                    captures
                        .name(name)
                        .map(|value| (name.clone(), value.as_str().to_string()))
                })
                .collect(),
        )
    }
}

struct TemplateEntry {
    info: ResourceTemplateInfo,
    template: UriTemplate,
    handler: Arc<dyn ResourceHandler>,
}

#[derive(Default)]
pub struct ResourceRegistry {
    fixed: Vec<(ResourceInfo, Arc<dyn ResourceHandler>)>,
    by_uri: HashMap<String, usize>,
    templates: Vec<TemplateEntry>,
}

impl ResourceRegistry {
    pub fn build(providers: &[Arc<dyn ResourceProvider>]) -> Result<Self, RegistryError> {
        let mut registry = Self::default();

        for provider in providers {
            for definition in provider.resources() {
                match definition {
                    ResourceDefinition::Fixed { info, handler } => {
                        if registry.by_uri.contains_key(&info.uri) {
                            return Err(RegistryError::Duplicate {
                                kind: "resource",
                                name: info.uri,
                            });
                        }
                        registry.by_uri.insert(info.uri.clone(), registry.fixed.len());
                        registry.fixed.push((info, handler));
                    }
                    ResourceDefinition::Template { info, handler } => {
                        if registry
                            .templates
                            .iter()
                            .any(|entry| entry.info.uri_template == info.uri_template)
                        {
                            return Err(RegistryError::Duplicate {
                                kind: "resource template",
                                name: info.uri_template,
                            });
                        }
                        let template = UriTemplate::compile(&info.uri_template)?;
                        registry.templates.push(TemplateEntry {
                            info,
                            template,
                            handler,
                        });
                    }
                }
            }
        }

        info!(
            resources = registry.fixed.len(),
            templates = registry.templates.len(),
            "resource registry built"
        );
        Ok(registry)
    }

    pub fn list(&self) -> Vec<Resource> {
        self.fixed.iter().map(|(info, _)| info.to_resource()).collect()
    }

    pub fn list_templates(&self) -> Vec<ResourceTemplateInfo> {
        self.templates.iter().map(|entry| entry.info.clone()).collect()
    }

    pub async fn read(
        &self,
        ctx: &RequestContext,
        uri: &str,
    ) -> Result<ReadResourceResult, ResourceReadError> {
        let outcome = if let Some(index) = self.by_uri.get(uri) {
            let (_, handler) = &self.fixed[*index];
            handler.read(ctx, uri, &HashMap::new()).await
        } else {
            let matched = self.templates.iter().find_map(|entry| {
                entry
                    .template
                    .captures(uri)
                    .map(|variables| (entry, variables))
            });
            let Some((entry, variables)) = matched else {
                return Err(ResourceReadError::UnknownResource(uri.to_string()));
            };
            entry.handler.read(ctx, uri, &variables).await
        };
        let contents = outcome.map_err(ResourceReadError::Failed)?;

        Ok(ReadResourceResult {
            contents: vec![ReadResourceContent::from(TextResourceContents {
                meta: None,
                mime_type: contents.mime_type,
                text: contents.text,
                uri: contents.uri,
            })],
            meta: None,
        })
    }
}
