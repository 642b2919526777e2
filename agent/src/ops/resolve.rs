//! Effective configuration of install and redeploy operations

use std::collections::BTreeMap;

use serde_yaml::Value;

use crate::catalog::TemplateCatalog;
use crate::errors::AppError;
use crate::models::stack::{InstalledStackConfig, StorageMappingStrategy};
use crate::models::template::AppTemplate;
use crate::storage::store::StackStore;

pub const MIN_WEB_UI_PORT: i64 = 1024;
pub const MAX_WEB_UI_PORT: i64 = 65535;

/// Catalog template of `app_id`, falling back to user-defined templates
pub async fn find_template(catalog: &dyn TemplateCatalog, app_id: &str) -> Result<AppTemplate, AppError> {
    if let Some(template) = catalog.find_catalog_template(app_id).await? {
        return Ok(template);
    }
    catalog
        .find_custom_template(app_id)
        .await?
        .ok_or_else(|| AppError::ValidationError(format!("No template found for app {}", app_id)))
}

/// Parse compose text far enough to inspect its services
pub fn parse_compose(content: &str) -> Result<Value, AppError> {
    let doc: Value = serde_yaml::from_str(content)
        .map_err(|e| AppError::ValidationError(format!("Invalid compose definition: {}", e)))?;

    match doc.get("services") {
        Some(Value::Mapping(services)) if !services.is_empty() => Ok(doc),
        _ => Err(AppError::ValidationError(
            "Compose definition declares no services".to_string(),
        )),
    }
}

/// The service carrying the web UI.
///
/// The template's `primary_service` wins, then a service named like the app
/// or its stack, then the first declared service.
pub fn primary_service<'a>(
    compose: &'a Value,
    template: &AppTemplate,
    app_id: &str,
    stack_name: &str,
) -> Option<(&'a str, &'a Value)> {
    let services = compose.get("services")?.as_mapping()?;
    let named = |name: &str| {
        services
            .iter()
            .find(|(k, _)| k.as_str() == Some(name))
            .and_then(|(k, v)| Some((k.as_str()?, v)))
    };

    template
        .primary_service
        .as_deref()
        .and_then(named)
        .or_else(|| named(app_id))
        .or_else(|| named(stack_name))
        .or_else(|| {
            services
                .iter()
                .next()
                .and_then(|(k, v)| Some((k.as_str()?, v)))
        })
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Environment declared by a service, in map or `KEY=value` list form
pub fn service_environment(service: &Value) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    match service.get("environment") {
        Some(Value::Mapping(map)) => {
            for (key, value) in map {
                if let (Some(key), Some(value)) = (key.as_str(), scalar_string(value)) {
                    env.insert(key.to_string(), value);
                }
            }
        }
        Some(Value::Sequence(items)) => {
            for item in items.iter().filter_map(Value::as_str) {
                match item.split_once('=') {
                    Some((key, value)) => env.insert(key.to_string(), value.to_string()),
                    None => env.insert(item.to_string(), String::new()),
                };
            }
        }
        _ => {}
    }
    env
}

/// Host side of the first published port of a service
pub fn service_published_port(service: &Value) -> Option<u16> {
    let ports = service.get("ports")?.as_sequence()?;
    ports.iter().find_map(|port| match port {
        Value::String(spec) => {
            let spec = spec.split('/').next()?;
            let parts: Vec<&str> = spec.rsplitn(3, ':').collect();
            // parts are reversed: container, host[, ip]
            if parts.len() < 2 {
                return None;
            }
            parts[1].parse().ok()
        }
        Value::Mapping(_) => port
            .get("published")
            .and_then(scalar_string)
            .and_then(|p| p.parse().ok()),
        _ => None,
    })
}

fn template_defaults(template: &AppTemplate) -> BTreeMap<String, String> {
    template
        .env
        .iter()
        .filter_map(|var| Some((var.name.clone(), var.default.clone()?)))
        .collect()
}

/// Merge for inline or previously installed compose definitions:
/// template defaults, then compose-declared values, then the existing
/// install, then requested overrides. Any key is accepted.
pub fn merge_env_permissive(
    template: &AppTemplate,
    declared: &BTreeMap<String, String>,
    existing: Option<&BTreeMap<String, String>>,
    requested: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = template_defaults(template);
    env.extend(declared.clone());
    if let Some(existing) = existing {
        env.extend(existing.clone());
    }
    env.extend(requested.clone());
    env
}

/// Merge for template-hosted compose definitions, restricted to the keys
/// the template declares. Requesting any other key fails.
pub fn merge_env_whitelisted(
    template: &AppTemplate,
    existing: Option<&BTreeMap<String, String>>,
    requested: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, AppError> {
    let unknown: Vec<&str> = requested
        .keys()
        .filter(|key| !template.declares_env(key))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(AppError::ValidationError(format!(
            "Unknown environment variable(s) for {}: {}",
            template.template_name,
            unknown.join(", ")
        )));
    }

    let mut env = template_defaults(template);
    if let Some(existing) = existing {
        env.extend(
            existing
                .iter()
                .filter(|(key, _)| template.declares_env(key))
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }
    env.extend(requested.clone());
    Ok(env)
}

/// Where a resolved web UI port came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSource {
    Requested,
    Existing,
    Inferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPort {
    pub port: u16,
    pub source: PortSource,
}

impl ResolvedPort {
    /// Whether the compose file must be rewritten to publish this port
    pub fn needs_override(&self) -> bool {
        self.source != PortSource::Inferred
    }
}

/// Requested port first, then the existing install's, then the inferred one.
///
/// A requested port must lie in 1024..=65535.
pub fn resolve_port(
    requested: Option<i64>,
    existing: Option<u16>,
    inferred: Option<u16>,
) -> Result<Option<ResolvedPort>, AppError> {
    if let Some(port) = requested {
        if !(MIN_WEB_UI_PORT..=MAX_WEB_UI_PORT).contains(&port) {
            return Err(AppError::ValidationError(format!(
                "Web UI port {} is outside {}-{}",
                port, MIN_WEB_UI_PORT, MAX_WEB_UI_PORT
            )));
        }
        return Ok(Some(ResolvedPort {
            port: port as u16,
            source: PortSource::Requested,
        }));
    }

    Ok(existing
        .map(|port| ResolvedPort {
            port,
            source: PortSource::Existing,
        })
        .or_else(|| {
            inferred.map(|port| ResolvedPort {
                port,
                source: PortSource::Inferred,
            })
        }))
}

/// Fail when another app already publishes `port`
pub async fn ensure_port_available(store: &dyn StackStore, port: u16, app_id: &str) -> Result<(), AppError> {
    match store.find_stack_by_web_ui_port(port, Some(app_id)).await? {
        Some(owner) => Err(AppError::ValidationError(format!(
            "Web UI port {} is already used by {}",
            port, owner.app_id
        ))),
        None => Ok(()),
    }
}

/// Brand-new installs get app-scoped storage; anything deployed before keeps its layout
pub fn choose_strategy(existing: Option<&InstalledStackConfig>, redeploy: bool) -> StorageMappingStrategy {
    if existing.is_none() && !redeploy {
        StorageMappingStrategy::AppTargetPath
    } else {
        StorageMappingStrategy::LegacyNamedSource
    }
}
