//! Merge-order resolution.
//!
//! The default order puts root sources first, in configuration order, then
//! every other source in configuration order. A named [`MergeOrderHook`]
//! may reorder the list; its output must be a permutation of the input and
//! root sources are still merged first, preserving the hook's relative
//! order within each group.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{HubError, Result};
use crate::models::BuildConfiguration;

/// Custom ordering function referenced by name from a configuration.
pub trait MergeOrderHook: Send + Sync {
    fn order(&self, sources: &[String]) -> Vec<String>;
}

impl<F> MergeOrderHook for F
where
    F: Fn(&[String]) -> Vec<String> + Send + Sync,
{
    fn order(&self, sources: &[String]) -> Vec<String> {
        self(sources)
    }
}

/// Named ordering hooks, looked up by `BuildConfiguration::merge_order_hook`.
#[derive(Default, Clone)]
pub struct OrderHookRegistry {
    hooks: BTreeMap<String, Arc<dyn MergeOrderHook>>,
}

impl OrderHookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, hook: Arc<dyn MergeOrderHook>) {
        self.hooks.insert(name.into(), hook);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MergeOrderHook>> {
        self.hooks.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks.keys().cloned().collect()
    }
}

/// Reject configurations that can never produce a valid build.
pub fn validate_configuration(config: &BuildConfiguration) -> Result<()> {
    if config.name.trim().is_empty() {
        return Err(HubError::config("build configuration name must not be empty"));
    }
    if config.doc_type.trim().is_empty() {
        return Err(HubError::config(format!(
            "build configuration '{}' has an empty doc_type",
            config.name
        )));
    }
    if config.sources.is_empty() {
        return Err(HubError::config(format!(
            "build configuration '{}' lists no sources",
            config.name
        )));
    }
    let mut seen = BTreeSet::new();
    for source in &config.sources {
        if !seen.insert(source.as_str()) {
            return Err(HubError::config(format!(
                "build configuration '{}' lists source '{}' twice",
                config.name, source
            )));
        }
    }
    let mut roots = BTreeSet::new();
    for root in &config.root_sources {
        if !seen.contains(root.as_str()) {
            return Err(HubError::config(format!(
                "root source '{}' of '{}' is not one of its sources",
                root, config.name
            )));
        }
        if !roots.insert(root.as_str()) {
            return Err(HubError::config(format!(
                "build configuration '{}' lists root source '{}' twice",
                config.name, root
            )));
        }
    }
    Ok(())
}

fn ensure_permutation(config: &BuildConfiguration, hook: &str, ordered: &[String]) -> Result<()> {
    let expected: BTreeSet<&str> = config.sources.iter().map(String::as_str).collect();
    let got: BTreeSet<&str> = ordered.iter().map(String::as_str).collect();
    if ordered.len() != config.sources.len() || got.len() != ordered.len() || got != expected {
        return Err(HubError::config(format!(
            "merge order hook '{}' returned {:?}, which is not a permutation of {:?}",
            hook, ordered, config.sources
        )));
    }
    Ok(())
}

pub struct MergeOrderResolver {
    hooks: OrderHookRegistry,
}

impl MergeOrderResolver {
    pub fn new(hooks: OrderHookRegistry) -> Self {
        Self { hooks }
    }

    /// Compute the merge sequence for `config`. Deterministic for a given
    /// configuration and hook.
    pub fn resolve(&self, config: &BuildConfiguration) -> Result<Vec<String>> {
        validate_configuration(config)?;

        let base = match &config.merge_order_hook {
            None => config.sources.clone(),
            Some(name) => {
                let hook = self.hooks.get(name).ok_or_else(|| {
                    HubError::config(format!(
                        "build configuration '{}' references unknown merge order hook '{}'",
                        config.name, name
                    ))
                })?;
                let ordered = hook.order(&config.sources);
                ensure_permutation(config, name, &ordered)?;
                ordered
            }
        };

        if config.root_sources.is_empty() {
            return Ok(base);
        }

        let mut order: Vec<String> = if config.merge_order_hook.is_some() {
            base.iter()
                .filter(|s| config.root_sources.contains(s))
                .cloned()
                .collect()
        } else {
            config.root_sources.clone()
        };
        order.extend(
            base.into_iter()
                .filter(|s| !config.root_sources.contains(s)),
        );
        Ok(order)
    }
}

impl Default for MergeOrderResolver {
    fn default() -> Self {
        Self::new(OrderHookRegistry::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_order_roots_first() {
        let cfg = BuildConfiguration::new("genes", "gene", &["a", "b", "c", "d"])
            .with_root_sources(&["c", "a"]);
        let order = MergeOrderResolver::default().resolve(&cfg).unwrap();
        assert_eq!(order, names(&["c", "a", "b", "d"]));
    }

    #[test]
    fn test_default_order_without_roots_is_config_order() {
        let cfg = BuildConfiguration::new("genes", "gene", &["z", "a", "m"]);
        let resolver = MergeOrderResolver::default();
        let first = resolver.resolve(&cfg).unwrap();
        assert_eq!(first, names(&["z", "a", "m"]));
        assert_eq!(resolver.resolve(&cfg).unwrap(), first);
    }

    #[test]
    fn test_hook_order_is_applied_within_root_groups() {
        let mut hooks = OrderHookRegistry::new();
        hooks.register(
            "reverse",
            Arc::new(|s: &[String]| s.iter().rev().cloned().collect::<Vec<_>>()),
        );
        let mut cfg = BuildConfiguration::new("genes", "gene", &["a", "b", "c", "d"])
            .with_root_sources(&["a", "c"]);
        cfg.merge_order_hook = Some("reverse".into());
        let order = MergeOrderResolver::new(hooks).resolve(&cfg).unwrap();
        assert_eq!(order, names(&["c", "a", "d", "b"]));
    }

    #[test]
    fn test_non_permutation_hook_is_configuration_error() {
        let mut hooks = OrderHookRegistry::new();
        hooks.register("drop", Arc::new(|s: &[String]| s[1..].to_vec()));
        hooks.register(
            "dup",
            Arc::new(|s: &[String]| vec![s[0].clone(), s[0].clone()]),
        );
        let resolver = MergeOrderResolver::new(hooks);
        for hook in ["drop", "dup", "missing"] {
            let mut cfg = BuildConfiguration::new("genes", "gene", &["a", "b"]);
            cfg.merge_order_hook = Some(hook.into());
            let err = resolver.resolve(&cfg).unwrap_err();
            assert_eq!(err.kind(), "configuration", "hook {hook}");
        }
    }

    #[test]
    fn test_validate_configuration() {
        let bad = BuildConfiguration::new("genes", "gene", &[]);
        assert!(validate_configuration(&bad).is_err());
        let bad = BuildConfiguration::new("genes", "gene", &["a", "a"]);
        assert!(validate_configuration(&bad).is_err());
        let bad = BuildConfiguration::new("genes", "gene", &["a"]).with_root_sources(&["b"]);
        assert!(validate_configuration(&bad).is_err());
        let bad = BuildConfiguration::new("genes", "", &["a"]);
        assert!(validate_configuration(&bad).is_err());
        let bad = BuildConfiguration::new("genes", "gene", &["a", "b"]).with_root_sources(&["a", "a"]);
        assert_eq!(validate_configuration(&bad).unwrap_err().kind(), "configuration");
    }

    #[test]
    fn test_repeated_root_source_is_rejected_by_resolver() {
        let cfg = BuildConfiguration::new("genes", "gene", &["a", "b"]).with_root_sources(&["a", "a"]);
        let err = MergeOrderResolver::default().resolve(&cfg).unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }
}
