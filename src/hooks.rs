//! Named extension points referenced from build configurations.
//!
//! A configuration never names code directly; it names an entry of the
//! [`HookRegistry`]:
//!
//! | Config field | Registry | Built-ins |
//! |--------------|----------|-----------|
//! | `merge_order_hook` | [`OrderHookRegistry`] | `alphabetical` |
//! | `builder` | [`BuilderExtension`] | `strip-underscore-fields` |
//! | `post_merge_hook` | [`PostMergeHook`] | `drop-empty-fields` |
//!
//! Unknown names are configuration errors, raised before a build starts.

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use biohub_core::cancel::CancelToken;
use biohub_core::models::{BuildConfiguration, Document};
use biohub_core::order::{MergeOrderHook, OrderHookRegistry};
use biohub_core::store::DocumentStore;
use biohub_core::{HubError, Result};

/// Customizes how one build configuration merges its sources.
#[async_trait]
pub trait BuilderExtension: Send + Sync {
    /// Rewrite or drop a source document before it is merged.
    fn transform(&self, _source: &str, doc: Document) -> Option<Document> {
        Some(doc)
    }

    /// Runs once every source is merged, before the post-merge hook.
    async fn finalize(
        &self,
        _store: &dyn DocumentStore,
        _collection: &str,
        _cancel: &CancelToken,
    ) -> AnyResult<()> {
        Ok(())
    }
}

/// Arbitrary transform over the whole merged collection.
///
/// Implementations that page through the collection should check `cancel`
/// between pages.
#[async_trait]
pub trait PostMergeHook: Send + Sync {
    /// Returns the number of documents it rewrote.
    async fn run(
        &self,
        store: &dyn DocumentStore,
        collection: &str,
        batch_size: usize,
        cancel: &CancelToken,
    ) -> AnyResult<u64>;
}

/// Drops top-level fields whose name starts with `_` (other than `_id`).
pub struct StripUnderscoreFields;

impl BuilderExtension for StripUnderscoreFields {
    fn transform(&self, _source: &str, mut doc: Document) -> Option<Document> {
        doc.fields.retain(|k, _| !k.starts_with('_'));
        Some(doc)
    }
}

/// Removes `null`, empty strings, empty lists and empty objects, recursively.
pub struct DropEmptyFields;

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn prune(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                prune(child);
            }
            map.retain(|_, v| !is_empty_value(v));
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                prune(child);
            }
        }
        _ => {}
    }
}

#[async_trait]
impl PostMergeHook for DropEmptyFields {
    async fn run(
        &self,
        store: &dyn DocumentStore,
        collection: &str,
        batch_size: usize,
        cancel: &CancelToken,
    ) -> AnyResult<u64> {
        let mut after: Option<String> = None;
        let mut rewritten = 0u64;
        loop {
            cancel.check()?;
            let page = store
                .list_documents(collection, after.as_deref(), batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());

            let mut changed = Vec::new();
            for doc in page {
                let mut value = Value::Object(doc.fields.clone());
                prune(&mut value);
                if let Value::Object(fields) = value {
                    if fields != doc.fields {
                        changed.push(Document { id: doc.id, fields });
                    }
                }
            }
            if !changed.is_empty() {
                rewritten += changed.len() as u64;
                store.upsert_documents(collection, &changed).await?;
            }
        }
        Ok(rewritten)
    }
}

/// The extension points resolved for one build.
pub struct ResolvedHooks {
    pub builder: Option<Arc<dyn BuilderExtension>>,
    pub post_merge: Option<Arc<dyn PostMergeHook>>,
}

#[derive(Clone, Default)]
pub struct HookRegistry {
    order: OrderHookRegistry,
    builders: BTreeMap<String, Arc<dyn BuilderExtension>>,
    post_merge: BTreeMap<String, Arc<dyn PostMergeHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in hooks.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_order_hook(
            "alphabetical",
            Arc::new(|sources: &[String]| {
                let mut sorted = sources.to_vec();
                sorted.sort();
                sorted
            }),
        );
        registry.register_builder("strip-underscore-fields", Arc::new(StripUnderscoreFields));
        registry.register_post_merge("drop-empty-fields", Arc::new(DropEmptyFields));
        registry
    }

    pub fn register_order_hook(&mut self, name: &str, hook: Arc<dyn MergeOrderHook>) {
        self.order.register(name, hook);
    }

    pub fn register_builder(&mut self, name: &str, builder: Arc<dyn BuilderExtension>) {
        self.builders.insert(name.to_string(), builder);
    }

    pub fn register_post_merge(&mut self, name: &str, hook: Arc<dyn PostMergeHook>) {
        self.post_merge.insert(name.to_string(), hook);
    }

    pub fn order_hooks(&self) -> &OrderHookRegistry {
        &self.order
    }

    /// Look up every hook a configuration references.
    pub fn resolve(&self, config: &BuildConfiguration) -> Result<ResolvedHooks> {
        let builder = match &config.builder {
            None => None,
            Some(name) => Some(self.builders.get(name).cloned().ok_or_else(|| {
                HubError::config(format!(
                    "build configuration '{}' references unknown builder '{}'",
                    config.name, name
                ))
            })?),
        };
        let post_merge = match &config.post_merge_hook {
            None => None,
            Some(name) => Some(self.post_merge.get(name).cloned().ok_or_else(|| {
                HubError::config(format!(
                    "build configuration '{}' references unknown post-merge hook '{}'",
                    config.name, name
                ))
            })?),
        };
        Ok(ResolvedHooks {
            builder,
            post_merge,
        })
    }

    pub fn names(&self) -> BTreeMap<&'static str, Vec<String>> {
        let mut names = BTreeMap::new();
        names.insert("merge_order_hook", self.order.names());
        names.insert("builder", self.builders.keys().cloned().collect());
        names.insert("post_merge_hook", self.post_merge.keys().cloned().collect());
        names
    }
}
