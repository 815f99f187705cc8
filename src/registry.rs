use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

/// A callable reachable by name: flat argument list in, one JSON value out.
pub type Method = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// The named methods of one target (an engine component, the storage, a UI class).
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: BTreeMap<String, Method>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F, Fut>(&mut self, name: impl Into<String>, method: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.methods
            .insert(name.into(), Arc::new(move |args| method(args).boxed()));
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.insert(name, method);
        self
    }

    pub fn get(&self, name: &str) -> Option<Method> {
        self.methods.get(name).cloned()
    }

    /// Method names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    /// `None` when no method of that name exists.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Option<anyhow::Result<Value>> {
        let method = self.get(name)?;
        Some(method(args).await)
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.methods.keys()).finish()
    }
}

/// Result of a `(target, method)` lookup.
pub enum Lookup {
    Found(Method),
    MissingTarget,
    MissingMethod,
}

/// `target -> MethodTable`, populated at startup.
#[derive(Debug, Default)]
pub struct MethodRegistry {
    targets: DashMap<String, MethodTable>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any table previously registered under `target`.
    pub fn register(&self, target: impl Into<String>, table: MethodTable) {
        self.targets.insert(target.into(), table);
    }

    pub fn lookup(&self, target: &str, method: &str) -> Lookup {
        match self.targets.get(target) {
            None => Lookup::MissingTarget,
            Some(table) => match table.get(method) {
                Some(found) => Lookup::Found(found),
                None => Lookup::MissingMethod,
            },
        }
    }

    pub fn methods_of(&self, target: &str) -> Option<Vec<String>> {
        self.targets.get(target).map(|table| table.names())
    }

    /// Target names in sorted order.
    pub fn targets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
