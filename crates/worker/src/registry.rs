use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::module::WorkerModule;

/// Builds a fresh module instance for a worker unit.
pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn WorkerModule> + Send + Sync>;

/// Maps module paths to module factories.
///
/// Rust cannot load code by path at runtime, so a worker executable (or
/// the farm, for thread and in-process backends) declares up front which
/// modules it can serve. A default module answers every path that has no
/// explicit entry.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, ModuleFactory>,
    fallback: Option<ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M, F>(mut self, module_path: impl Into<String>, factory: F) -> Self
    where
        M: WorkerModule + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        self.modules
            .insert(module_path.into(), Arc::new(move || Box::new(factory())));
        self
    }

    pub fn with_default<M, F>(mut self, factory: F) -> Self
    where
        M: WorkerModule + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(move || Box::new(factory())));
        self
    }

    /// Instantiate the module registered for `module_path`.
    pub fn resolve(&self, module_path: &str) -> Option<Box<dyn WorkerModule>> {
        self.modules
            .get(module_path)
            .or(self.fallback.as_ref())
            .map(|factory| factory())
    }

    pub fn contains(&self, module_path: &str) -> bool {
        self.modules.contains_key(module_path) || self.fallback.is_some()
    }

    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.paths())
            .field("has_default", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::FnModule;

    #[test]
    fn explicit_entry_wins_over_default() {
        let registry = ModuleRegistry::new()
            .register("parser", || FnModule::new().export("parse", |_a, _c| Ok(serde_json::json!("p"))))
            .with_default(FnModule::new);
        assert!(registry.contains("parser"));
        assert!(registry.contains("anything/else"));
        assert_eq!(registry.paths(), vec!["parser"]);
        assert!(registry.resolve("anything/else").is_some());
    }

    #[test]
    fn missing_module_without_default() {
        let registry = ModuleRegistry::new().register("a", FnModule::new);
        assert!(!registry.contains("b"));
        assert!(registry.resolve("b").is_none());
    }
}
