//! Plugin modules and how the runtime finds them.
//!
//! A [`PluginModule`] is the executable body of one plugin file. The runtime
//! never touches the filesystem itself; a [`ModuleLoader`] maps paths to
//! modules and lists the files inside a plugin directory. [`ModuleTable`] is
//! the in-memory loader hosts register their plugins with.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{RuntimeError, RuntimeResult};
use crate::resolver::{node_name, plugin_dir};
use crate::scope::Scope;

/// The body of one plugin file.
///
/// `execute` runs synchronously while the node is active. Everything the
/// plugin declares goes through `scope`.
pub trait PluginModule: Send + Sync {
    /// Run the plugin body.
    ///
    /// # Errors
    ///
    /// Any error fails the node; teardown callbacks it already registered
    /// still run.
    fn execute(&self, scope: &mut Scope<'_>) -> anyhow::Result<()>;
}

/// A plugin module backed by a closure.
pub struct FnModule<F>(F);

impl<F> PluginModule for FnModule<F>
where
    F: Fn(&mut Scope<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, scope: &mut Scope<'_>) -> anyhow::Result<()> {
        (self.0)(scope)
    }
}

impl<F> fmt::Debug for FnModule<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnModule")
    }
}

/// Wrap a closure as a [`PluginModule`].
pub fn module_fn<F>(body: F) -> FnModule<F>
where
    F: Fn(&mut Scope<'_>) -> anyhow::Result<()> + Send + Sync,
{
    FnModule(body)
}

/// Maps plugin files to modules.
pub trait ModuleLoader: Send + Sync {
    /// Whether a module exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Load the module at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ModuleNotFound`] if nothing exists at `path`,
    /// or [`RuntimeError::Execution`] if the module could not be built.
    fn load(&self, path: &Path) -> RuntimeResult<Arc<dyn PluginModule>>;

    /// Plugin files directly inside `dir`, in load order.
    fn discover(&self, _dir: &Path) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Find the entry file named `name` in `search_dir`.
    fn locate(&self, search_dir: &Path, name: &str) -> Option<PathBuf> {
        let candidate = search_dir.join(name);
        self.exists(&candidate).then_some(candidate)
    }

    /// The module whose plugin directory is `dir`, if any.
    fn owner_module(&self, dir: &Path) -> Option<PathBuf> {
        self.exists(dir).then(|| dir.to_path_buf())
    }
}

type ModuleFactory = Arc<dyn Fn(&Path) -> anyhow::Result<Arc<dyn PluginModule>> + Send + Sync>;

/// In-memory [`ModuleLoader`].
///
/// Bindings can be replaced or removed at any time; a reload then picks up
/// the new module (or treats the file as deleted). Clones share the table.
#[derive(Clone, Default)]
pub struct ModuleTable {
    entries: Arc<RwLock<BTreeMap<PathBuf, ModuleFactory>>>,
}

impl fmt::Debug for ModuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleTable")
            .field("paths", &self.paths())
            .finish()
    }
}

impl ModuleTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `path` to a factory that builds the module on every load.
    pub fn bind<F>(&self, path: impl Into<PathBuf>, factory: F)
    where
        F: Fn(&Path) -> anyhow::Result<Arc<dyn PluginModule>> + Send + Sync + 'static,
    {
        self.write().insert(path.into(), Arc::new(factory));
    }

    /// Bind `path` to a fixed module.
    pub fn insert(&self, path: impl Into<PathBuf>, module: impl PluginModule + 'static) {
        let module: Arc<dyn PluginModule> = Arc::new(module);
        self.bind(path, move |_| Ok(Arc::clone(&module)));
    }

    /// Bind `path` to a closure body.
    pub fn define<F>(&self, path: impl Into<PathBuf>, body: F)
    where
        F: Fn(&mut Scope<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(path, module_fn(body));
    }

    /// Remove the binding for `path`. Returns whether one existed.
    pub fn remove(&self, path: &Path) -> bool {
        self.write().remove(path).is_some()
    }

    /// Whether `path` is bound.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.read().contains_key(path)
    }

    /// All bound paths in sorted order.
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.read().keys().cloned().collect()
    }

    /// Number of bound paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<PathBuf, ModuleFactory>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<PathBuf, ModuleFactory>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ModuleLoader for ModuleTable {
    fn exists(&self, path: &Path) -> bool {
        self.contains(path)
    }

    fn load(&self, path: &Path) -> RuntimeResult<Arc<dyn PluginModule>> {
        let factory = self
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| RuntimeError::ModuleNotFound(path.to_path_buf()))?;
        factory(path).map_err(|e| RuntimeError::Execution {
            path: path.to_path_buf(),
            message: format!("{e:#}"),
        })
    }

    fn discover(&self, dir: &Path) -> Vec<PathBuf> {
        self.read()
            .keys()
            .filter(|p| p.parent() == Some(dir) && plugin_dir(p) != dir)
            .cloned()
            .collect()
    }

    fn locate(&self, search_dir: &Path, name: &str) -> Option<PathBuf> {
        let exact = search_dir.join(name);
        let entries = self.read();
        if entries.contains_key(&exact) {
            return Some(exact);
        }
        entries
            .keys()
            .find(|p| {
                (p.parent() == Some(search_dir) || p.parent() == Some(exact.as_path()))
                    && node_name(p) == name
            })
            .cloned()
    }

    fn owner_module(&self, dir: &Path) -> Option<PathBuf> {
        self.read().keys().find(|p| plugin_dir(p) == dir).cloned()
    }
}
