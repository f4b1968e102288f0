//! Re-initialization of named, configuration-bound objects after an environment change.
//!
//! The host registers `(name, reset)` pairs. Rebinding a name runs its reset and records
//! any failure under that name; one failing name never stops the others. Recorded errors
//! are cleared only when a full [`ConfigurationRebinder::rebind_all`] starts.
//!
//! ```rust
//! use balanced_retry::rebind::{BoundConfig, ConfigurationRebinder};
//!
//! let rebinder = ConfigurationRebinder::new("app");
//! let limit = BoundConfig::new(10u32);
//! rebinder.register_bound("limits", limit.clone(), || Ok(25u32));
//!
//! assert!(rebinder.rebind("limits"));
//! assert_eq!(*limit.get(), 25);
//! assert!(!rebinder.rebind("unknown"));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use arc_swap::ArcSwap;
use tower::BoxError;
use tracing::{debug, info, warn};

/// Why rebinding one name failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RebindError {
    #[error("cannot rebind '{name}': {message}")]
    Failed { name: String, message: String },
    #[error("cannot rebind '{name}': reset panicked")]
    Panicked { name: String },
}

impl RebindError {
    /// Name the failure was recorded under.
    pub fn name(&self) -> &str {
        match self {
            Self::Failed { name, .. } | Self::Panicked { name } => name,
        }
    }
}

/// Something that can be torn down and rebuilt from current configuration.
pub trait Rebindable: Send + Sync {
    fn rebind(&self) -> Result<(), BoxError>;
}

impl<F> Rebindable for F
where
    F: Fn() -> Result<(), BoxError> + Send + Sync,
{
    fn rebind(&self) -> Result<(), BoxError> {
        (self)()
    }
}

/// Live configuration value that readers load lock-free and rebinding replaces.
pub struct BoundConfig<T> {
    current: Arc<ArcSwap<T>>,
}

impl<T> BoundConfig<T> {
    /// Handle holding `initial`; clones share the same slot.
    pub fn new(initial: T) -> Self {
        Self { current: Arc::new(ArcSwap::from_pointee(initial)) }
    }

    /// Current value. Readers never block a concurrent `set`.
    pub fn get(&self) -> Arc<T> {
        self.current.load_full()
    }

    pub fn set(&self, value: T) {
        self.current.store(Arc::new(value));
    }
}

impl<T> Clone for BoundConfig<T> {
    fn clone(&self) -> Self {
        Self { current: self.current.clone() }
    }
}

impl<T: fmt::Debug> fmt::Debug for BoundConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BoundConfig").field(&self.get()).finish()
    }
}

/// Notification that configuration keys changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentChangeEvent {
    /// Id of the context that published the change.
    pub source: String,
    pub keys: BTreeSet<String>,
}

impl EnvironmentChangeEvent {
    pub fn new(source: impl Into<String>, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { source: source.into(), keys: keys.into_iter().map(Into::into).collect() }
    }
}

/// Registry of rebindable objects with per-name error bookkeeping.
pub struct ConfigurationRebinder {
    context_id: String,
    targets: RwLock<BTreeMap<String, Arc<dyn Rebindable>>>,
    errors: Mutex<BTreeMap<String, RebindError>>,
}

impl fmt::Debug for ConfigurationRebinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurationRebinder")
            .field("context_id", &self.context_id)
            .field("managed", &self.managed_names())
            .field("errors", &self.errors())
            .finish()
    }
}

impl ConfigurationRebinder {
    /// `context_id` identifies the context whose change events trigger a rebind.
    pub fn new(context_id: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            targets: RwLock::new(BTreeMap::new()),
            errors: Mutex::new(BTreeMap::new()),
        }
    }

    /// Id of the context this rebinder listens to.
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Manage `target` under `name`, replacing any previous registration.
    pub fn register<R>(&self, name: impl Into<String>, target: R)
    where
        R: Rebindable + 'static,
    {
        let name = name.into();
        let mut targets = self.targets.write().expect("rebinder targets poisoned");
        if targets.insert(name.clone(), Arc::new(target)).is_some() {
            warn!(target: "balanced_retry::rebind", name = %name, "rebind target replaced; last registration wins");
        }
    }

    /// Manage a [`BoundConfig`]: rebinding calls `loader` and swaps in the result.
    pub fn register_bound<T, F>(&self, name: impl Into<String>, handle: BoundConfig<T>, loader: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> Result<T, BoxError> + Send + Sync + 'static,
    {
        self.register(name, move || -> Result<(), BoxError> {
            handle.set(loader()?);
            Ok(())
        });
    }

    /// Rebind one name. False when the name is unmanaged or its reset failed; a failure is
    /// recorded under the name.
    pub fn rebind(&self, name: &str) -> bool {
        let target = self.targets.read().expect("rebinder targets poisoned").get(name).cloned();
        let Some(target) = target else {
            debug!(target: "balanced_retry::rebind", name, "not a managed name");
            return false;
        };

        let error = match catch_unwind(AssertUnwindSafe(|| target.rebind())) {
            Ok(Ok(())) => return true,
            Ok(Err(source)) => RebindError::Failed { name: name.to_string(), message: source.to_string() },
            Err(_) => RebindError::Panicked { name: name.to_string() },
        };
        warn!(target: "balanced_retry::rebind", name, error = %error, "rebind failed");
        self.errors.lock().expect("rebinder errors poisoned").insert(name.to_string(), error);
        false
    }

    /// Clear recorded errors, then rebind every managed name in order.
    pub fn rebind_all(&self) {
        self.errors.lock().expect("rebinder errors poisoned").clear();
        for name in self.managed_names() {
            self.rebind(&name);
        }
    }

    /// Failures recorded since the last `rebind_all` started.
    pub fn errors(&self) -> BTreeMap<String, RebindError> {
        self.errors.lock().expect("rebinder errors poisoned").clone()
    }

    /// Registered names in sorted order.
    pub fn managed_names(&self) -> BTreeSet<String> {
        self.targets.read().expect("rebinder targets poisoned").keys().cloned().collect()
    }

    /// Rebind everything if the event came from this context. Events whose key set is just
    /// the source id are accepted too. Returns whether a rebind ran.
    pub fn on_environment_change(&self, event: &EnvironmentChangeEvent) -> bool {
        let own = event.source == self.context_id;
        let legacy = event.keys.len() == 1 && event.keys.contains(&event.source);
        if !(own || legacy) {
            debug!(target: "balanced_retry::rebind", source = %event.source, "ignoring change from another context");
            return false;
        }
        info!(target: "balanced_retry::rebind", keys = event.keys.len(), "environment changed; rebinding");
        self.rebind_all();
        true
    }
}
