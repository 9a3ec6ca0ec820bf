//! Dependency-injection container.
//!
//! Maps a key (type identity plus optional name) to a factory and a scope.
//! Singleton construction is single-flight per key: concurrent first
//! resolutions wait on one in-progress construction and all observe the same
//! instance. The factory runs in a spawned task, so a caller that gives up
//! waiting does not cancel it, and a failure is shared by every caller that
//! was waiting on that attempt. There is no registry-wide lock held across a
//! factory call, so unrelated singletons construct concurrently.
//!
//! Factories receive a [`Resolver`] that carries the chain of keys being
//! constructed. Resolving a key already on the chain fails with
//! [`ContainerError::CircularDependency`] instead of deadlocking.

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ContainerError {
    #[error("No registration for {0}")]
    UnregisteredKey(String),

    #[error("Circular dependency: {}", .chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },

    #[error("Key already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Registered instance for {0} has an unexpected type")]
    TypeMismatch(String),

    #[error("Factory failed: {0}")]
    Factory(String),
}

impl ContainerError {
    pub fn factory(err: impl fmt::Display) -> Self {
        Self::Factory(err.to_string())
    }
}

/// Instance lifetime for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// One lazily built instance shared by every resolution.
    #[default]
    Singleton,
    /// A new instance per resolution.
    Transient,
}

/// Registration key.
#[derive(Clone)]
pub struct Key {
    type_id: TypeId,
    type_name: &'static str,
    name: Option<String>,
}

impl Key {
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            name: None,
        }
    }

    pub fn named<T: 'static>(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::of::<T>()
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.name == other.name
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}#{}", self.type_name, name),
            None => f.write_str(self.type_name),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(Resolver) -> BoxFuture<'static, Result<Instance, ContainerError>> + Send + Sync>;
type SharedBuild = Shared<BoxFuture<'static, Result<Instance, ContainerError>>>;

#[derive(Default)]
struct SingletonSlot {
    instance: Option<Instance>,
    /// In-progress construction. Cleared when it settles.
    pending: Option<SharedBuild>,
}

struct Registration {
    scope: Scope,
    factory: Option<Factory>,
    slot: Mutex<SingletonSlot>,
    constructions: AtomicU64,
}

struct ContainerInner {
    registrations: DashMap<Key, Arc<Registration>>,
}

/// Thread-safe registry of component factories. Cheap to clone.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                registrations: DashMap::new(),
            }),
        }
    }

    /// Register a factory for `T` under the given scope.
    pub fn register<T, F, Fut>(&self, scope: Scope, factory: F) -> Result<(), ContainerError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ContainerError>> + Send + 'static,
    {
        self.insert(Key::of::<T>(), scope, Some(erase(factory)), None)
    }

    /// Register a factory for `T` under an explicit name.
    pub fn register_named<T, F, Fut>(
        &self,
        name: &str,
        scope: Scope,
        factory: F,
    ) -> Result<(), ContainerError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ContainerError>> + Send + 'static,
    {
        self.insert(Key::named::<T>(name), scope, Some(erase(factory)), None)
    }

    /// Register a pre-built singleton.
    pub fn register_instance<T>(&self, instance: T) -> Result<(), ContainerError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let instance: Instance = Arc::new(instance);
        self.insert(Key::of::<T>(), Scope::Singleton, None, Some(instance))
    }

    pub async fn resolve<T>(&self) -> Result<T, ContainerError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.resolver().resolve::<T>().await
    }

    pub async fn resolve_named<T>(&self, name: &str) -> Result<T, ContainerError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.resolver().resolve_named::<T>(name).await
    }

    pub fn is_registered<T: 'static>(&self) -> bool {
        self.inner.registrations.contains_key(&Key::of::<T>())
    }

    /// How many times the factory for `key` has completed successfully.
    pub fn construction_count(&self, key: &Key) -> u64 {
        self.inner
            .registrations
            .get(key)
            .map(|r| r.constructions.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.registrations.is_empty()
    }

    /// Drop every binding and cached singleton.
    pub fn clear(&self) {
        let count = self.inner.registrations.len();
        self.inner.registrations.clear();
        tracing::debug!(registrations = count, "Container cleared");
    }

    fn resolver(&self) -> Resolver {
        Resolver {
            container: self.clone(),
            chain: Arc::new(Vec::new()),
        }
    }

    fn insert(
        &self,
        key: Key,
        scope: Scope,
        factory: Option<Factory>,
        instance: Option<Instance>,
    ) -> Result<(), ContainerError> {
        use dashmap::mapref::entry::Entry;

        match self.inner.registrations.entry(key) {
            Entry::Occupied(entry) => Err(ContainerError::AlreadyRegistered(entry.key().to_string())),
            Entry::Vacant(entry) => {
                tracing::debug!(key = %entry.key(), ?scope, "Registered component");
                entry.insert(Arc::new(Registration {
                    scope,
                    factory,
                    slot: Mutex::new(SingletonSlot { instance, pending: None }),
                    constructions: AtomicU64::new(0),
                }));
                Ok(())
            }
        }
    }

    async fn resolve_key<T>(&self, key: Key, chain: &Arc<Vec<Key>>) -> Result<T, ContainerError>
    where
        T: Clone + Send + Sync + 'static,
    {
        if chain.contains(&key) {
            let mut names: Vec<String> = chain.iter().map(ToString::to_string).collect();
            names.push(key.to_string());
            return Err(ContainerError::CircularDependency { chain: names });
        }

        // Clone the registration out so no map guard is held across await.
        let registration = self
            .inner
            .registrations
            .get(&key)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| ContainerError::UnregisteredKey(key.to_string()))?;

        let mut child_chain = chain.as_ref().clone();
        child_chain.push(key.clone());
        let child = Resolver {
            container: self.clone(),
            chain: Arc::new(child_chain),
        };

        let instance = match registration.scope {
            Scope::Transient => construct(&key, &registration, child).await?,
            Scope::Singleton => {
                let build = {
                    let mut slot = registration.slot.lock();
                    if let Some(instance) = &slot.instance {
                        return downcast(&key, instance);
                    }
                    slot.pending
                        .get_or_insert_with(|| start_build(key.clone(), Arc::clone(&registration), child))
                        .clone()
                };
                build.await?
            }
        };

        downcast(&key, &instance)
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

fn downcast<T>(key: &Key, instance: &Instance) -> Result<T, ContainerError>
where
    T: Clone + Send + Sync + 'static,
{
    instance
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| ContainerError::TypeMismatch(key.to_string()))
}

/// Spawn one singleton construction and return the future every caller shares.
///
/// The task publishes its outcome into the slot before the shared future
/// resolves: an instance is cached, an error only clears `pending`.
fn start_build(key: Key, registration: Arc<Registration>, resolver: Resolver) -> SharedBuild {
    let failed_key = key.to_string();
    let task = tokio::spawn(async move {
        let result = AssertUnwindSafe(construct(&key, &registration, resolver))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                tracing::error!(key = %key, "Component factory panicked");
                Err(ContainerError::Factory(format!("{key}: factory panicked")))
            });
        let mut slot = registration.slot.lock();
        slot.pending = None;
        if let Ok(instance) = &result {
            slot.instance = Some(Arc::clone(instance));
        }
        result
    });
    async move {
        task.await
            .unwrap_or_else(|e| Err(ContainerError::Factory(format!("{failed_key}: construction task aborted: {e}"))))
    }
    .boxed()
    .shared()
}

async fn construct(
    key: &Key,
    registration: &Registration,
    resolver: Resolver,
) -> Result<Instance, ContainerError> {
    let factory = registration
        .factory
        .as_ref()
        .ok_or_else(|| ContainerError::UnregisteredKey(key.to_string()))?;

    let start = Instant::now();
    match factory(resolver).await {
        Ok(instance) => {
            registration.constructions.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(
                key = %key,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Constructed component"
            );
            Ok(instance)
        }
        Err(e) => {
            tracing::error!(key = %key, error = %e, "Component construction failed");
            Err(e)
        }
    }
}

fn erase<T, F, Fut>(factory: F) -> Factory
where
    T: Clone + Send + Sync + 'static,
    F: Fn(Resolver) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ContainerError>> + Send + 'static,
{
    Arc::new(move |resolver: Resolver| {
        factory(resolver)
            .map(|result| result.map(|value| Arc::new(value) as Instance))
            .boxed()
    })
}

/// Handed to factories for resolving their own dependencies.
#[derive(Clone)]
pub struct Resolver {
    container: Container,
    chain: Arc<Vec<Key>>,
}

impl Resolver {
    pub async fn resolve<T>(&self) -> Result<T, ContainerError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.container.resolve_key(Key::of::<T>(), &self.chain).await
    }

    pub async fn resolve_named<T>(&self, name: &str) -> Result<T, ContainerError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.container.resolve_key(Key::named::<T>(name), &self.chain).await
    }

    /// Keys currently under construction, outermost first.
    pub fn chain(&self) -> Vec<String> {
        self.chain.iter().map(ToString::to_string).collect()
    }
}
