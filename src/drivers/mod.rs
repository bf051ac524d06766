//! Driver Factory
//!
//! Maps a `(kind, vendor, model)` [`DriverKey`] to the constructor of the
//! driver implementation for it. Built-in drivers are registered by
//! [`DriverRegistry::with_builtin`]; vendor drivers are added at start-up
//! with [`DriverRegistry::register`].

pub mod sim;

pub use sim::{SimArray, SimPatchSwitch, SimSwitch};

use crate::domain::capability::DeviceCapabilities;
use crate::domain::ports::{
    ArrayDriverRef, DriverParams, PhySwitchDriverRef, SwitchDriverRef,
};
use crate::error::{Error, Result};
use crate::topology::device::{DeviceKind, DriverKey};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Driver Handle
// =============================================================================

/// A constructed driver of any kind
#[derive(Clone)]
pub enum DriverHandle {
    Switch(SwitchDriverRef),
    PhySwitch(PhySwitchDriverRef),
    Array(ArrayDriverRef),
}

impl DriverHandle {
    pub fn kind(&self) -> DeviceKind {
        match self {
            DriverHandle::Switch(_) => DeviceKind::Switch,
            DriverHandle::PhySwitch(_) => DeviceKind::PhySwitch,
            DriverHandle::Array(_) => DeviceKind::Array,
        }
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        match self {
            DriverHandle::Switch(d) => d.capabilities(),
            DriverHandle::PhySwitch(d) => d.capabilities(),
            DriverHandle::Array(d) => d.capabilities(),
        }
    }
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DriverHandle::{:?}", self.kind())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Async constructor of a driver
pub type DriverConstructor =
    Arc<dyn Fn(DriverParams) -> BoxFuture<'static, Result<DriverHandle>> + Send + Sync>;

/// What the registry knows about one driver
#[derive(Clone)]
pub struct DriverDescriptor {
    /// The array family creates one iSCSI target per LUN
    pub target_per_lun: bool,
    pub constructor: DriverConstructor,
}

/// Registry of driver implementations
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<DriverKey, DriverDescriptor>,
}

impl DriverRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in driver
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        sim::register(&mut registry);
        registry
    }

    /// Register a driver constructor, replacing any previous one for `key`
    pub fn register<F, Fut>(&mut self, key: DriverKey, target_per_lun: bool, constructor: F)
    where
        F: Fn(DriverParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DriverHandle>> + Send + 'static,
    {
        debug!("Registering driver {}", key);
        let constructor: DriverConstructor = Arc::new(move |params| Box::pin(constructor(params)));
        self.drivers.insert(
            key,
            DriverDescriptor {
                target_per_lun,
                constructor,
            },
        );
    }

    pub fn descriptor(&self, key: &DriverKey) -> Result<&DriverDescriptor> {
        self.drivers.get(key).ok_or_else(|| Error::UnsupportedDevice {
            key: key.module_name(),
        })
    }

    pub fn is_target_per_lun(&self, key: &DriverKey) -> bool {
        self.drivers
            .get(key)
            .map(|d| d.target_per_lun)
            .unwrap_or(false)
    }

    /// Construct the driver for `key`
    pub async fn create(&self, key: &DriverKey, params: DriverParams) -> Result<DriverHandle> {
        let descriptor = self.descriptor(key)?;
        let device = params.device.clone();
        let handle = (descriptor.constructor)(params).await?;
        if handle.kind() != key.kind {
            return Err(Error::DriverUnavailable {
                device,
                reason: format!("driver {} built a {} driver", key, handle.kind()),
            });
        }
        Ok(handle)
    }

    pub fn keys(&self) -> impl Iterator<Item = &DriverKey> {
        self.drivers.keys()
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.drivers.keys().map(DriverKey::module_name).collect();
        keys.sort();
        f.debug_struct("DriverRegistry").field("drivers", &keys).finish()
    }
}
