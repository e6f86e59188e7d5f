//! Built-in tests.
//!
//! `kola` and `kolet` both build their registry from here, so a native
//! function the runner deploys for is always known to the helper.

pub mod etcd;
pub mod native;

use crate::error::RegistryError;
use crate::registry::Registry;

/// Register every built-in test.
pub fn register_all(registry: &mut Registry) -> Result<(), RegistryError> {
    etcd::register(registry)?;
    native::register(registry)?;
    Ok(())
}

/// A registry holding the built-in tests.
pub fn registry() -> Result<Registry, RegistryError> {
    let mut registry = Registry::new();
    register_all(&mut registry)?;
    Ok(registry)
}
