//! Devices
//!
//! A device is host code a vat can call synchronously with `callNow`.
//! Devices are registered by name before the kernel is initialized; the
//! kernel gives each name a `kd` ref and vats reach it through a `d-N`
//! import granted in their parameters.

use std::collections::BTreeMap;

use swing_kernel_core::KernelCapData;

/// Host code reachable through `callNow`.
pub trait Device {
    /// Handle one call. An `Err` is handed back to the vat as a failed
    /// syscall, which fails its crank.
    fn invoke(&mut self, method: &str, args: &KernelCapData) -> Result<KernelCapData, String>;

    /// Whether objects passed to a successful call stay pinned for the
    /// device. The host releases them with
    /// [`Kernel::unpin`](crate::Kernel::unpin).
    fn retains_arguments(&self) -> bool {
        false
    }
}

/// A device whose behavior is a closure.
pub struct FnDevice<F> {
    behavior: F,
}

impl<F> FnDevice<F>
where
    F: FnMut(&str, &KernelCapData) -> Result<KernelCapData, String>,
{
    /// Wrap a closure.
    pub fn new(behavior: F) -> Self {
        Self { behavior }
    }
}

impl<F> Device for FnDevice<F>
where
    F: FnMut(&str, &KernelCapData) -> Result<KernelCapData, String>,
{
    fn invoke(&mut self, method: &str, args: &KernelCapData) -> Result<KernelCapData, String> {
        (self.behavior)(method, args)
    }
}

/// Registered devices by name.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, Box<dyn Device>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a device.
    pub fn register(&mut self, name: impl Into<String>, device: Box<dyn Device>) {
        self.devices.insert(name.into(), device);
    }

    /// Check whether a device is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// Look up a device.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn Device + 'static)> {
        self.devices.get_mut(name).map(|d| d.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swing_vat::CapData;

    #[test]
    fn test_registry_dispatches_by_name() {
        let mut registry = DeviceRegistry::new();
        registry.register(
            "echo",
            Box::new(FnDevice::new(|method: &str, args: &KernelCapData| {
                if method == "echo" {
                    Ok(args.clone())
                } else {
                    Err(format!("no method {method}"))
                }
            })),
        );
        assert!(registry.contains("echo"));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["echo"]);
        let args = CapData::plain(&json!([1, 2]));
        let device = registry.get_mut("echo").unwrap();
        assert_eq!(device.invoke("echo", &args).unwrap(), args);
        assert!(device.invoke("other", &args).is_err());
        assert!(registry.get_mut("missing").is_none());
    }
}
