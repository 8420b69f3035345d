//! Device model and registry.
//!
//! A [`Device`] is any probed peripheral the kernel can name; some carry a
//! userspace protocol and can be opened and messaged through the
//! `OpenDevice` / `CommandDevice` syscalls. The registry names devices by
//! their preferred prefix plus a per-prefix monotonically increasing
//! suffix (`virtio.fb0`, `virtio.fb1`, ...).

pub mod clock;
pub mod gentimer;
pub mod gic;
pub mod pl011;
pub mod virtio;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;

use spin::Mutex;

use crate::buffer::TransactionalBuffer;
use crate::error::{SysError, SysResult};

/// Broad classification of a probed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Clock,
    Uart,
    InterruptController,
    Framebuffer,
    Timer,
    BlockTransport,
    Keyboard,
    Mouse,
}

/// Protocol identifier surfaced to userspace via `ListDevices`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum DeviceProtocol {
    NoProtocol = 0,
    // Basic HID.
    Mouse = 0x100,
    Keyboard = 0x101,
    // Generic IO.
    CharStream = 0x200,
    // Audiovisual.
    FramebufferProvider = 0x300,
}

/// A probed peripheral.
pub trait Device: Send + Sync {
    fn kind(&self) -> DeviceKind;

    /// Protocol spoken over `CommandDevice`, if the device is
    /// user-visible.
    fn userspace_protocol(&self) -> Option<DeviceProtocol> {
        None
    }

    fn preferred_name_prefix(&self) -> &'static str;

    /// Handle a `CommandDevice` message.
    fn on_userspace_message(
        &self,
        id: u64,
        buffer: &mut dyn TransactionalBuffer,
    ) -> SysResult<i64> {
        let _ = (id, buffer);
        Err(SysError::NotSupported)
    }
}

/// Process-wide name → device map.
pub struct DeviceRegistry {
    devices: BTreeMap<String, Arc<dyn Device>>,
    prefix_counters: BTreeMap<String, u32>,
}

static DEVICE_REGISTRY: Mutex<DeviceRegistry> = Mutex::new(DeviceRegistry::new());

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            prefix_counters: BTreeMap::new(),
        }
    }

    /// Register `device`, returning the allocated name.
    pub fn register_device(&mut self, device: Arc<dyn Device>) -> String {
        let prefix = device.preferred_name_prefix();
        let counter = self
            .prefix_counters
            .entry(String::from(prefix))
            .or_insert(0);
        let name = format!("{}{}", prefix, *counter);
        *counter += 1;
        log::info!("device: registered {}", name);
        self.devices.insert(name.clone(), device);
        name
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.devices.get(name).cloned()
    }

    pub fn for_each_device(&self, mut f: impl FnMut(&str, &Arc<dyn Device>)) {
        for (name, device) in &self.devices {
            f(name, device);
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `f` with the global registry locked.
pub fn with_registry<R>(f: impl FnOnce(&mut DeviceRegistry) -> R) -> R {
    f(&mut DEVICE_REGISTRY.lock())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDevice;

    impl Device for FakeDevice {
        fn kind(&self) -> DeviceKind {
            DeviceKind::Framebuffer
        }

        fn userspace_protocol(&self) -> Option<DeviceProtocol> {
            Some(DeviceProtocol::FramebufferProvider)
        }

        fn preferred_name_prefix(&self) -> &'static str {
            "test.fb"
        }
    }

    #[test]
    fn names_count_up_per_prefix() {
        let mut registry = DeviceRegistry::new();
        assert_eq!(registry.register_device(Arc::new(FakeDevice)), "test.fb0");
        assert_eq!(registry.register_device(Arc::new(FakeDevice)), "test.fb1");
        assert!(registry.get("test.fb0").is_some());
        assert!(registry.get("test.fb2").is_none());

        let mut seen = alloc::vec::Vec::new();
        registry.for_each_device(|name, _| seen.push(String::from(name)));
        assert_eq!(seen, ["test.fb0", "test.fb1"]);
    }
}
