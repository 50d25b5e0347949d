//! Device contexts, run-time contexts, and operation property tags.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── DeviceType ──────────────────────────────────────────────────────

/// Kind of device an operation runs on.
///
/// Discriminants are bit-flag friendly: pinned host memory is `CPU | GPU`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum DeviceType {
    Cpu = 1,
    Gpu = 2,
    CpuPinned = 3,
    CpuShared = 5,
}

impl DeviceType {
    /// Decode a raw device-type discriminant.
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Self::Cpu),
            2 => Some(Self::Gpu),
            3 => Some(Self::CpuPinned),
            5 => Some(Self::CpuShared),
            _ => None,
        }
    }

    /// Host-side kinds share the CPU worker configuration.
    pub const fn is_cpu_kind(self) -> bool {
        !matches!(self, Self::Gpu)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::CpuPinned => "cpu_pinned",
            Self::CpuShared => "cpu_shared",
        };
        f.write_str(label)
    }
}

// ── Context ─────────────────────────────────────────────────────────

/// A device an operation is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Context {
    pub dev_type: DeviceType,
    pub dev_id: i32,
}

impl Context {
    pub const fn new(dev_type: DeviceType, dev_id: i32) -> Self {
        Self { dev_type, dev_id }
    }

    pub const fn cpu(dev_id: i32) -> Self {
        Self::new(DeviceType::Cpu, dev_id)
    }

    pub const fn gpu(dev_id: i32) -> Self {
        Self::new(DeviceType::Gpu, dev_id)
    }

    pub const fn cpu_pinned(dev_id: i32) -> Self {
        Self::new(DeviceType::CpuPinned, dev_id)
    }

    pub const fn cpu_shared(dev_id: i32) -> Self {
        Self::new(DeviceType::CpuShared, dev_id)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::cpu(0)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.dev_type, self.dev_id)
    }
}

// ── Streams ─────────────────────────────────────────────────────────

/// Opaque native stream handle.
///
/// The engine never interprets the value; it is handed to operation bodies
/// and back to the [`StreamProvider`](crate::StreamProvider) unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(u64);

impl StreamHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// Execution-time information passed to every operation body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunContext {
    /// Device the operation was pushed against.
    pub ctx: Context,
    /// Primary stream of the executing worker. `None` on host lanes.
    pub stream: Option<StreamHandle>,
    /// Secondary stream for copy/compute overlap.
    pub aux_stream: Option<StreamHandle>,
    /// Set while the worker is deferring stream synchronisation across a bulk.
    pub is_bulk: bool,
}

// ── FnProperty ──────────────────────────────────────────────────────

/// Scheduling hint attached to a pushed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FnProperty {
    #[default]
    Normal,
    /// Copies data off a device.
    CopyFromDevice,
    /// Copies data onto a device.
    CopyToDevice,
    /// Jumps ahead of normal work on host lanes.
    PriorityCpu,
    /// Informational: the body completes through a [`Completion`](crate::Completion).
    Async,
    /// Destroys every mutable variable after executing.
    DeleteVariable,
    /// Jumps ahead of normal work on GPU lanes.
    PriorityGpu,
    /// Runs even when a dependency failed under a skipping failure policy.
    NoSkip,
}

impl FnProperty {
    pub const fn is_copy(self) -> bool {
        matches!(self, Self::CopyFromDevice | Self::CopyToDevice)
    }

    /// Operations that no failure policy may skip.
    pub const fn never_skipped(self) -> bool {
        matches!(self, Self::NoSkip | Self::DeleteVariable)
    }
}

impl fmt::Display for FnProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Normal => "normal",
            Self::CopyFromDevice => "copy_from_device",
            Self::CopyToDevice => "copy_to_device",
            Self::PriorityCpu => "priority_cpu",
            Self::Async => "async",
            Self::DeleteVariable => "delete_variable",
            Self::PriorityGpu => "priority_gpu",
            Self::NoSkip => "no_skip",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_type_discriminants_match_wire_values() {
        assert_eq!(DeviceType::Cpu as i32, 1);
        assert_eq!(DeviceType::Gpu as i32, 2);
        assert_eq!(DeviceType::CpuPinned as i32, DeviceType::Cpu as i32 | DeviceType::Gpu as i32);
        assert_eq!(DeviceType::CpuShared as i32, 5);
    }

    #[test]
    fn device_type_from_raw() {
        for dt in [DeviceType::Cpu, DeviceType::Gpu, DeviceType::CpuPinned, DeviceType::CpuShared] {
            assert_eq!(DeviceType::from_raw(dt as i32), Some(dt));
        }
        assert_eq!(DeviceType::from_raw(4), None);
        assert_eq!(DeviceType::from_raw(0), None);
    }

    #[test]
    fn only_gpu_is_not_cpu_kind() {
        assert!(DeviceType::Cpu.is_cpu_kind());
        assert!(DeviceType::CpuPinned.is_cpu_kind());
        assert!(DeviceType::CpuShared.is_cpu_kind());
        assert!(!DeviceType::Gpu.is_cpu_kind());
    }

    #[test]
    fn context_display() {
        assert_eq!(Context::gpu(3).to_string(), "gpu(3)");
        assert_eq!(Context::default().to_string(), "cpu(0)");
    }

    #[test]
    fn never_skipped_properties() {
        assert!(FnProperty::NoSkip.never_skipped());
        assert!(FnProperty::DeleteVariable.never_skipped());
        assert!(!FnProperty::Normal.never_skipped());
        assert!(!FnProperty::PriorityGpu.never_skipped());
    }

    #[test]
    fn stream_handle_is_opaque_roundtrip() {
        let h = StreamHandle::from_raw(0xdead_beef);
        assert_eq!(h.as_raw(), 0xdead_beef);
    }
}
