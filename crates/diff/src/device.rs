//! # Devices
//!
//! Tensors carry a device tag. The host is always present; accelerators are
//! numbered slots whose availability is configured per thread with
//! [`set_visible_accelerators`]. Operations refuse to mix devices, and moving a
//! tensor to a slot that isn't visible fails with `DeviceUnavailable`.

use std::cell::Cell;
use std::fmt;

use crate::error::{DiffError, Result};

/// Where a tensor's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Accelerator(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(i) => write!(f, "accel:{i}"),
        }
    }
}

thread_local! {
    static VISIBLE_ACCELERATORS: Cell<usize> = const { Cell::new(0) };
    static CURRENT_ACCELERATOR: Cell<usize> = const { Cell::new(0) };
}

/// Number of accelerator slots visible on this thread.
pub fn visible_accelerators() -> usize {
    VISIBLE_ACCELERATORS.with(Cell::get)
}

pub fn set_visible_accelerators(count: usize) {
    VISIBLE_ACCELERATORS.with(|c| c.set(count));
}

/// Select which accelerator [`current_accelerator`] reports.
pub fn set_current_accelerator(index: usize) -> Result<()> {
    check_available(Device::Accelerator(index))?;
    CURRENT_ACCELERATOR.with(|c| c.set(index));
    Ok(())
}

/// The active accelerator, if any is visible.
pub fn current_accelerator() -> Result<Device> {
    let device = Device::Accelerator(CURRENT_ACCELERATOR.with(Cell::get));
    check_available(device)?;
    Ok(device)
}

pub fn check_available(device: Device) -> Result<()> {
    match device {
        Device::Cpu => Ok(()),
        Device::Accelerator(i) => {
            let visible = visible_accelerators();
            if i < visible {
                Ok(())
            } else {
                Err(DiffError::DeviceUnavailable { device, visible })
            }
        }
    }
}
