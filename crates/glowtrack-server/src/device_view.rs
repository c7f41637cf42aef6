//! [`DeviceView`] – lifecycle shared by every per-device view the service
//! keeps.

use glowtrack_hal::controller::ControllerDevice;
use glowtrack_types::TrackingError;

use crate::publisher::FramePublisher;

/// A service-side view of one connected device.
pub trait DeviceView: Send {
    /// Take ownership of `device` and allocate per-device state.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::AlreadyOpen`] if a device is already attached.
    fn open(&mut self, device: Box<dyn ControllerDevice>) -> Result<(), TrackingError>;

    /// Release the device and everything allocated for it.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::DeviceNotOpen`] if nothing is attached.
    fn close(&mut self) -> Result<(), TrackingError>;

    fn is_open(&self) -> bool;

    /// Hand the current state to `publisher`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::DeviceNotOpen`] when closed, or whatever the
    /// publisher reports.
    fn publish_frame(&self, publisher: &dyn FramePublisher) -> Result<(), TrackingError>;
}
