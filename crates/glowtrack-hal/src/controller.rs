//! Generic `ControllerDevice` trait for handheld motion controllers.

use glowtrack_types::{ControllerKind, Rgb, RumbleChannel, TrackingError, TrackingShape};
use nalgebra::Vector3;

/// One raw IMU reading, sensor frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ImuSample {
    /// g
    pub accelerometer: Vector3<f32>,
    /// Arbitrary units; only the direction is used.  Zero on 6-axis devices.
    pub magnetometer: Vector3<f32>,
    /// rad/s
    pub gyroscope: Vector3<f32>,
}

/// A connected controller as seen by the service.
///
/// Implementations wrap the device transport.  The service owns the handle
/// exclusively while the controller is open.
pub trait ControllerDevice: Send {
    /// Stable identifier, e.g. the Bluetooth address.
    fn serial(&self) -> &str;

    fn kind(&self) -> ControllerKind;

    /// Incremented by the transport every time a new input report arrives.
    fn poll_sequence_number(&self) -> u32;

    /// Most recent IMU reading, `None` for devices without an IMU or before
    /// the first report.
    fn latest_sample(&self) -> Option<ImuSample>;

    /// Light source the optical detector should look for, `None` when the
    /// device has nothing trackable.
    fn tracking_shape(&self) -> Option<TrackingShape>;

    /// Drive the bulb / light bar.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::HardwareFault`] when the transport rejects
    /// the write.
    fn set_led(&mut self, color: Rgb) -> Result<(), TrackingError>;

    /// Drive a rumble motor.  `amount` is already clamped to `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::HardwareFault`] when the transport rejects
    /// the write.
    fn set_rumble(&mut self, amount: f32, channel: RumbleChannel) -> Result<(), TrackingError>;
}
