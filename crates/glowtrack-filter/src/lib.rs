//! `glowtrack-filter` – sensor fusion for handheld motion controllers.
//!
//! Turns raw IMU readings and optical orientation hints into a smooth,
//! predictable controller pose.
//!
//! # Modules
//!
//! - [`filter_space`] – [`FilterSpace`][filter_space::FilterSpace]: reference
//!   vectors plus the sensor-axis and calibration transforms that map raw
//!   readings into the frame the filters work in.
//! - [`orientation`] – [`OrientationFilter`][orientation::OrientationFilter]:
//!   AHRS with selectable Madgwick and complementary strategies, gyro bias
//!   estimation and forward extrapolation.
//! - [`position`] – [`PositionFilter`][position::PositionFilter] contract and
//!   the default [`LowPassPositionFilter`][position::LowPassPositionFilter].

pub mod filter_space;
pub mod orientation;
pub mod position;
