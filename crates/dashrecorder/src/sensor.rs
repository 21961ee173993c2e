//! Inertial sensor collaborator.
//!
//! The crash detector polls an [`AccelerationSensor`] for three-axis
//! readings in g. [`IioAccelerometer`] reads a Linux Industrial I/O device
//! through sysfs, which covers the MPU-6050 class of boards via the
//! in-kernel driver.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Standard gravity in m/s².
pub const STANDARD_GRAVITY: f64 = 9.806_65;

/// Errors reported by a sensor collaborator.
#[derive(Debug, Error)]
pub enum SensorError {
    /// A sensor attribute could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Attribute path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A sensor attribute did not hold a number.
    #[error("unexpected value in {path}: {value:?}")]
    Parse {
        /// Attribute path.
        path: PathBuf,
        /// Raw contents.
        value: String,
    },

    /// The sensor is not available.
    #[error("sensor unavailable: {0}")]
    Unavailable(String),
}

/// One three-axis acceleration reading, in g.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Acceleration {
    /// X axis.
    pub x: f64,
    /// Y axis.
    pub y: f64,
    /// Z axis.
    pub z: f64,
}

impl Acceleration {
    /// Create a reading.
    #[must_use]
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean norm of the reading.
    #[must_use]
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Source of acceleration readings. Reads are synchronous and short.
pub trait AccelerationSensor: Send + Sync {
    /// Read the current acceleration.
    ///
    /// # Errors
    ///
    /// Returns a [`SensorError`] if the sensor cannot be read.
    fn read_acceleration(&self) -> Result<Acceleration, SensorError>;
}

/// Accelerometer exposed by the Linux IIO subsystem.
///
/// Reads `in_accel_{x,y,z}_raw` and multiplies by `in_accel_scale`
/// (m/s² per unit), then converts to g.
#[derive(Debug, Clone)]
pub struct IioAccelerometer {
    device_dir: PathBuf,
}

impl IioAccelerometer {
    /// Use the IIO device at `device_dir`
    /// (e.g. `/sys/bus/iio/devices/iio:device0`).
    #[must_use]
    pub fn new(device_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_dir: device_dir.into(),
        }
    }

    /// The device directory.
    #[must_use]
    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    fn read_attr(&self, attr: &str) -> Result<f64, SensorError> {
        let path = self.device_dir.join(attr);
        let raw = fs::read_to_string(&path).map_err(|source| SensorError::Read {
            path: path.clone(),
            source,
        })?;
        raw.trim().parse().map_err(|_| SensorError::Parse {
            path,
            value: raw.trim().to_string(),
        })
    }
}

impl AccelerationSensor for IioAccelerometer {
    fn read_acceleration(&self) -> Result<Acceleration, SensorError> {
        let scale = self.read_attr("in_accel_scale")? / STANDARD_GRAVITY;
        Ok(Acceleration {
            x: self.read_attr("in_accel_x_raw")? * scale,
            y: self.read_attr("in_accel_y_raw")? * scale,
            z: self.read_attr("in_accel_z_raw")? * scale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_device(x: &str, y: &str, z: &str, scale: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("in_accel_x_raw"), x).unwrap();
        fs::write(dir.path().join("in_accel_y_raw"), y).unwrap();
        fs::write(dir.path().join("in_accel_z_raw"), z).unwrap();
        fs::write(dir.path().join("in_accel_scale"), scale).unwrap();
        dir
    }

    #[test]
    fn test_magnitude_is_euclidean_norm() {
        assert!((Acceleration::new(3.0, 4.0, 0.0).magnitude() - 5.0).abs() < 1e-12);
        assert!((Acceleration::new(0.0, 0.0, 1.0).magnitude() - 1.0).abs() < 1e-12);
        assert!((Acceleration::new(-1.0, -2.0, 2.0).magnitude() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_iio_reading_converted_to_g() {
        // MPU-6050 at +-2g: 16384 LSB/g
        let scale = format!("{}\n", STANDARD_GRAVITY / 16384.0);
        let dir = fake_device("0\n", "-16384\n", "32768\n", &scale);

        let reading = IioAccelerometer::new(dir.path()).read_acceleration().unwrap();
        assert!(reading.x.abs() < 1e-9);
        assert!((reading.y + 1.0).abs() < 1e-9);
        assert!((reading.z - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_attribute_is_read_error() {
        let dir = TempDir::new().unwrap();
        let err = IioAccelerometer::new(dir.path())
            .read_acceleration()
            .unwrap_err();
        assert!(matches!(err, SensorError::Read { .. }));
    }

    #[test]
    fn test_garbage_attribute_is_parse_error() {
        let dir = fake_device("12", "oops", "0", "0.001");
        let err = IioAccelerometer::new(dir.path())
            .read_acceleration()
            .unwrap_err();
        match err {
            SensorError::Parse { value, .. } => assert_eq!(value, "oops"),
            other => panic!("expected parse error, got {other}"),
        }
    }
}
