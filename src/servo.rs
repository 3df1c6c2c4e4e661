//! Pulse-width control of two continuous-rotation servos.
//!
//! Commands go to the pigpiod daemon over its TCP socket: 16-byte requests of
//! four little-endian words {cmd, p1, p2, p3}, 16-byte replies whose last word
//! is the signed result. Only the SERVO command (cmd 8, p1 = GPIO, p2 = pulse
//! width in microseconds) is used here.
//!
//! A `stub://` daemon address selects a recording backend so tests and
//! hardware-free runs can assert on the exact (gpio, pulse) sequence.
//!
//! SM-S4303R timing: 1500us = rest, below = clockwise, above =
//! counter-clockwise; 0 cuts the pulse entirely (servo released).

use anyhow::{anyhow, Result};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use crate::HardwareError;

pub const SERVO1_GPIO: u32 = 17;
pub const SERVO2_GPIO: u32 = 27;

pub const MIN_PULSE_US: u32 = 500;
pub const MAX_PULSE_US: u32 = 2500;
pub const REST_PULSE_US: u32 = 1500;

/// pigpiod SERVO command word.
const PI_CMD_SERVO: u32 = 8;
const DAEMON_IO_TIMEOUT: Duration = Duration::from_secs(2);

/// One of the two fixed servos.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServoId {
    Servo1,
    Servo2,
}

impl ServoId {
    /// Parse the wire identifier ("servo1" / "servo2"). Anything else is an
    /// unknown servo and must be rejected by the caller.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "servo1" => Some(ServoId::Servo1),
            "servo2" => Some(ServoId::Servo2),
            _ => None,
        }
    }

    pub fn gpio(self) -> u32 {
        match self {
            ServoId::Servo1 => SERVO1_GPIO,
            ServoId::Servo2 => SERVO2_GPIO,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServoId::Servo1 => "servo1",
            ServoId::Servo2 => "servo2",
        }
    }
}

/// Reject pulse widths outside the servo's mechanical range.
pub fn validate_pulse_width(pulse_us: u32) -> Result<()> {
    if !(MIN_PULSE_US..=MAX_PULSE_US).contains(&pulse_us) {
        return Err(anyhow!(
            "pulse width must be between {} and {} us",
            MIN_PULSE_US,
            MAX_PULSE_US
        ));
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct ServoConfig {
    /// pigpiod socket address, or "stub://" for the recording backend.
    pub daemon_addr: String,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            daemon_addr: "127.0.0.1:8888".to_string(),
        }
    }
}

pub struct ServoController {
    inner: Mutex<ServoBackend>,
}

enum ServoBackend {
    Stub(StubServo),
    Pigpio(PigpioClient),
}

impl ServoController {
    /// Connect to the servo daemon and park both servos with no pulse.
    /// Connection failure is a fatal `HardwareError`: the daemon must not
    /// come up with servo control half-initialized.
    pub fn connect(config: &ServoConfig) -> Result<Self> {
        let backend = if config.daemon_addr.starts_with("stub://") {
            ServoBackend::Stub(StubServo::default())
        } else {
            ServoBackend::Pigpio(PigpioClient::connect(&config.daemon_addr)?)
        };
        let controller = Self {
            inner: Mutex::new(backend),
        };
        controller.write_pulse(SERVO1_GPIO, 0)?;
        controller.write_pulse(SERVO2_GPIO, 0)?;
        log::info!("servo controller connected ({})", config.daemon_addr);
        Ok(controller)
    }

    /// Set a servo's pulse width after validating the range.
    pub fn set_servo(&self, id: ServoId, pulse_us: u32) -> Result<()> {
        validate_pulse_width(pulse_us)?;
        self.write_pulse(id.gpio(), pulse_us)?;
        log::info!("servo {} set to {}us", id.as_str(), pulse_us);
        Ok(())
    }

    /// Park a servo at the rest pulse (continuous-rotation stop).
    pub fn stop_servo(&self, id: ServoId) -> Result<()> {
        self.write_pulse(id.gpio(), REST_PULSE_US)?;
        log::info!("servo {} stopped", id.as_str());
        Ok(())
    }

    /// Cut both pulses and drop the daemon connection. Called once at
    /// process exit; further commands fail.
    pub fn shutdown(&self) -> Result<()> {
        self.write_pulse(SERVO1_GPIO, 0)?;
        self.write_pulse(SERVO2_GPIO, 0)?;
        let mut backend = self.lock();
        if let ServoBackend::Pigpio(client) = &mut *backend {
            client.close();
        }
        log::info!("servo controller shut down");
        Ok(())
    }

    /// Recorded (gpio, pulse) pairs from the stub backend, in issue order.
    /// Empty for the pigpiod backend.
    pub fn commands_for_test_only(&self) -> Vec<(u32, u32)> {
        match &*self.lock() {
            ServoBackend::Stub(stub) => stub.commands.clone(),
            ServoBackend::Pigpio(_) => Vec::new(),
        }
    }

    fn write_pulse(&self, gpio: u32, pulse_us: u32) -> Result<()> {
        match &mut *self.lock() {
            ServoBackend::Stub(stub) => {
                stub.commands.push((gpio, pulse_us));
                Ok(())
            }
            ServoBackend::Pigpio(client) => client.servo_command(gpio, pulse_us),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServoBackend> {
        self.inner.lock().expect("servo lock poisoned")
    }
}

#[derive(Default)]
struct StubServo {
    commands: Vec<(u32, u32)>,
}

struct PigpioClient {
    stream: Option<TcpStream>,
}

impl PigpioClient {
    fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).map_err(|err| {
            HardwareError::new(format!(
                "connect to pigpiod at {}: {} (is pigpiod running?)",
                addr, err
            ))
        })?;
        stream
            .set_read_timeout(Some(DAEMON_IO_TIMEOUT))
            .map_err(|err| HardwareError::new(format!("set pigpiod read timeout: {}", err)))?;
        stream
            .set_write_timeout(Some(DAEMON_IO_TIMEOUT))
            .map_err(|err| HardwareError::new(format!("set pigpiod write timeout: {}", err)))?;
        Ok(Self {
            stream: Some(stream),
        })
    }

    fn servo_command(&mut self, gpio: u32, pulse_us: u32) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("servo daemon connection closed"))?;

        let mut request = [0u8; 16];
        request[0..4].copy_from_slice(&PI_CMD_SERVO.to_le_bytes());
        request[4..8].copy_from_slice(&gpio.to_le_bytes());
        request[8..12].copy_from_slice(&pulse_us.to_le_bytes());
        stream.write_all(&request)?;

        let mut reply = [0u8; 16];
        stream.read_exact(&mut reply)?;
        let res = i32::from_le_bytes([reply[12], reply[13], reply[14], reply[15]]);
        if res < 0 {
            return Err(anyhow!("pigpiod rejected servo command: error {}", res));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
