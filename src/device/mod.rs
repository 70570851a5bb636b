//! Local device producers: dummy generators, serial-line peripherals, and the
//! host status device. Each is driven independently by the gateway's main
//! loop, which spawns one task per device.

pub mod dummy;
pub mod serial;
pub mod status;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::config::Config;
use crate::message::Message;

/// Awaits the next inbound command message, if this device subscribed to one.
/// Devices that didn't subscribe pass `None` here, which never resolves, so
/// the `tokio::select!` branch using it is simply never taken.
pub(crate) async fn recv_inbound(inbound: &mut Option<mpsc::Receiver<Message>>) -> Option<Message> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// The closed set of device kinds the gateway knows how to run: a small,
/// fixed set of concrete producers dispatched through one enum rather than a
/// trait object, since no plugin mechanism for third-party device types
/// exists.
pub enum AnyDevice {
    Dummy(dummy::DummyDevice),
    Serial(serial::SerialDevice),
}

impl AnyDevice {
    pub fn name(&self) -> &str {
        match self {
            AnyDevice::Dummy(d) => &d.name,
            AnyDevice::Serial(d) => &d.name,
        }
    }

    /// Whether this device wants its own inbound topic subscribed.
    pub fn wants_subscribe(&self) -> bool {
        match self {
            AnyDevice::Dummy(d) => d.subscribe,
            AnyDevice::Serial(d) => d.subscribe,
        }
    }

    /// The broker this device's traffic (and, if subscribed, its inbound
    /// topic) is bound to.
    pub fn broker_name(&self) -> &str {
        match self {
            AnyDevice::Dummy(d) => &d.broker_name,
            AnyDevice::Serial(d) => &d.broker_name,
        }
    }

    /// QoS to request when declaring this device's subscribed topic.
    pub fn qos(&self) -> u8 {
        match self {
            AnyDevice::Dummy(d) => d.qos,
            AnyDevice::Serial(d) => d.qos,
        }
    }

    /// Runs the device's producer loop until `stop` fires or the channel closes.
    pub async fn run(
        self,
        out: mpsc::Sender<Message>,
        stop: oneshot::Receiver<()>,
        inbound: Option<mpsc::Receiver<Message>>,
    ) {
        match self {
            AnyDevice::Dummy(d) => d.run(out, stop, inbound).await,
            AnyDevice::Serial(d) => d.run(out, stop, inbound).await,
        }
    }
}

/// Builds every `[device "name/kind"]` section into an [`AnyDevice`], warning
/// and skipping sections with an unrecognized `kind` rather than failing the
/// whole load, and likewise skipping (not aborting on) any single device
/// whose fields fail validation.
pub fn build_devices(conf: &Config) -> Vec<AnyDevice> {
    let mut devices = Vec::new();
    for section in conf.sections_of_type("device") {
        match section.arg.as_str() {
            "dummy" => match dummy::DummyDevice::from_section(section) {
                Ok(d) => devices.push(AnyDevice::Dummy(d)),
                Err(e) => warn!(device = %section.name, error = %e, "skipping invalid dummy device"),
            },
            "serial" => match serial::SerialDevice::from_section(section) {
                Ok(d) => devices.push(AnyDevice::Serial(d)),
                Err(e) => warn!(device = %section.name, error = %e, "skipping invalid serial device"),
            },
            other => crate::config::warn_unknown_device_kind(other),
        }
    }
    devices
}

/// Builds the optional status device. Absence of a top-level `[status]`
/// section means "no status device", not an error; an explicit section with
/// `interval == 0` is an error (see [`status::StatusConfigError::ZeroInterval`]).
pub fn build_status_device(
    conf: &Config,
    gateway_name: &str,
) -> Result<Option<status::StatusDevice>, status::StatusConfigError> {
    let has_top_level_section = conf.sections.iter().any(|s| s.r#type == "status" && s.name.is_empty());
    if !has_top_level_section {
        return Ok(None);
    }
    status::StatusDevice::from_config(conf, gateway_name).map(Some)
}
