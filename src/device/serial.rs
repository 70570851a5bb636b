//! A device that reads framed messages off a serial line and publishes each
//! frame as it completes.
//!
//! Framing has two modes: fixed-size (`size > 0`, slice off `size` bytes at a
//! time) and idle-delimited (`size` unset, flush whatever has accumulated once
//! a read times out with nothing new). [`FrameAccumulator`] implements both
//! modes as pure, synchronous logic so they're testable without real I/O.

use std::io::Write;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use super::recv_inbound;
use crate::config::{validate_gateway_name, ConfigSection, ValidationError};
use crate::message::Message;

#[derive(Debug, Error)]
pub enum SerialConfigError {
    #[error("device name invalid: {0}")]
    Name(#[source] ValidationError),

    #[error("port path must be set")]
    MissingPort,

    #[error("baud rate must be a non-negative integer, got {0:?}")]
    InvalidBaud(String),

    #[error("size must be an integer between 0 and 256, got {0:?}")]
    InvalidFrameSize(String),

    #[error("qos must be 0, 1, or 2, got {0:?}")]
    InvalidQos(String),

    #[error("broker name must be set")]
    MissingBroker,

    #[error("type exceeds 256 bytes")]
    TypeTooLong,
}

/// Read timeout used on the underlying serial port; idle framing relies on
/// this timeout firing with no bytes read to know a frame is complete.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

pub struct SerialDevice {
    pub name: String,
    pub device_type: String,
    pub broker_name: String,
    pub port_path: String,
    pub baud_rate: u32,
    pub frame_size: Option<usize>,
    pub qos: u8,
    pub retained: bool,
    pub subscribe: bool,
}

impl SerialDevice {
    pub fn from_section(section: &ConfigSection) -> Result<Self, SerialConfigError> {
        validate_gateway_name(&section.name).map_err(SerialConfigError::Name)?;

        let port_path = section.get("serial").unwrap_or_default().to_string();
        if port_path.is_empty() {
            return Err(SerialConfigError::MissingPort);
        }

        let baud_rate: u32 = section
            .get("baud")
            .unwrap_or("9600")
            .parse()
            .map_err(|_| SerialConfigError::InvalidBaud(section.get("baud").unwrap_or("").to_string()))?;

        // absent or zero "size" means idle-delimited framing, not an error.
        let frame_size = match section.get("size") {
            None => None,
            Some(raw) => {
                let size: usize = raw
                    .parse()
                    .ok()
                    .filter(|s| *s <= 256)
                    .ok_or_else(|| SerialConfigError::InvalidFrameSize(raw.to_string()))?;
                if size == 0 {
                    None
                } else {
                    Some(size)
                }
            }
        };

        let qos: u8 = section
            .get("qos")
            .unwrap_or("0")
            .parse()
            .ok()
            .filter(|q| *q <= 2)
            .ok_or_else(|| SerialConfigError::InvalidQos(section.get("qos").unwrap_or("").to_string()))?;

        let broker_name = section.get("broker").unwrap_or_default().to_string();
        if broker_name.is_empty() {
            return Err(SerialConfigError::MissingBroker);
        }

        let retained = section.get("retain").map(|v| v == "true" || v == "1").unwrap_or(false);
        let subscribe = section.get("subscribe").map(|v| v == "true" || v == "1").unwrap_or(false);

        let device_type = section.get("type").unwrap_or_default().to_string();
        if device_type.len() > 256 {
            return Err(SerialConfigError::TypeTooLong);
        }

        Ok(Self {
            name: section.name.clone(),
            device_type,
            broker_name,
            port_path,
            baud_rate,
            frame_size,
            qos,
            retained,
            subscribe,
        })
    }

    /// Opens the configured port and runs the read/publish loop until `stop`
    /// fires. Port-open failure is fatal to this device only: it logs and
    /// returns rather than taking down the gateway.
    pub async fn run(
        self,
        out: mpsc::Sender<Message>,
        mut stop: oneshot::Receiver<()>,
        mut inbound: Option<mpsc::Receiver<Message>>,
    ) {
        let port = match serialport::new(&self.port_path, self.baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
        {
            Ok(p) => p,
            Err(e) => {
                warn!(device = %self.name, port = %self.port_path, error = %e, "could not open serial port");
                return;
            }
        };

        let name = self.name.clone();
        let device_type = self.device_type.clone();
        let broker_name = self.broker_name.clone();
        let qos = self.qos;
        let retained = self.retained;
        let frame_size = self.frame_size;

        // A second handle onto the same port, used to write subscribed
        // commands back out while the first handle is owned by the blocking
        // reader thread.
        let write_port = if inbound.is_some() {
            match port.try_clone() {
                Ok(p) => Some(std::sync::Arc::new(StdMutex::new(p))),
                Err(e) => {
                    warn!(device = %name, error = %e, "could not clone port for writeback, inbound commands will only be logged");
                    None
                }
            }
        } else {
            None
        };

        // serialport's blocking API runs on a dedicated thread, forwarding
        // completed frames back over a channel for the async side to publish.
        let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(20);
        let reader = std::thread::spawn(move || read_loop(port, frame_size, frame_tx));

        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    match frame {
                        Some(body) => {
                            let msg = Message::to_publish(
                                name.clone(), device_type.clone(), body, qos, retained, broker_name.clone(),
                            );
                            if out.send(msg).await.is_err() {
                                warn!(device = %name, "gateway channel closed, stopping");
                                break;
                            }
                        }
                        None => break,
                    }
                }
                Some(cmd) = recv_inbound(&mut inbound) => {
                    write_back(&name, write_port.clone(), cmd.body).await;
                }
                _ = &mut stop => {
                    info!(device = %self.name, "stop requested");
                    break;
                }
            }
        }
        let _ = reader.join();
    }
}

type SharedWritePort = std::sync::Arc<StdMutex<Box<dyn serialport::SerialPort>>>;

/// Writes a subscribed command's body back out to the serial port in full.
/// Best-effort: a missing write handle or a write error is logged, never
/// propagated, so one bad write doesn't tear down the reader.
async fn write_back(device_name: &str, port: Option<SharedWritePort>, body: Vec<u8>) {
    let Some(port) = port else {
        info!(device = device_name, bytes = body.len(), "received subscribed command but writeback is unavailable");
        return;
    };
    let device_name = device_name.to_string();
    let result = tokio::task::spawn_blocking(move || {
        let mut guard = port.lock().expect("write port mutex poisoned");
        guard.write_all(&body)
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(device = %device_name, error = %e, "failed to write subscribed command back to serial port"),
        Err(e) => warn!(device = %device_name, error = %e, "writeback task panicked"),
    }
}

/// Blocking read loop, run on its own OS thread. Reads into a small buffer,
/// feeds it to a [`FrameAccumulator`], and forwards completed frames.
fn read_loop(mut port: Box<dyn serialport::SerialPort>, frame_size: Option<usize>, tx: mpsc::Sender<Vec<u8>>) {
    let mut acc = FrameAccumulator::new(frame_size);
    let mut buf = [0u8; 256];
    loop {
        match port.read(&mut buf) {
            Ok(0) => {
                if let Some(frame) = acc.on_idle() {
                    if tx.blocking_send(frame).is_err() {
                        return;
                    }
                }
            }
            Ok(n) => {
                for frame in acc.push(&buf[..n]) {
                    if tx.blocking_send(frame).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                if let Some(frame) = acc.on_idle() {
                    if tx.blocking_send(frame).is_err() {
                        return;
                    }
                }
            }
            Err(_) => return,
        }
    }
}

/// Pure framing logic, independent of any real I/O so it can be unit tested.
pub struct FrameAccumulator {
    frame_size: Option<usize>,
    buf: Vec<u8>,
}

impl FrameAccumulator {
    pub fn new(frame_size: Option<usize>) -> Self {
        Self { frame_size, buf: Vec::new() }
    }

    /// Feeds newly-read bytes in. Fixed-size mode may complete zero, one, or
    /// several frames in a single call; idle-delimited mode never completes
    /// a frame here (only on [`Self::on_idle`]).
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        if let Some(size) = self.frame_size {
            while self.buf.len() >= size {
                frames.push(self.buf.drain(..size).collect());
            }
        }
        frames
    }

    /// Called when a read times out with no new bytes. In idle-delimited mode,
    /// flushes and returns whatever has accumulated if non-empty. In
    /// fixed-size mode this is a no-op: a short final chunk is discarded, not
    /// flushed as a partial frame.
    pub fn on_idle(&mut self) -> Option<Vec<u8>> {
        if self.frame_size.is_some() {
            return None;
        }
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn section(ini: &[u8]) -> ConfigSection {
        let conf = Config::load_bytes(ini).unwrap();
        conf.sections_of_type("device").next().unwrap().clone()
    }

    #[test]
    fn parses_minimal_serial() {
        let s = section(b"[gateway]\nname=ham\n[device \"d1/serial\"]\nbroker=sango\nserial=/dev/ttyUSB0\n");
        let d = SerialDevice::from_section(&s).unwrap();
        assert_eq!(d.port_path, "/dev/ttyUSB0");
        assert_eq!(d.frame_size, None);
    }

    #[test]
    fn missing_size_is_not_an_error() {
        let s = section(b"[gateway]\nname=ham\n[device \"d1/serial\"]\nbroker=sango\nserial=/dev/ttyUSB0\n");
        assert!(SerialDevice::from_section(&s).is_ok());
    }

    #[test]
    fn rejects_missing_port() {
        let s = section(b"[gateway]\nname=ham\n[device \"d1/serial\"]\nbroker=sango\n");
        assert!(matches!(SerialDevice::from_section(&s), Err(SerialConfigError::MissingPort)));
    }

    #[test]
    fn zero_baud_is_allowed() {
        let s = section(b"[gateway]\nname=ham\n[device \"d1/serial\"]\nbroker=sango\nserial=/dev/x\nbaud=0\n");
        assert_eq!(SerialDevice::from_section(&s).unwrap().baud_rate, 0);
    }

    #[test]
    fn rejects_size_over_256() {
        let s = section(b"[gateway]\nname=ham\n[device \"d1/serial\"]\nbroker=sango\nserial=/dev/x\nsize=300\n");
        assert!(matches!(
            SerialDevice::from_section(&s),
            Err(SerialConfigError::InvalidFrameSize(_))
        ));
    }

    #[test]
    fn reads_type_key_for_topic_leaf() {
        let s = section(
            b"[gateway]\nname=ham\n[device \"d1/serial\"]\nbroker=sango\nserial=/dev/x\ntype=uart\n",
        );
        let d = SerialDevice::from_section(&s).unwrap();
        assert_eq!(d.device_type, "uart");
    }

    #[test]
    fn fixed_size_framing_emits_complete_frames() {
        let mut acc = FrameAccumulator::new(Some(4));
        let frames = acc.push(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(frames, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
        assert_eq!(acc.buf, vec![9]);
        assert_eq!(acc.on_idle(), None);
    }

    #[test]
    fn idle_framing_flushes_on_timeout() {
        let mut acc = FrameAccumulator::new(None);
        assert!(acc.push(&[1, 2, 3]).is_empty());
        assert_eq!(acc.on_idle(), Some(vec![1, 2, 3]));
        assert_eq!(acc.on_idle(), None);
    }
}
