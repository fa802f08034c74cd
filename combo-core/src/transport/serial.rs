//! Serial transport using the `serialport` crate.
//!
//! A reader thread polls the port, reassembles frames with a
//! [`StreamDeframer`] and hands each complete frame to the receive handler.
//! Writes go straight to the port from the calling thread.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, trace, warn};
use serialport::SerialPort;

use crate::error::{Error, Result};
use crate::protocol::frame::StreamDeframer;
use crate::transport::{PowerLine, ReceiveHandler, SerialConfig, Transport};

struct Link {
    port: Box<dyn SerialPort>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

/// Framed serial link to the chip.
pub struct SerialTransport {
    config: SerialConfig,
    link: Mutex<Option<Link>>,
}

impl SerialTransport {
    /// Create a transport; the port is opened by [`Transport::open`].
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            link: Mutex::new(None),
        }
    }

    /// Port configuration.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Link>>> {
        self.link
            .lock()
            .map_err(|_| Error::Io(std::io::Error::other("serial link lock poisoned")))
    }

    fn not_open() -> Error {
        Error::Io(std::io::Error::new(ErrorKind::NotConnected, "port closed"))
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.config.port_name)
            .field("baud_rate", &self.config.baud_rate)
            .finish_non_exhaustive()
    }
}

impl Transport for SerialTransport {
    fn open(&self, on_receive: ReceiveHandler) -> Result<()> {
        let mut link = self.lock()?;
        if link.is_some() {
            return Ok(());
        }

        let flow_control = if self.config.hardware_flow_control {
            serialport::FlowControl::Hardware
        } else {
            serialport::FlowControl::None
        };
        let port = serialport::new(&self.config.port_name, self.config.baud_rate)
            .timeout(self.config.read_timeout)
            .flow_control(flow_control)
            .open()?;
        let reader_port = port.try_clone()?;
        debug!(
            "Opened {} at {} baud",
            self.config.port_name, self.config.baud_rate
        );

        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let stop = Arc::clone(&stop);
            let name = self.config.port_name.clone();
            thread::Builder::new()
                .name("combo-serial-rx".into())
                .spawn(move || read_loop(reader_port, &name, &stop, &on_receive))?
        };

        *link = Some(Link {
            port,
            stop,
            reader: Some(reader),
        });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let Some(mut link) = self.lock()?.take() else {
            return Ok(());
        };
        link.stop.store(true, Ordering::Release);
        if let Some(reader) = link.reader.take() {
            // The receive handler may itself end up closing the link
            if reader.thread().id() != thread::current().id() && reader.join().is_err() {
                warn!("Serial reader thread panicked");
            }
        }
        debug!("Closed {}", self.config.port_name);
        Ok(())
    }

    fn send(&self, frame: &[u8]) -> Result<()> {
        let mut link = self.lock()?;
        let link = link.as_mut().ok_or_else(Self::not_open)?;
        trace!("TX {} bytes: {:02X?}", frame.len(), frame);
        link.port.write_all(frame)?;
        link.port.flush()?;
        Ok(())
    }

    fn set_power(&self, on: bool) -> Result<()> {
        let mut link = self.lock()?;
        let link = link.as_mut().ok_or_else(Self::not_open)?;
        let level = on == self.config.power_active_high;
        match self.config.power_line {
            PowerLine::Dtr => {
                trace!("Setting DTR to {level}");
                link.port.write_data_terminal_ready(level)?;
            },
            PowerLine::Rts => {
                trace!("Setting RTS to {level}");
                link.port.write_request_to_send(level)?;
            },
            PowerLine::None => {},
        }
        debug!("Chip power {}", if on { "on" } else { "off" });
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close {}: {e}", self.config.port_name);
        }
    }
}

fn read_loop(
    mut port: Box<dyn SerialPort>,
    name: &str,
    stop: &AtomicBool,
    on_receive: &ReceiveHandler,
) {
    let mut deframer = StreamDeframer::new();
    let mut buf = [0u8; 1024];

    while !stop.load(Ordering::Acquire) {
        match port.read(&mut buf) {
            Ok(0) => {},
            Ok(n) => {
                trace!("RX {n} bytes: {:02X?}", &buf[..n]);
                for frame in deframer.push(&buf[..n]) {
                    on_receive(&frame);
                }
            },
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {},
            Err(e) => {
                warn!("{name}: read failed, stopping reader: {e}");
                break;
            },
        }
    }
    if deframer.pending() > 0 {
        debug!("{name}: dropping {} bytes of a partial frame", deframer.pending());
    }
}
