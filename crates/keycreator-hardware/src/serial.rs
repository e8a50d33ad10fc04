//! Serial port link.
//!
//! `serialport` is blocking, so every read and write runs on the blocking
//! thread pool. Only one command is ever in flight, so contention on the
//! port mutex does not occur in practice.

use crate::link::{Line, Link};
use keycreator_core::{LinkError, ReaderConfig};
use serialport::{ClearBuffer, SerialPort};
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Poll granularity of a blocking read.
const READ_SLICE: Duration = Duration::from_millis(20);

/// Link to the reader's virtual COM port.
pub struct SerialLink {
    name: String,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink").field("name", &self.name).finish()
    }
}

impl SerialLink {
    /// Open the configured port and discard any stale input.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Io` if the port cannot be opened.
    pub fn open(config: &ReaderConfig) -> Result<Self, LinkError> {
        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(READ_SLICE)
            .open()
            .map_err(|e| LinkError::Io(e.into()))?;
        port.clear(ClearBuffer::Input)
            .map_err(|e| LinkError::Io(e.into()))?;

        info!(port = %config.port, baud = config.baud_rate, "Serial link opened");

        Ok(Self {
            name: config.port.clone(),
            port: Arc::new(Mutex::new(port)),
        })
    }

    /// Names of the serial ports present on this machine.
    pub fn available_ports() -> Vec<String> {
        match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                debug!(error = %e, "Could not enumerate serial ports");
                Vec::new()
            }
        }
    }

    fn poisoned(&self) -> LinkError {
        LinkError::closed(self.name.clone())
    }
}

impl Link for SerialLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, data: &str) -> Result<(), LinkError> {
        trace!(port = %self.name, data = data.trim_end(), "serial write");
        let port = Arc::clone(&self.port);
        let bytes = data.as_bytes().to_vec();
        let closed = self.poisoned();

        tokio::task::spawn_blocking(move || -> Result<(), LinkError> {
            let mut port = port.lock().map_err(|_| closed)?;
            port.clear(ClearBuffer::Input)
                .map_err(|e| LinkError::Io(e.into()))?;
            port.write_all(&bytes)?;
            port.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| LinkError::Io(std::io::Error::other(e)))?
    }

    async fn read(
        &mut self,
        timeout: Duration,
        delimiter: u8,
        max_len: usize,
    ) -> Result<Line, LinkError> {
        let port = Arc::clone(&self.port);
        let closed = self.poisoned();

        let line = tokio::task::spawn_blocking(move || -> Result<Line, LinkError> {
            let mut port = port.lock().map_err(|_| closed)?;
            let deadline = Instant::now() + timeout;
            let mut line = Vec::with_capacity(64);
            let mut byte = [0u8; 1];

            while Instant::now() < deadline {
                match port.read(&mut byte) {
                    Ok(0) => continue,
                    Ok(_) if byte[0] == delimiter => {
                        return Ok(Line::Complete(String::from_utf8_lossy(&line).into_owned()));
                    }
                    Ok(_) if byte[0] == b'\n' && line.is_empty() => continue,
                    Ok(_) => {
                        line.push(byte[0]);
                        if line.len() > max_len {
                            return Err(LinkError::FrameTooLong { max_len });
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                    Err(e) => return Err(LinkError::Io(e)),
                }
            }

            Ok(Line::Partial(String::from_utf8_lossy(&line).into_owned()))
        })
        .await
        .map_err(|e| LinkError::Io(std::io::Error::other(e)))??;

        trace!(port = %self.name, line = ?line, "serial read");
        Ok(line)
    }
}
