//! nusb-based USB transport implementation.

use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, In, Out};
use nusb::{MaybeFuture, list_devices};
use std::io::{ErrorKind, Read, Write};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, instrument, trace};

use super::traits::{TransportError, UsbTransport};
use crate::model::UsbProfile;

/// Size of each bulk transfer buffered by the endpoint reader/writer.
const TRANSFER_SIZE: usize = 0x2000;

/// Bulk transport over a claimed interface.
///
/// The endpoint reader and writer are kept for the lifetime of the
/// transport so that data already in flight on the IN pipe is not lost
/// between reads.
pub struct NusbTransport {
    reader: Mutex<EndpointRead<Bulk>>,
    writer: Mutex<EndpointWrite<Bulk>>,
    timeout: Duration,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the first device matching `profile`.
    #[instrument(level = "info", skip(profile), fields(vid = format!("{:04X}", profile.vendor_id), pid = format!("{:04X}", profile.product_id)))]
    pub fn open(profile: &UsbProfile, timeout: Duration) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == profile.vendor_id && d.product_id() == profile.product_id)
            .ok_or(TransportError::DeviceNotFound {
                vid: profile.vendor_id,
                pid: profile.product_id,
            })?;

        info!(
            vendor_id = %format!("{:04X}", device_info.vendor_id()),
            product_id = %format!("{:04X}", device_info.product_id()),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface = device
            .claim_interface(profile.interface)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: profile.interface,
                message: e.to_string(),
            })?;

        let reader = interface
            .endpoint::<Bulk, In>(profile.ep_in)
            .map_err(|e| TransportError::EndpointUnavailable {
                address: profile.ep_in,
                message: e.to_string(),
            })?
            .reader(TRANSFER_SIZE)
            .with_read_timeout(timeout);

        let writer = interface
            .endpoint::<Bulk, Out>(profile.ep_out)
            .map_err(|e| TransportError::EndpointUnavailable {
                address: profile.ep_out,
                message: e.to_string(),
            })?
            .writer(TRANSFER_SIZE)
            .with_write_timeout(timeout);

        info!(
            in_ep = %format!("0x{:02X}", profile.ep_in),
            out_ep = %format!("0x{:02X}", profile.ep_out),
            timeout_ms = timeout.as_millis() as u64,
            "Device opened successfully"
        );

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            timeout,
            vid: profile.vendor_id,
            pid: profile.product_id,
        })
    }

    fn map_io(&self, e: std::io::Error, write: bool) -> TransportError {
        match e.kind() {
            ErrorKind::TimedOut => TransportError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            },
            ErrorKind::NotConnected | ErrorKind::BrokenPipe => TransportError::Disconnected,
            _ if write => TransportError::WriteFailed(e.to_string()),
            _ => TransportError::ReadFailed(e.to_string()),
        }
    }
}

impl UsbTransport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| TransportError::WriteFailed("writer lock poisoned".into()))?;
        writer.write_all(data).map_err(|e| self.map_io(e, true))?;
        writer.flush().map_err(|e| self.map_io(e, true))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(max_len))]
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| TransportError::ReadFailed("reader lock poisoned".into()))?;
        let mut buf = vec![0u8; max_len];

        let n = reader.read(&mut buf).map_err(|e| self.map_io(e, false))?;
        if n == 0 {
            return Err(TransportError::Disconnected);
        }

        buf.truncate(n);
        trace!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn is_connected(&self) -> bool {
        // nusb reports disconnection through transfer errors only.
        true
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
