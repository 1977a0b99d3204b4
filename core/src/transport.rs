// SPDX-License-Identifier: MIT

//! The pluggable submission boundary between [`crate::executor::Executor`]
//! and whatever actually carries a command to a TPM: a kernel resource
//! manager device node, an in-process simulator, or the Windows TBS
//! service.

use std::fmt;

/// Submits a fully-assembled command buffer and receives a response.
///
/// Implementations own whatever I/O is required to reach the TPM; the
/// executor never inspects the bytes beyond what [`crate::wire`] parses.
pub trait Transport: Send {
    /// Writes `request` to the TPM and reads its response into `response`.
    ///
    /// Returns the number of bytes written into `response` and a
    /// platform-level status code (0 for success; anything else is a
    /// transport-layer failure distinct from a `TPM_RC_*` response code,
    /// which travels inside the response bytes instead).
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying channel could not be written to
    /// or read from at all.
    fn submit(&mut self, request: &[u8], response: &mut [u8]) -> Result<(usize, u32), TransportError>;
}

/// A transport-level failure: the channel itself misbehaved, as opposed to
/// the TPM returning a non-zero response code.
#[derive(Debug)]
pub struct TransportError(String);

impl TransportError {
    #[must_use]
    pub fn new(context: impl Into<String>) -> Self {
        TransportError(context.into())
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError(err.to_string())
    }
}

/// Sends commands to a TPM resource manager character device, e.g.
/// `/dev/tpmrm0`.
///
/// Each [`Transport::submit`] call performs one write followed by one read,
/// matching the kernel TPM driver's request/response framing: a single
/// `write` delivers the whole command, and the following `read` returns
/// the whole response, with no further framing needed.
#[cfg(unix)]
pub struct LinuxDeviceTransport {
    file: std::fs::File,
}

#[cfg(unix)]
impl LinuxDeviceTransport {
    /// Opens `path`, refusing anything that is not a character device.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `path` does not exist, is not a character
    /// device, or cannot be opened for reading and writing.
    pub fn open(path: &str) -> std::io::Result<Self> {
        use std::os::unix::fs::FileTypeExt;

        let path = std::path::Path::new(path);
        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_char_device() {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a character device"));
        }
        let path = std::fs::canonicalize(path)?;
        log::debug!("tpm2_core: opening device {}", path.display());
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        Ok(LinuxDeviceTransport { file })
    }
}

#[cfg(unix)]
impl Transport for LinuxDeviceTransport {
    fn submit(&mut self, request: &[u8], response: &mut [u8]) -> Result<(usize, u32), TransportError> {
        use std::io::{Read, Write};

        self.file.write_all(request)?;
        let n = self.file.read(response)?;
        Ok((n, 0))
    }
}

/// An in-process transport backed by a closure, for tests that exercise
/// [`crate::executor::Executor`] without a real TPM.
pub struct SimulatorTransport<F> {
    handler: F,
}

impl<F> SimulatorTransport<F>
where
    F: FnMut(&[u8], &mut [u8]) -> Result<(usize, u32), TransportError> + Send,
{
    pub fn new(handler: F) -> Self {
        SimulatorTransport { handler }
    }
}

impl<F> Transport for SimulatorTransport<F>
where
    F: FnMut(&[u8], &mut [u8]) -> Result<(usize, u32), TransportError> + Send,
{
    fn submit(&mut self, request: &[u8], response: &mut [u8]) -> Result<(usize, u32), TransportError> {
        (self.handler)(request, response)
    }
}

/// Sends commands through the Windows TPM Base Services (TBS) API.
#[cfg(all(windows, feature = "tbs"))]
pub struct TbsTransport {
    context: windows::Win32::System::TpmBaseServices::TBS_HCONTEXT,
}

#[cfg(all(windows, feature = "tbs"))]
unsafe impl Send for TbsTransport {}

#[cfg(all(windows, feature = "tbs"))]
impl TbsTransport {
    /// Opens a TBS context for TPM 2.0.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the TBS service is unavailable or no
    /// TPM 2.0 device is present.
    pub fn open() -> Result<Self, TransportError> {
        use windows::Win32::System::TpmBaseServices::{
            Tbsi_Context_Create, TBS_CONTEXT_PARAMS2, TBS_CONTEXT_VERSION_TWO,
        };

        let mut params = TBS_CONTEXT_PARAMS2::default();
        params._bitfield = 1 << 2; // includeTpm20

        let mut handle = windows::Win32::System::TpmBaseServices::TBS_HCONTEXT::default();
        let result = unsafe {
            Tbsi_Context_Create(
                &params as *const TBS_CONTEXT_PARAMS2 as *const _,
                TBS_CONTEXT_VERSION_TWO,
                &mut handle,
            )
        };
        if result.is_err() {
            return Err(TransportError::new(format!("Tbsi_Context_Create failed: {result:#x?}")));
        }
        Ok(TbsTransport { context: handle })
    }
}

#[cfg(all(windows, feature = "tbs"))]
impl Transport for TbsTransport {
    fn submit(&mut self, request: &[u8], response: &mut [u8]) -> Result<(usize, u32), TransportError> {
        use windows::Win32::System::TpmBaseServices::{
            Tbsip_Submit_Command, TBS_COMMAND_LOCALITY_ZERO, TBS_COMMAND_PRIORITY_NORMAL,
        };

        let mut response_size = response.len() as u32;
        let result = unsafe {
            Tbsip_Submit_Command(
                self.context,
                TBS_COMMAND_LOCALITY_ZERO,
                TBS_COMMAND_PRIORITY_NORMAL,
                request,
                response.as_mut_ptr(),
                &mut response_size,
            )
        };
        if result.is_err() {
            return Err(TransportError::new(format!("Tbsip_Submit_Command failed: {result:#x?}")));
        }
        Ok((response_size as usize, 0))
    }
}

#[cfg(all(windows, feature = "tbs"))]
impl Drop for TbsTransport {
    fn drop(&mut self) {
        use windows::Win32::System::TpmBaseServices::Tbsip_Context_Close;
        unsafe {
            let _ = Tbsip_Context_Close(self.context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulator_transport_invokes_closure() {
        let mut transport = SimulatorTransport::new(|request, response| {
            response[..request.len()].copy_from_slice(request);
            Ok((request.len(), 0))
        });
        let mut response_buf = [0u8; 8];
        let (n, rc) = transport.submit(&[1, 2, 3], &mut response_buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(rc, 0);
        assert_eq!(&response_buf[..3], &[1, 2, 3]);
    }
}
