// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command framing and the exchange with one TPM
//!
//! Frames TPM 1.2 commands, parses response headers and serializes access
//! to the underlying transport.

use tracing::{debug, trace, warn};

use super::constants::*;
use super::error::{Error, Result};
use super::marshal::*;
use super::transport::Transport;
use super::types::AuthResponse;

/// A transport plus the bookkeeping needed to recover from abandoned
/// exchanges
pub struct TpmDevice {
    transport: Box<dyn Transport>,
    poisoned: bool,
    dump_wire: bool,
}

impl TpmDevice {
    pub fn new(transport: Box<dyn Transport>, dump_wire: bool) -> Self {
        Self {
            transport,
            poisoned: false,
            dump_wire,
        }
    }

    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    /// Whether the next exchange will reopen the channel first
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// One request/response exchange; a failed exchange poisons the channel
    pub fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        if self.poisoned {
            debug!("reopening {} after an abandoned exchange", self.endpoint());
            self.transport.reopen()?;
            self.poisoned = false;
        }
        if self.dump_wire {
            debug!("TPM <- {}", hex::encode(command));
        } else {
            trace!("TPM <- {} bytes", command.len());
        }

        let result = self
            .transport
            .send(command)
            .and_then(|_| self.transport.receive());
        match result {
            Ok(response) => {
                if self.dump_wire {
                    debug!("TPM -> {}", hex::encode(&response));
                }
                Ok(response)
            }
            Err(err) => {
                // the TPM may still answer out of band; never reuse this channel
                warn!("exchange with {} failed: {err}", self.endpoint());
                self.poisoned = true;
                Err(err)
            }
        }
    }

    /// Execute a TPM command and parse the response header
    pub fn execute(&mut self, command: &[u8]) -> Result<TpmResponse> {
        let response_bytes = self.transmit(command)?;
        TpmResponse::parse(&response_bytes)
    }
}

/// A request under construction: header, handles, parameters, trailers
pub struct TpmCommand {
    buf: CommandBuffer,
    auth_count: usize,
}

impl TpmCommand {
    /// Start a command; the tag is chosen at `finalize` from the number of
    /// authorization trailers added
    pub fn new(ordinal: TpmOrd) -> Self {
        let mut buf = CommandBuffer::with_capacity(256);

        // Header: tag (2) + size (4) + ordinal (4)
        buf.put_u16(TpmTag::RquCommand.to_u16());
        buf.put_u32(0); // paramSize, patched by finalize
        buf.put_u32(ordinal.to_u32());

        Self { buf, auth_count: 0 }
    }

    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        self.buf.put_bytes(data);
    }

    /// Append an authorization trailer
    pub fn add_auth(&mut self, auth: &crate::types::AuthCommand) -> Result<()> {
        self.auth_count += 1;
        auth.marshal(&mut self.buf)
    }

    /// Pick the tag, patch paramSize and hand back the wire bytes
    pub fn finalize(mut self) -> Result<Vec<u8>> {
        let tag = TpmTag::request(self.auth_count).ok_or_else(|| {
            Error::Encoding(format!(
                "{} authorization sessions on one command",
                self.auth_count
            ))
        })?;
        let size = u32::try_from(self.buf.len())
            .map_err(|_| Error::Encoding("command exceeds 4 GiB".into()))?;
        self.buf.update_u16(0, tag.to_u16());
        self.buf.update_u32(2, size);
        Ok(self.buf.into_vec())
    }
}

/// A response with its header split off
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmTag,
    pub return_code: u32,
    pub data: Vec<u8>,
}

impl TpmResponse {
    /// Check the response tag and that paramSize matches the received length
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < HEADER_SIZE {
            return Err(Error::MalformedResponse(format!(
                "TPM response too short: {} bytes",
                response.len()
            )));
        }

        let mut buf = ResponseBuffer::new(response);

        let tag_raw = buf.get_u16()?;
        let tag = TpmTag::from_u16(tag_raw)
            .filter(|t| t.response_auth_count().is_some())
            .ok_or_else(|| {
                Error::MalformedResponse(format!("invalid response tag: 0x{tag_raw:04x}"))
            })?;

        let size = buf.get_u32()? as usize;
        if response.len() != size {
            return Err(Error::MalformedResponse(format!(
                "TPM response size mismatch: declared {}, got {}",
                size,
                response.len()
            )));
        }

        let return_code = buf.get_u32()?;

        Ok(Self {
            tag,
            return_code,
            data: buf.get_remaining(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.return_code == tpm_rc::SUCCESS
    }

    /// Number of authorization trailers the tag announces
    pub fn auth_count(&self) -> usize {
        self.tag.response_auth_count().unwrap_or(0)
    }

    /// Split the output parameters from the trailing authorization blocks.
    ///
    /// The tag must announce exactly `expected` trailers.
    pub fn split_auth(&self, expected: usize) -> Result<(&[u8], Vec<AuthResponse>)> {
        if self.auth_count() != expected {
            return Err(Error::MalformedResponse(format!(
                "response tag {:?} carries {} authorization blocks, expected {}",
                self.tag,
                self.auth_count(),
                expected
            )));
        }
        let trailer_len = expected * AUTH_RESPONSE_SIZE;
        if self.data.len() < trailer_len {
            return Err(Error::MalformedResponse(format!(
                "response of {} bytes cannot hold {expected} authorization blocks",
                self.data.len()
            )));
        }
        let (params, trailers) = self.data.split_at(self.data.len() - trailer_len);
        let auths = trailers
            .chunks_exact(AUTH_RESPONSE_SIZE)
            .map(AuthResponse::from_bytes)
            .collect::<Result<Vec<_>>>()?;
        Ok((params, auths))
    }
}
