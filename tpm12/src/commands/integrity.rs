// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! PCR and DIR registers

use tracing::debug;

use super::{Request, TpmContext};
use crate::constants::*;
use crate::error::Result;
use crate::marshal::*;
use crate::session::SessionAuth;
use crate::types::PcrSelection;

impl TpmContext {
    // ==================== PCR Operations ====================

    /// Extend a PCR; returns the new register value
    pub fn extend(&self, pcr: u32, digest: &Digest) -> Result<Digest> {
        let mut params = CommandBuffer::new();
        params.put_u32(pcr);
        params.put_bytes(digest);
        let reply = self.execute(Request::new(TpmOrd::Extend).params(params), &mut [])?;
        let value = Digest::from_bytes(&reply.params)?;
        debug!("extended PCR {pcr} to {}", hex::encode(value));
        Ok(value)
    }

    /// Read a PCR value
    pub fn pcr_read(&self, pcr: u32) -> Result<Digest> {
        let mut params = CommandBuffer::new();
        params.put_u32(pcr);
        let reply = self.execute(Request::new(TpmOrd::PcrRead).params(params), &mut [])?;
        Digest::from_bytes(&reply.params)
    }

    /// Reset the selected resettable PCRs
    pub fn pcr_reset(&self, selection: &PcrSelection) -> Result<()> {
        let mut params = CommandBuffer::new();
        selection.marshal(&mut params)?;
        let reply = self.execute(Request::new(TpmOrd::PcrReset).params(params), &mut [])?;
        reply.reader().finish()
    }

    // ==================== DIR Operations ====================

    /// Write a DIR register with owner authorization
    pub fn dir_write_auth(
        &self,
        index: u32,
        value: &Digest,
        mut owner: SessionAuth<'_>,
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_u32(index);
        params.put_bytes(value);
        let reply = self.execute(
            Request::new(TpmOrd::DirWriteAuth).params(params),
            std::slice::from_mut(&mut owner),
        )?;
        reply.reader().finish()
    }

    /// Read a DIR register
    pub fn dir_read(&self, index: u32) -> Result<Digest> {
        let mut params = CommandBuffer::new();
        params.put_u32(index);
        let reply = self.execute(Request::new(TpmOrd::DirRead).params(params), &mut [])?;
        Digest::from_bytes(&reply.params)
    }
}
