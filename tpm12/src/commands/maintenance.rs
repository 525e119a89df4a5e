// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle, self-test, random number and capability commands

use tracing::{debug, info};

use super::{Request, TpmContext};
use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::types::HandleList;

/// Largest chunk asked of GetRandom in one round trip
const RANDOM_CHUNK: usize = 1024;

impl TpmContext {
    // ==================== Lifecycle ====================

    pub fn startup(&self, startup_type: TpmStartupType) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_u16(startup_type.to_u16());
        let reply = self.execute(Request::new(TpmOrd::Startup).params(params), &mut [])?;
        reply.reader().finish()?;
        self.state().tpm_started();
        info!("TPM started ({startup_type:?})");
        Ok(())
    }

    // ==================== Self-Test ====================

    pub fn self_test_full(&self) -> Result<()> {
        let reply = self.execute(Request::new(TpmOrd::SelfTestFull), &mut [])?;
        reply.reader().finish()
    }

    pub fn continue_self_test(&self) -> Result<()> {
        let reply = self.execute(Request::new(TpmOrd::ContinueSelfTest), &mut [])?;
        reply.reader().finish()
    }

    /// Vendor-specific self-test result data
    pub fn get_test_result(&self) -> Result<Vec<u8>> {
        let reply = self.execute(Request::new(TpmOrd::GetTestResult), &mut [])?;
        let mut rd = reply.reader();
        let data = rd.get_sized()?;
        rd.finish()?;
        Ok(data)
    }

    // ==================== Random ====================

    /// Get `len` random bytes, asking again until the TPM has supplied all
    pub fn get_random(&self, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let want = (len - out.len()).min(RANDOM_CHUNK);
            let mut params = CommandBuffer::new();
            params.put_u32(want as u32);
            let reply = self.execute(Request::new(TpmOrd::GetRandom).params(params), &mut [])?;
            let mut rd = reply.reader();
            let chunk = rd.get_sized()?;
            rd.finish()?;
            if chunk.is_empty() {
                return Err(Error::MalformedResponse(
                    "GetRandom returned no bytes".into(),
                ));
            }
            if chunk.len() > want {
                return Err(Error::MalformedResponse(format!(
                    "GetRandom returned {} bytes, {want} requested",
                    chunk.len()
                )));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Add entropy to the TPM's RNG state
    pub fn stir_random(&self, data: &[u8]) -> Result<()> {
        if data.len() >= 256 {
            return Err(Error::Encoding(format!(
                "StirRandom takes less than 256 bytes, got {}",
                data.len()
            )));
        }
        let mut params = CommandBuffer::new();
        params.put_sized(data)?;
        let reply = self.execute(Request::new(TpmOrd::StirRandom).params(params), &mut [])?;
        reply.reader().finish()
    }

    // ==================== Capability ====================

    /// Raw GetCapability; returns the response blob
    pub fn get_capability(&self, cap: TpmCap, sub_cap: &[u8]) -> Result<Vec<u8>> {
        let mut params = CommandBuffer::new();
        params.put_u32(cap.to_u32());
        params.put_sized(sub_cap)?;
        let reply = self.execute(Request::new(TpmOrd::GetCapability).params(params), &mut [])?;
        let mut rd = reply.reader();
        let resp = rd.get_sized()?;
        rd.finish()?;
        debug!("capability {cap:?}: {} bytes", resp.len());
        Ok(resp)
    }

    /// A capability whose answer is one 32-bit value, e.g. a property
    pub fn get_capability_u32(&self, cap: TpmCap, sub_cap: u32) -> Result<u32> {
        let resp = self.get_capability(cap, &sub_cap.to_be_bytes())?;
        u32::from_bytes(&resp)
    }

    /// Handles of every loaded resource of one type
    pub fn get_handle_list(&self, resource_type: TpmResourceType) -> Result<Vec<u32>> {
        let resp = self.get_capability(TpmCap::Handle, &resource_type.to_u32().to_be_bytes())?;
        Ok(HandleList::from_bytes(&resp)?.handles)
    }

    /// Handles of every loaded key
    pub fn get_key_handles(&self) -> Result<Vec<u32>> {
        let resp = self.get_capability(TpmCap::KeyHandle, &[])?;
        Ok(HandleList::from_bytes(&resp)?.handles)
    }
}
