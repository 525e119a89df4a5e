// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Saving resources out of the TPM and loading them back

use tracing::debug;

use super::{Request, TpmContext};
use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::session::AuthSession;
use crate::types::ContextBlob;

impl TpmContext {
    // ==================== Context Operations ====================

    /// Save a loaded key as an opaque blob (TPM 1.1 interface)
    pub fn save_key_context(&self, handle: u32) -> Result<Vec<u8>> {
        let reply = self.execute(Request::new(TpmOrd::SaveKeyContext).handle(handle), &mut [])?;
        let mut rd = reply.reader();
        let blob = rd.get_sized()?;
        rd.finish()?;
        debug!("saved key 0x{handle:08x}: {} byte context", blob.len());
        Ok(blob)
    }

    /// Load a blob from `save_key_context`; returns the new key handle
    pub fn load_key_context(&self, blob: &[u8]) -> Result<u32> {
        let mut params = CommandBuffer::new();
        params.put_sized(blob)?;
        let reply = self.execute(
            Request::new(TpmOrd::LoadKeyContext)
                .params(params)
                .out_handles(1, false),
            &mut [],
        )?;
        let handle = reply.handle()?;
        reply.reader().finish()?;
        self.state().key_loaded(handle, None);
        debug!("restored key context as 0x{handle:08x}");
        Ok(handle)
    }

    /// Move an authorization session out of the TPM.
    ///
    /// The session cannot be used until `load_auth_context` brings it back.
    pub fn save_auth_context(&self, session: &mut AuthSession) -> Result<Vec<u8>> {
        let handle = session.handle();
        if !session.is_open() {
            return Err(Error::SessionClosed(handle));
        }
        let reply = self.execute(Request::new(TpmOrd::SaveAuthContext).handle(handle), &mut [])?;
        let mut rd = reply.reader();
        let blob = rd.get_sized()?;
        rd.finish()?;

        session.suspend();
        self.state().session_closed(handle);
        debug!("saved session 0x{handle:08x}");
        Ok(blob)
    }

    /// Bring a saved session back. Each saved session context loads once.
    pub fn load_auth_context(&self, blob: &[u8], session: &mut AuthSession) -> Result<()> {
        if !session.is_suspended() {
            return Err(Error::SessionClosed(session.handle()));
        }
        self.state().claim_session_context(blob)?;
        let handle = match self.load_auth_blob(blob) {
            Ok(handle) => handle,
            Err(err) => {
                self.state().release_session_context(blob);
                return Err(err);
            }
        };

        session.resume(handle);
        self.state().session_opened(handle, session.kind().clone());
        debug!("restored session as 0x{handle:08x}");
        Ok(())
    }

    fn load_auth_blob(&self, blob: &[u8]) -> Result<u32> {
        let mut params = CommandBuffer::new();
        params.put_sized(blob)?;
        let reply = self.execute(
            Request::new(TpmOrd::LoadAuthContext)
                .params(params)
                .out_handles(1, false),
            &mut [],
        )?;
        let handle = reply.handle()?;
        reply.reader().finish()?;
        Ok(handle)
    }

    /// Save any resource (TPM 1.2 interface)
    pub fn save_context(
        &self,
        handle: u32,
        resource_type: TpmResourceType,
        label: [u8; 16],
    ) -> Result<ContextBlob> {
        let mut params = CommandBuffer::new();
        params.put_u32(resource_type.to_u32());
        params.put_bytes(&label);
        let reply = self.execute(
            Request::new(TpmOrd::SaveContext)
                .handle(handle)
                .params(params),
            &mut [],
        )?;
        let mut rd = reply.reader();
        let raw = rd.get_sized()?;
        rd.finish()?;
        let blob = ContextBlob::from_bytes(&raw)?;
        if blob.resource() != Some(resource_type) {
            return Err(Error::MalformedResponse(format!(
                "saved {resource_type:?} context reports resource type 0x{:08x}",
                blob.resource_type
            )));
        }
        if resource_type.is_session() {
            self.state().session_closed(handle);
        }
        debug!(
            "saved {resource_type:?} 0x{handle:08x}, context count {}",
            blob.context_count
        );
        Ok(blob)
    }

    /// Load a `save_context` blob.
    ///
    /// `entity_hint` is the handle to restore under when `keep_handle` is
    /// set. Session contexts are refused locally on a second load.
    pub fn load_context(
        &self,
        entity_hint: u32,
        keep_handle: bool,
        blob: &ContextBlob,
    ) -> Result<u32> {
        let raw = blob.to_bytes()?;
        let resource = blob.resource().ok_or_else(|| {
            Error::Encoding(format!(
                "unknown context resource type 0x{:08x}",
                blob.resource_type
            ))
        })?;
        if resource.is_session() {
            self.state().claim_session_context(&raw)?;
        }

        let mut params = CommandBuffer::new();
        params.put_u32(entity_hint);
        params.put_bool(keep_handle);
        params.put_sized(&raw)?;
        let loaded = self
            .execute(
                Request::new(TpmOrd::LoadContext)
                    .params(params)
                    .out_handles(1, false),
                &mut [],
            )
            .and_then(|reply| {
                let handle = reply.handle()?;
                reply.reader().finish()?;
                Ok(handle)
            });
        let handle = match loaded {
            Ok(handle) => handle,
            Err(err) => {
                if resource.is_session() {
                    self.state().release_session_context(&raw);
                }
                return Err(err);
            }
        };

        if resource == TpmResourceType::Key {
            self.state().key_loaded(handle, None);
        }
        debug!("loaded {resource:?} context as 0x{handle:08x}");
        Ok(handle)
    }
}
