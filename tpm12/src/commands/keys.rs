// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Key loading, eviction, creation and signing

use tracing::debug;

use super::{optional, Request, TpmContext};
use crate::auth::{self, AuthValue};
use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::session::{SessionAuth, SessionKind};
use crate::types::{KeyBlob, Pubkey};

impl TpmContext {
    // ==================== Key Operations ====================

    /// Load a wrapped key under `parent` (TPM_LoadKey2)
    pub fn load_key2(
        &self,
        parent: u32,
        mut parent_auth: Option<SessionAuth<'_>>,
        key: &KeyBlob,
    ) -> Result<u32> {
        self.load_with(TpmOrd::LoadKey2, parent, optional(&mut parent_auth), key)
    }

    /// Load a wrapped key with the 1.1 ordinal, whose response digest covers
    /// the new handle
    pub fn load_key(
        &self,
        parent: u32,
        mut parent_auth: Option<SessionAuth<'_>>,
        key: &KeyBlob,
    ) -> Result<u32> {
        self.load_with(TpmOrd::LoadKey, parent, optional(&mut parent_auth), key)
    }

    fn load_with(
        &self,
        ordinal: TpmOrd,
        parent: u32,
        auths: &mut [SessionAuth<'_>],
        key: &KeyBlob,
    ) -> Result<u32> {
        let mut params = CommandBuffer::new();
        key.marshal(&mut params)?;
        let req = Request::new(ordinal)
            .handle(parent)
            .params(params)
            .out_handles(1, ordinal == TpmOrd::LoadKey);
        let reply = self.execute(req, auths)?;
        let handle = reply.handle()?;
        reply.reader().finish()?;

        debug!("loaded key 0x{handle:08x} under 0x{parent:08x}");
        self.state().key_loaded(handle, Some(key.pubkey()));
        Ok(handle)
    }

    /// Evict a loaded key
    pub fn evict_key(&self, handle: u32) -> Result<()> {
        self.execute(Request::new(TpmOrd::EvictKey).handle(handle), &mut [])?;
        self.state().key_evicted(handle);
        debug!("evicted key 0x{handle:08x}");
        Ok(())
    }

    /// Read the public part of a loaded key
    pub fn get_pub_key(&self, handle: u32, mut auth: Option<SessionAuth<'_>>) -> Result<Pubkey> {
        let reply = self.execute(
            Request::new(TpmOrd::GetPubKey).handle(handle),
            optional(&mut auth),
        )?;
        let pubkey = Pubkey::from_bytes(&reply.params)?;
        self.state().cache_pubkey(handle, pubkey.clone());
        Ok(pubkey)
    }

    /// Create a key wrapped by `parent`.
    ///
    /// `auth` must be an OSAP session on the parent: the new usage and
    /// migration secrets travel ADIP-encrypted under its shared secret.
    pub fn create_wrap_key(
        &self,
        parent: u32,
        mut auth: SessionAuth<'_>,
        usage_auth: &AuthValue,
        migration_auth: &AuthValue,
        template: &KeyBlob,
    ) -> Result<KeyBlob> {
        if !matches!(auth.session.kind(), SessionKind::Osap { .. }) {
            return Err(Error::Encoding(
                "CreateWrapKey needs an OSAP session on the parent key".into(),
            ));
        }
        let shared = auth
            .session
            .shared_secret()
            .cloned()
            .ok_or_else(|| Error::Encoding("OSAP session has no shared secret".into()))?;
        let nonce_even = *auth.session.nonce_even();
        let nonce_odd = auth.session.next_nonce_odd()?;

        let mut params = CommandBuffer::new();
        params.put_bytes(&auth::encrypt_auth(&shared, &nonce_even, usage_auth));
        params.put_bytes(&auth::encrypt_auth(&shared, &nonce_odd, migration_auth));
        template.marshal(&mut params)?;

        let reply = self.execute(
            Request::new(TpmOrd::CreateWrapKey)
                .handle(parent)
                .params(params),
            std::slice::from_mut(&mut auth),
        )?;
        let key = KeyBlob::from_bytes(&reply.params)?;
        debug!(
            "created {:?} key of {} bytes under 0x{parent:08x}",
            key.usage(),
            key.pub_key.key.len()
        );
        Ok(key)
    }

    /// Sign `data` (usually a digest) with a loaded signing key
    pub fn sign(
        &self,
        handle: u32,
        mut auth: Option<SessionAuth<'_>>,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let mut params = CommandBuffer::new();
        params.put_sized(data)?;
        let reply = self.execute(
            Request::new(TpmOrd::Sign).handle(handle).params(params),
            optional(&mut auth),
        )?;
        let mut rd = reply.reader();
        let signature = rd.get_sized()?;
        rd.finish()?;
        Ok(signature)
    }

    // ==================== Key Enumeration ====================

    /// Handles of every loaded key, refreshing the tracked key set
    pub fn list_keys(&self) -> Result<Vec<u32>> {
        let handles = self.get_key_handles()?;
        self.state().refresh_keys(&handles);
        Ok(handles)
    }

    /// Evict every loaded key, re-enumerating after each eviction since
    /// handles may shift. Returns the number of keys evicted.
    pub fn evict_all(&self) -> Result<usize> {
        let mut evicted = 0;
        let mut last = None;
        loop {
            let handles = self.list_keys()?;
            let Some(&next) = handles.first() else {
                break;
            };
            if let Some(prev) = last {
                if handles.contains(&prev) {
                    return Err(Error::MalformedResponse(format!(
                        "key 0x{prev:08x} still listed after eviction"
                    )));
                }
            }
            self.evict_key(next)?;
            last = Some(next);
            evicted += 1;
        }
        debug!("evicted {evicted} keys");
        Ok(evicted)
    }
}
