// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Monotonic counters
//!
//! Counter commands are the ones the TPM may answer with `TPM_RETRY` while
//! another counter operation holds its NV lock; the dispatcher retries them.

use tracing::info;

use super::{Request, TpmContext};
use crate::auth::AuthValue;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::session::{SessionAuth, SessionKind};
use crate::types::CounterValue;

impl TpmContext {
    // ==================== Counter Operations ====================

    /// Create a counter owned by the TPM owner.
    ///
    /// `owner` must be an OSAP session on the owner; the counter's auth
    /// value travels ADIP-encrypted. If the TPM asks for a retry, the
    /// session is replaced by a fresh OSAP session on the owner. Returns the
    /// counter id and its start value.
    pub fn create_counter(
        &self,
        mut owner: SessionAuth<'_>,
        counter_auth: &AuthValue,
        label: [u8; 4],
    ) -> Result<(u32, CounterValue)> {
        if !matches!(
            owner.session.kind(),
            SessionKind::Osap {
                entity_type: TpmEntityType::Owner,
                ..
            }
        ) {
            return Err(Error::Encoding(
                "CreateCounter needs an OSAP session on the owner".into(),
            ));
        }
        let mut params = CommandBuffer::new();
        params.put_bytes(&label);

        let reply = self.execute(
            Request::new(TpmOrd::CreateCounter)
                .encrypted_auth(counter_auth)
                .params(params),
            std::slice::from_mut(&mut owner),
        )?;
        let mut rd = reply.reader();
        let id = rd.get_u32()?;
        let value = CounterValue::unmarshal(&mut rd)?;
        rd.finish()?;
        info!("created counter {id} at {}", value.counter);
        Ok((id, value))
    }

    /// Increment a counter
    pub fn increment_counter(&self, id: u32, mut auth: SessionAuth<'_>) -> Result<CounterValue> {
        let mut params = CommandBuffer::new();
        params.put_u32(id);
        let reply = self.execute(
            Request::new(TpmOrd::IncrementCounter).params(params),
            std::slice::from_mut(&mut auth),
        )?;
        CounterValue::from_bytes(&reply.params)
    }

    /// Read a counter; no authorization needed
    pub fn read_counter(&self, id: u32) -> Result<CounterValue> {
        let mut params = CommandBuffer::new();
        params.put_u32(id);
        let reply = self.execute(Request::new(TpmOrd::ReadCounter).params(params), &mut [])?;
        CounterValue::from_bytes(&reply.params)
    }

    /// Release a counter with the counter's own authorization
    pub fn release_counter(&self, id: u32, mut auth: SessionAuth<'_>) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_u32(id);
        let reply = self.execute(
            Request::new(TpmOrd::ReleaseCounter).params(params),
            std::slice::from_mut(&mut auth),
        )?;
        reply.reader().finish()
    }

    /// Release a counter with owner authorization
    pub fn release_counter_owner(&self, id: u32, mut owner: SessionAuth<'_>) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_u32(id);
        let reply = self.execute(
            Request::new(TpmOrd::ReleaseCounterOwner).params(params),
            std::slice::from_mut(&mut owner),
        )?;
        reply.reader().finish()
    }
}
