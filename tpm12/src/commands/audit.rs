// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Ordinal auditing

use tracing::debug;

use super::{optional, Request, TpmContext};
use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::session::SessionAuth;
use crate::types::{AuditDigestPage, CounterValue};

/// The audit digest together with every audited ordinal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditDigest {
    pub counter: CounterValue,
    pub digest: Digest,
    pub ordinals: Vec<u32>,
}

/// Output of GetAuditDigestSigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedAuditDigest {
    pub counter: CounterValue,
    pub audit_digest: Digest,
    /// SHA-1 over the audited ordinal list
    pub ordinal_digest: Digest,
    pub signature: Vec<u8>,
}

impl TpmContext {
    // ==================== Audit Operations ====================

    /// One page of the audited ordinal list, starting at `start_ordinal`
    pub fn get_audit_digest_page(&self, start_ordinal: u32) -> Result<AuditDigestPage> {
        let mut params = CommandBuffer::new();
        params.put_u32(start_ordinal);
        let reply = self.execute(Request::new(TpmOrd::GetAuditDigest).params(params), &mut [])?;
        AuditDigestPage::from_bytes(&reply.params)
    }

    /// The audit digest and the complete audited ordinal list, following
    /// `more` until the TPM has listed everything
    pub fn get_audit_digest(&self) -> Result<AuditDigest> {
        let mut start = 0u32;
        let mut ordinals = Vec::new();
        let (counter, digest) = loop {
            let page = self.get_audit_digest_page(start)?;
            debug!(
                "audit page from 0x{start:08x}: {} ordinals, more={}",
                page.ordinals.len(),
                page.more
            );
            ordinals.extend_from_slice(&page.ordinals);
            if !page.more {
                break (page.counter, page.digest);
            }
            let next = page
                .ordinals
                .last()
                .filter(|&&last| last >= start)
                .and_then(|last| last.checked_add(1))
                .ok_or_else(|| {
                    Error::MalformedResponse(format!(
                        "audit page from 0x{start:08x} sets more without advancing"
                    ))
                })?;
            start = next;
        };

        self.state()
            .audit
            .refresh(ordinals.iter().copied(), digest, counter);
        Ok(AuditDigest {
            counter,
            digest,
            ordinals,
        })
    }

    /// Audit digest signed by a loaded signing key
    pub fn get_audit_digest_signed(
        &self,
        key: u32,
        mut auth: Option<SessionAuth<'_>>,
        close_audit: bool,
        anti_replay: &Digest,
    ) -> Result<SignedAuditDigest> {
        let mut params = CommandBuffer::new();
        params.put_bool(close_audit);
        params.put_bytes(anti_replay);
        let reply = self.execute(
            Request::new(TpmOrd::GetAuditDigestSigned)
                .handle(key)
                .params(params),
            optional(&mut auth),
        )?;
        let mut rd = reply.reader();
        let signed = SignedAuditDigest {
            counter: CounterValue::unmarshal(&mut rd)?,
            audit_digest: rd.get_digest()?,
            ordinal_digest: rd.get_digest()?,
            signature: rd.get_sized()?,
        };
        rd.finish()?;

        let mut state = self.state();
        state.audit.digest = Some(signed.audit_digest);
        state.audit.counter = Some(signed.counter);
        Ok(signed)
    }

    /// Turn auditing of one ordinal on or off
    pub fn set_ordinal_audit_status(
        &self,
        ordinal: u32,
        audited: bool,
        mut owner: SessionAuth<'_>,
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_u32(ordinal);
        params.put_bool(audited);
        let reply = self.execute(
            Request::new(TpmOrd::SetOrdinalAuditStatus).params(params),
            std::slice::from_mut(&mut owner),
        )?;
        reply.reader().finish()?;
        self.state().audit.set(ordinal, audited);
        debug!("audit of ordinal 0x{ordinal:08x} set to {audited}");
        Ok(())
    }
}
