// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Host-side view of TPM resources: open sessions, loaded keys, spent
//! session contexts and audit accumulation

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::auth;
use crate::constants::TpmOrd;
use crate::error::{Error, Result};
use crate::marshal::Digest;
use crate::session::SessionKind;
use crate::types::{CounterValue, Pubkey};

/// Which session protocol a command should be authorized with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProtocol {
    Oiap,
    Osap,
}

/// Commands carrying an encrypted auth value need an OSAP shared secret
pub fn auth_protocol_for(ordinal: TpmOrd) -> AuthProtocol {
    match ordinal {
        TpmOrd::CreateWrapKey | TpmOrd::CreateCounter => AuthProtocol::Osap,
        _ => AuthProtocol::Oiap,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedKey {
    /// Public part, once GetPubKey or a load has revealed it
    pub pubkey: Option<Pubkey>,
}

/// Ordinal audit status as last reported by the TPM
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditState {
    audited: BTreeSet<u32>,
    pub digest: Option<Digest>,
    pub counter: Option<CounterValue>,
}

impl AuditState {
    pub fn is_audited(&self, ordinal: u32) -> bool {
        self.audited.contains(&ordinal)
    }

    pub fn audited(&self) -> impl Iterator<Item = u32> + '_ {
        self.audited.iter().copied()
    }

    pub(crate) fn set(&mut self, ordinal: u32, audited: bool) {
        if audited {
            self.audited.insert(ordinal);
        } else {
            self.audited.remove(&ordinal);
        }
    }

    /// Replace the audited set with a complete enumeration from the TPM
    pub(crate) fn refresh(
        &mut self,
        ordinals: impl IntoIterator<Item = u32>,
        digest: Digest,
        counter: CounterValue,
    ) {
        self.audited = ordinals.into_iter().collect();
        self.digest = Some(digest);
        self.counter = Some(counter);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceState {
    sessions: BTreeMap<u32, SessionKind>,
    keys: BTreeMap<u32, LoadedKey>,
    spent_contexts: HashSet<Digest>,
    pub audit: AuditState,
}

impl ResourceState {
    pub fn sessions(&self) -> impl Iterator<Item = (u32, &SessionKind)> {
        self.sessions.iter().map(|(h, k)| (*h, k))
    }

    pub fn session(&self, handle: u32) -> Option<&SessionKind> {
        self.sessions.get(&handle)
    }

    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.keys.keys().copied()
    }

    pub fn cached_pubkey(&self, handle: u32) -> Option<&Pubkey> {
        self.keys.get(&handle).and_then(|k| k.pubkey.as_ref())
    }

    pub(crate) fn session_opened(&mut self, handle: u32, kind: SessionKind) {
        self.sessions.insert(handle, kind);
    }

    pub(crate) fn session_closed(&mut self, handle: u32) {
        self.sessions.remove(&handle);
    }

    pub(crate) fn key_loaded(&mut self, handle: u32, pubkey: Option<Pubkey>) {
        self.keys.insert(handle, LoadedKey { pubkey });
    }

    pub(crate) fn key_evicted(&mut self, handle: u32) {
        self.keys.remove(&handle);
    }

    pub(crate) fn cache_pubkey(&mut self, handle: u32, pubkey: Pubkey) {
        self.keys.entry(handle).or_default().pubkey = Some(pubkey);
    }

    /// Sync with a fresh key handle enumeration, keeping cached public keys
    /// of handles that are still present
    pub(crate) fn refresh_keys(&mut self, handles: &[u32]) {
        self.keys.retain(|h, _| handles.contains(h));
        for &h in handles {
            self.keys.entry(h).or_default();
        }
    }

    /// Mark a session context as loaded, refusing one that already was.
    ///
    /// The claim is taken before the blob goes to the TPM so two callers
    /// cannot both load it; `release_session_context` undoes it when the
    /// load fails.
    pub(crate) fn claim_session_context(&mut self, blob: &[u8]) -> Result<()> {
        if !self.spent_contexts.insert(auth::sha1(&[blob])) {
            return Err(Error::ContextReused);
        }
        Ok(())
    }

    pub(crate) fn release_session_context(&mut self, blob: &[u8]) {
        self.spent_contexts.remove(&auth::sha1(&[blob]));
    }

    /// TPM_Startup ends every session and invalidates saved session contexts
    pub(crate) fn tpm_started(&mut self) {
        self.sessions.clear();
        self.spent_contexts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_keys_keeps_cache() {
        let mut state = ResourceState::default();
        let pubkey = crate::types::KeyBlob::template(
            crate::constants::TpmKeyUsage::Signing,
            2048,
            Default::default(),
        )
        .pubkey();
        state.key_loaded(0x0100_0001, Some(pubkey.clone()));
        state.key_loaded(0x0100_0002, None);
        state.refresh_keys(&[0x0100_0001, 0x0100_0003]);
        assert_eq!(state.keys().collect::<Vec<_>>(), vec![0x0100_0001, 0x0100_0003]);
        assert_eq!(state.cached_pubkey(0x0100_0001), Some(&pubkey));
        assert_eq!(state.cached_pubkey(0x0100_0003), None);
    }

    #[test]
    fn test_session_context_single_use() {
        let mut state = ResourceState::default();
        let blob = [1u8, 2, 3];
        state.claim_session_context(&blob).unwrap();
        assert!(matches!(
            state.claim_session_context(&blob),
            Err(Error::ContextReused)
        ));
        state.claim_session_context(&[1, 2, 4]).unwrap();
    }

    #[test]
    fn test_released_context_can_be_claimed_again() {
        let mut state = ResourceState::default();
        let blob = [9u8; 8];
        state.claim_session_context(&blob).unwrap();
        state.release_session_context(&blob);
        state.claim_session_context(&blob).unwrap();
    }

    #[test]
    fn test_startup_forgets_sessions_and_contexts() {
        let mut state = ResourceState::default();
        state.session_opened(0x0200_0001, SessionKind::Oiap);
        state.claim_session_context(&[1, 2, 3]).unwrap();
        state.tpm_started();
        assert_eq!(state.sessions().count(), 0);
        state.claim_session_context(&[1, 2, 3]).unwrap();
    }

    #[test]
    fn test_audit_state() {
        let mut audit = AuditState::default();
        audit.set(0x20, true);
        audit.set(0x41, true);
        audit.set(0x20, false);
        assert!(!audit.is_audited(0x20));
        assert!(audit.is_audited(0x41));
        audit.refresh(
            [0x65, 0x46],
            [0; 20],
            CounterValue {
                label: *b"AUDT",
                counter: 1,
            },
        );
        assert_eq!(audit.audited().collect::<Vec<_>>(), vec![0x46, 0x65]);
    }

    #[test]
    fn test_protocol_selection() {
        assert_eq!(auth_protocol_for(TpmOrd::CreateWrapKey), AuthProtocol::Osap);
        assert_eq!(auth_protocol_for(TpmOrd::Sign), AuthProtocol::Oiap);
    }
}
