// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 authorization sessions (OIAP and OSAP)
//!
//! A session owns its rolling nonce state. It is handed to the dispatcher by
//! `&mut` for the duration of a single command, so two in-flight commands
//! can never share a nonce sequence.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::auth::{self, AuthValue};
use crate::constants::{TpmEntityType, TpmOrd};
use crate::error::{Error, Result};
use crate::marshal::Digest;
use crate::types::{AuthCommand, AuthResponse};

/// Which protocol established the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    /// Object-independent: the HMAC key is the target entity's auth value
    Oiap,
    /// Object-specific: the HMAC key is a secret derived once at setup
    Osap {
        entity_type: TpmEntityType,
        entity_value: u32,
    },
}

/// An open authorization session
#[derive(Debug)]
pub struct AuthSession {
    handle: u32,
    kind: SessionKind,
    shared_secret: Option<AuthValue>,
    nonce_even: Digest,
    armed_odd: Option<Digest>,
    in_flight: Option<(Digest, bool)>,
    issued_odd: HashSet<Digest>,
    seen_even: HashSet<Digest>,
    open: bool,
    suspended: bool,
}

impl AuthSession {
    pub(crate) fn oiap(handle: u32, nonce_even: Digest) -> Self {
        debug!("OIAP session 0x{handle:08x} established");
        Self {
            handle,
            kind: SessionKind::Oiap,
            shared_secret: None,
            nonce_even,
            armed_odd: None,
            in_flight: None,
            issued_odd: HashSet::new(),
            seen_even: HashSet::from([nonce_even]),
            open: true,
            suspended: false,
        }
    }

    /// Finish OSAP setup: sharedSecret = HMAC(entityAuth, nonceEvenOSAP || nonceOddOSAP)
    pub(crate) fn osap(
        handle: u32,
        nonce_even: Digest,
        entity_type: TpmEntityType,
        entity_value: u32,
        entity_auth: &AuthValue,
        nonce_even_osap: &Digest,
        nonce_odd_osap: &Digest,
    ) -> Self {
        let shared = auth::hmac_sha1(entity_auth, &[nonce_even_osap, nonce_odd_osap]);
        debug!(
            "OSAP session 0x{handle:08x} established for {entity_type:?} 0x{entity_value:08x}"
        );
        Self {
            handle,
            kind: SessionKind::Osap {
                entity_type,
                entity_value,
            },
            shared_secret: Some(AuthValue::from_raw(shared)),
            nonce_even,
            armed_odd: None,
            in_flight: None,
            issued_odd: HashSet::from([*nonce_odd_osap]),
            seen_even: HashSet::from([nonce_even, *nonce_even_osap]),
            open: true,
            suspended: false,
        }
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn kind(&self) -> &SessionKind {
        &self.kind
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Saved out of the TPM and waiting to be loaded again
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// The TPM's most recent even nonce
    pub fn nonce_even(&self) -> &Digest {
        &self.nonce_even
    }

    /// OSAP shared secret, used for ADIP encryption of new auth values
    pub fn shared_secret(&self) -> Option<&AuthValue> {
        self.shared_secret.as_ref()
    }

    /// Draw the odd nonce the next command on this session will carry.
    ///
    /// Commands that encrypt a second auth value need the odd nonce before
    /// their parameters are built; calling this again before the command is
    /// sent returns the same nonce.
    pub fn next_nonce_odd(&mut self) -> Result<Digest> {
        self.ensure_open()?;
        if let Some(nonce) = self.armed_odd {
            return Ok(nonce);
        }
        let nonce = auth::random_nonce();
        if !self.issued_odd.insert(nonce) {
            warn!("odd nonce repeated on session 0x{:08x}", self.handle);
            self.open = false;
            return Err(Error::NonceReuse(self.handle));
        }
        self.armed_odd = Some(nonce);
        Ok(nonce)
    }

    fn hmac_key<'a>(&'a self, entity_auth: &'a AuthValue) -> &'a AuthValue {
        self.shared_secret.as_ref().unwrap_or(entity_auth)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::SessionClosed(self.handle))
        }
    }

    /// Build the request trailer for a command whose inParamDigest is `in_digest`
    pub(crate) fn authorize(
        &mut self,
        entity_auth: &AuthValue,
        in_digest: &Digest,
        continue_session: bool,
    ) -> Result<AuthCommand> {
        let nonce_odd = self.next_nonce_odd()?;
        self.armed_odd = None;
        let hmac = auth::session_hmac(
            self.hmac_key(entity_auth),
            in_digest,
            &self.nonce_even,
            &nonce_odd,
            continue_session,
        );
        self.in_flight = Some((nonce_odd, continue_session));
        Ok(AuthCommand {
            handle: self.handle,
            nonce_odd,
            continue_session,
            auth: hmac,
        })
    }

    /// Check the response trailer and roll the even nonce forward
    pub(crate) fn verify(
        &mut self,
        ordinal: TpmOrd,
        entity_auth: &AuthValue,
        out_digest: &Digest,
        response: &AuthResponse,
    ) -> Result<()> {
        let Some((nonce_odd, _)) = self.in_flight.take() else {
            return Err(Error::MalformedResponse(format!(
                "no outstanding request on session 0x{:08x}",
                self.handle
            )));
        };
        if !self.seen_even.insert(response.nonce_even) {
            warn!("even nonce repeated on session 0x{:08x}", self.handle);
            self.open = false;
            return Err(Error::NonceReuse(self.handle));
        }
        let valid = auth::hmac_sha1_verify(
            self.hmac_key(entity_auth),
            &[
                out_digest,
                &response.nonce_even,
                &nonce_odd,
                &[u8::from(response.continue_session)],
            ],
            &response.auth,
        );
        if !valid {
            warn!(
                "{ordinal:?}: response HMAC mismatch on session 0x{:08x}",
                self.handle
            );
            self.open = false;
            return Err(Error::AuthValidation { ordinal });
        }
        self.nonce_even = response.nonce_even;
        if !response.continue_session {
            self.open = false;
        }
        Ok(())
    }

    /// The command failed. A TPM 1.2 ends every session named in a command
    /// it answers with an error, `TPM_RETRY` included.
    pub(crate) fn abort(&mut self) {
        self.in_flight = None;
        self.armed_odd = None;
        self.open = false;
    }

    pub(crate) fn close(&mut self) {
        self.open = false;
    }

    pub(crate) fn suspend(&mut self) {
        self.armed_odd = None;
        self.in_flight = None;
        self.open = false;
        self.suspended = true;
    }

    /// Continue after the saved context came back under `handle`
    pub(crate) fn resume(&mut self, handle: u32) {
        self.handle = handle;
        self.suspended = false;
        self.open = true;
    }
}

/// A session bound to the entity it authorizes for one command
#[derive(Debug)]
pub struct SessionAuth<'a> {
    pub session: &'a mut AuthSession,
    pub entity_auth: &'a AuthValue,
    pub continue_session: bool,
}

impl<'a> SessionAuth<'a> {
    pub fn new(session: &'a mut AuthSession, entity_auth: &'a AuthValue) -> Self {
        Self {
            session,
            entity_auth,
            continue_session: true,
        }
    }

    /// Ask the TPM to close the session once this command completes
    pub fn last_use(mut self) -> Self {
        self.continue_session = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tpm_reply(
        key: &AuthValue,
        out_digest: &Digest,
        nonce_even: Digest,
        nonce_odd: &Digest,
        continue_session: bool,
    ) -> AuthResponse {
        AuthResponse {
            nonce_even,
            continue_session,
            auth: auth::session_hmac(key, out_digest, &nonce_even, nonce_odd, continue_session),
        }
    }

    #[test]
    fn test_oiap_round_trip_rolls_nonce() {
        let usage = AuthValue::from_password("key");
        let mut session = AuthSession::oiap(0x0200_0001, [1; 20]);
        let in_digest = auth::command_digest(TpmOrd::GetPubKey, &[]);
        let trailer = session.authorize(&usage, &in_digest, true).unwrap();
        assert!(auth::hmac_sha1_verify(
            &usage,
            &[&in_digest, &[1u8; 20], &trailer.nonce_odd, &[1]],
            &trailer.auth
        ));

        let out_digest = auth::response_digest(0, TpmOrd::GetPubKey, &[9, 9]);
        let reply = tpm_reply(&usage, &out_digest, [2; 20], &trailer.nonce_odd, true);
        session
            .verify(TpmOrd::GetPubKey, &usage, &out_digest, &reply)
            .unwrap();
        assert_eq!(session.nonce_even(), &[2; 20]);
        assert!(session.is_open());
    }

    #[test]
    fn test_verify_rejects_flipped_hmac() {
        let usage = AuthValue::from_password("key");
        let mut session = AuthSession::oiap(1, [1; 20]);
        let in_digest = auth::command_digest(TpmOrd::Sign, &[]);
        let trailer = session.authorize(&usage, &in_digest, true).unwrap();
        let out_digest = auth::response_digest(0, TpmOrd::Sign, &[]);
        let mut reply = tpm_reply(&usage, &out_digest, [2; 20], &trailer.nonce_odd, true);
        reply.auth[19] ^= 0x01;
        let err = session
            .verify(TpmOrd::Sign, &usage, &out_digest, &reply)
            .unwrap_err();
        assert!(matches!(err, Error::AuthValidation { .. }));
        assert!(!session.is_open());
        assert!(matches!(
            session.authorize(&usage, &in_digest, true),
            Err(Error::SessionClosed(1))
        ));
    }

    #[test]
    fn test_repeated_even_nonce_tears_down() {
        let usage = AuthValue::well_known();
        let mut session = AuthSession::oiap(1, [1; 20]);
        let in_digest = auth::command_digest(TpmOrd::Sign, &[]);
        let trailer = session.authorize(&usage, &in_digest, true).unwrap();
        let out_digest = auth::response_digest(0, TpmOrd::Sign, &[]);
        // the TPM hands back the setup nonce again
        let reply = tpm_reply(&usage, &out_digest, [1; 20], &trailer.nonce_odd, true);
        assert!(matches!(
            session.verify(TpmOrd::Sign, &usage, &out_digest, &reply),
            Err(Error::NonceReuse(1))
        ));
        assert!(!session.is_open());
    }

    #[test]
    fn test_osap_uses_shared_secret() {
        let owner = AuthValue::from_password("owner");
        let session = AuthSession::osap(
            7,
            [1; 20],
            TpmEntityType::Owner,
            crate::constants::tpm_kh::OWNER,
            &owner,
            &[2; 20],
            &[3; 20],
        );
        let expected = auth::hmac_sha1(&owner, &[&[2u8; 20], &[3u8; 20]]);
        assert_eq!(session.shared_secret().unwrap().as_bytes(), &expected);
    }

    #[test]
    fn test_osap_shared_secret_known_answer() {
        // HMAC-SHA1(SHA1("owner"), nonceEvenOSAP || nonceOddOSAP), computed
        // outside this crate
        let session = AuthSession::osap(
            7,
            [1; 20],
            TpmEntityType::Owner,
            crate::constants::tpm_kh::OWNER,
            &AuthValue::from_password("owner"),
            &[0x33; 20],
            &[0x44; 20],
        );
        assert_eq!(
            hex::encode(session.shared_secret().unwrap().as_bytes()),
            "8d6009e2c6ebd2a53a1c635536dba9c64b763e23"
        );
    }

    #[test]
    fn test_armed_nonce_is_reused_once() {
        let mut session = AuthSession::oiap(1, [1; 20]);
        let armed = session.next_nonce_odd().unwrap();
        assert_eq!(session.next_nonce_odd().unwrap(), armed);
        let trailer = session
            .authorize(&AuthValue::well_known(), &[0; 20], true)
            .unwrap();
        assert_eq!(trailer.nonce_odd, armed);
        assert_ne!(session.next_nonce_odd().unwrap(), armed);
    }

    #[test]
    fn test_continue_false_closes() {
        let usage = AuthValue::well_known();
        let mut session = AuthSession::oiap(1, [1; 20]);
        let trailer = session.authorize(&usage, &[0; 20], false).unwrap();
        let out_digest = auth::response_digest(0, TpmOrd::EvictKey, &[]);
        let reply = tpm_reply(&usage, &out_digest, [5; 20], &trailer.nonce_odd, false);
        session
            .verify(TpmOrd::EvictKey, &usage, &out_digest, &reply)
            .unwrap();
        assert!(!session.is_open());
    }

    #[test]
    fn test_suspend_and_resume() {
        let mut session = AuthSession::oiap(1, [1; 20]);
        session.next_nonce_odd().unwrap();
        session.suspend();
        assert!(session.is_suspended());
        assert!(matches!(session.next_nonce_odd(), Err(Error::SessionClosed(1))));

        session.resume(0x0200_0009);
        assert_eq!(session.handle(), 0x0200_0009);
        assert!(session.is_open());
        assert!(!session.is_suspended());
        assert_eq!(session.nonce_even(), &[1; 20]);
    }
}
