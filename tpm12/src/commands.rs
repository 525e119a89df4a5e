// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 command implementations
//!
//! Every ordinal goes through one dispatcher that builds the command,
//! authorizes it, exchanges it with the TPM, validates the response
//! authorization and hands the output parameters back for decoding.

use std::sync::{Mutex, MutexGuard};
use std::thread;

use tracing::{debug, warn};

use super::auth::{self, AuthValue};
use super::config::{RetryPolicy, TpmConfig};
use super::constants::*;
use super::device::*;
use super::error::{Error, Result};
use super::marshal::*;
use super::session::*;
use super::state::ResourceState;
use super::transport::{self, Transport};

mod audit;
mod contexts;
mod counters;
mod integrity;
mod keys;
mod maintenance;

pub use audit::{AuditDigest, SignedAuditDigest};

/// Authorization sessions an ordinal accepts, as (min, max)
fn session_rule(ordinal: TpmOrd) -> (usize, usize) {
    use TpmOrd::*;
    match ordinal {
        Oiap | Osap | TerminateHandle | FlushSpecific | EvictKey | PcrRead | DirRead
        | Extend | PcrReset | ReadCounter | GetRandom | StirRandom | SelfTestFull
        | ContinueSelfTest | GetTestResult | GetCapability | GetAuditDigest
        | Startup | SaveKeyContext | LoadKeyContext | SaveAuthContext
        | LoadAuthContext | SaveContext | LoadContext => (0, 0),
        LoadKey | LoadKey2 | GetPubKey | Sign | GetAuditDigestSigned => (0, 1),
        CreateWrapKey | IncrementCounter | CreateCounter | ReleaseCounter
        | ReleaseCounterOwner | DirWriteAuth | SetOrdinalAuditStatus => (1, 1),
    }
}

/// One command ready for dispatch
#[derive(Debug, Clone)]
pub(crate) struct Request {
    ordinal: TpmOrd,
    /// Input handles; not part of inParamDigest
    handles: Vec<u32>,
    params: CommandBuffer,
    /// New auth value sent ADIP-encrypted ahead of `params`, re-encrypted
    /// for whichever session carries each attempt
    new_auth: Option<AuthValue>,
    /// Output handles preceding the output parameters
    out_handles: usize,
    /// Whether the output handles are hashed into outParamDigest
    out_handles_in_digest: bool,
}

impl Request {
    pub(crate) fn new(ordinal: TpmOrd) -> Self {
        Self {
            ordinal,
            handles: Vec::new(),
            params: CommandBuffer::new(),
            new_auth: None,
            out_handles: 0,
            out_handles_in_digest: false,
        }
    }

    pub(crate) fn handle(mut self, handle: u32) -> Self {
        self.handles.push(handle);
        self
    }

    pub(crate) fn params(mut self, params: CommandBuffer) -> Self {
        self.params = params;
        self
    }

    pub(crate) fn encrypted_auth(mut self, new_auth: &AuthValue) -> Self {
        self.new_auth = Some(new_auth.clone());
        self
    }

    pub(crate) fn out_handles(mut self, count: usize, in_digest: bool) -> Self {
        self.out_handles = count;
        self.out_handles_in_digest = in_digest;
        self
    }
}

/// Decoded-ready output of a successful command
#[derive(Debug)]
pub(crate) struct Reply {
    pub handles: Vec<u32>,
    pub params: Vec<u8>,
}

impl Reply {
    pub(crate) fn handle(&self) -> Result<u32> {
        self.handles
            .first()
            .copied()
            .ok_or_else(|| Error::MalformedResponse("missing output handle".into()))
    }

    pub(crate) fn reader(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.params)
    }
}

/// View an optional session as a slice of zero or one
pub(crate) fn optional<'s, 'a>(auth: &'s mut Option<SessionAuth<'a>>) -> &'s mut [SessionAuth<'a>] {
    match auth {
        Some(a) => std::slice::from_mut(a),
        None => &mut [],
    }
}

/// TPM 1.2 context
///
/// Commands take `&self`; exchanges with the TPM are serialized internally,
/// one request in flight at a time.
pub struct TpmContext {
    device: Mutex<TpmDevice>,
    state: Mutex<ResourceState>,
    retry: RetryPolicy,
}

impl TpmContext {
    /// Connect to the TPM described by `config`
    pub fn new(config: TpmConfig) -> Result<Self> {
        config.validate()?;
        let transport = transport::open(&config)?;
        Self::from_parts(transport, &config)
    }

    /// Use a caller-provided transport, e.g. an in-process TPM model
    pub fn with_transport(transport: impl Transport + 'static, config: &TpmConfig) -> Result<Self> {
        config.validate()?;
        Self::from_parts(Box::new(transport), config)
    }

    fn from_parts(transport: Box<dyn Transport>, config: &TpmConfig) -> Result<Self> {
        let device = TpmDevice::new(transport, config.log.dump_wire);
        debug!("using TPM at {}", device.endpoint());
        Ok(Self {
            device: Mutex::new(device),
            state: Mutex::new(ResourceState::default()),
            retry: config.retry,
        })
    }

    /// Get the endpoint description
    pub fn endpoint(&self) -> String {
        self.device().endpoint()
    }

    /// Snapshot of the tracked sessions, keys and audit state
    pub fn resources(&self) -> ResourceState {
        self.state().clone()
    }

    fn device(&self) -> MutexGuard<'_, TpmDevice> {
        self.device.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ResourceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a command, retrying `TPM_RETRY` for the ordinals that allow it
    pub(crate) fn execute(&self, req: Request, auths: &mut [SessionAuth<'_>]) -> Result<Reply> {
        let (min, max) = session_rule(req.ordinal);
        if auths.len() < min || auths.len() > max {
            return Err(Error::Encoding(format!(
                "{:?} takes {min}..={max} authorization sessions, {} given",
                req.ordinal,
                auths.len()
            )));
        }

        let attempts = if req.ordinal.is_retryable() {
            self.retry.attempts
        } else {
            1
        };
        let mut attempt = 1;
        let result = loop {
            match self.execute_once(&req, auths) {
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(
                        "{:?}: TPM busy, retrying in {:?} (attempt {attempt}/{attempts})",
                        req.ordinal, self.retry.delay
                    );
                    attempt += 1;
                    thread::sleep(self.retry.delay);
                    if let Err(err) = self.replace_sessions(auths) {
                        break Err(err);
                    }
                }
                other => break other,
            }
        };

        let mut state = self.state();
        for a in auths.iter() {
            if !a.session.is_open() {
                state.session_closed(a.session.handle());
            }
        }
        result
    }

    /// The TPM ended the sessions of the failed attempt; open new ones of the
    /// same kind in their place
    fn replace_sessions(&self, auths: &mut [SessionAuth<'_>]) -> Result<()> {
        for a in auths.iter_mut() {
            let old = a.session.handle();
            self.state().session_closed(old);
            let fresh = match a.session.kind().clone() {
                SessionKind::Oiap => self.oiap()?,
                SessionKind::Osap {
                    entity_type,
                    entity_value,
                } => self.osap(entity_type, entity_value, a.entity_auth)?,
            };
            debug!(
                "session 0x{old:08x} replaced by 0x{:08x} for retry",
                fresh.handle()
            );
            *a.session = fresh;
        }
        Ok(())
    }

    /// BUILD -> AUTHORIZE -> SEND -> RECEIVE -> VALIDATE
    fn execute_once(&self, req: &Request, auths: &mut [SessionAuth<'_>]) -> Result<Reply> {
        let ordinal = req.ordinal;
        let encrypted;
        let params = match &req.new_auth {
            Some(new_auth) => {
                encrypted = adip_params(new_auth, auths, req.params.as_bytes())?;
                encrypted.as_slice()
            }
            None => req.params.as_bytes(),
        };

        let mut cmd = TpmCommand::new(ordinal);
        for &handle in &req.handles {
            cmd.add_handle(handle);
        }
        cmd.add_bytes(params);

        if !auths.is_empty() {
            let in_digest = auth::command_digest(ordinal, params);
            for a in auths.iter_mut() {
                let trailer = a
                    .session
                    .authorize(a.entity_auth, &in_digest, a.continue_session)?;
                cmd.add_auth(&trailer)?;
            }
        }
        let command = cmd.finalize()?;
        debug!(
            "{ordinal:?}: {} bytes, {} auth sessions",
            command.len(),
            auths.len()
        );

        let response = self.device().execute(&command);
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                abort_all(auths);
                return Err(err);
            }
        };

        if !response.is_success() {
            let err = Error::Protocol {
                ordinal,
                code: response.return_code,
            };
            if response.return_code & tpm_rc::NON_FATAL != 0 {
                warn!("{err}");
            } else {
                debug!("{err}");
            }
            abort_all(auths);
            return Err(err);
        }

        let validated = validate(req, &response, auths);
        if validated.is_err() {
            abort_all(auths);
        }
        validated
    }

    // ==================== Session Operations ====================

    /// Open an OIAP session
    pub fn oiap(&self) -> Result<AuthSession> {
        let reply = self.execute(Request::new(TpmOrd::Oiap), &mut [])?;
        let mut rd = reply.reader();
        let handle = rd.get_u32()?;
        let nonce_even = rd.get_digest()?;
        rd.finish()?;

        let session = AuthSession::oiap(handle, nonce_even);
        self.state().session_opened(handle, session.kind().clone());
        Ok(session)
    }

    /// Open an OSAP session bound to one entity
    pub fn osap(
        &self,
        entity_type: TpmEntityType,
        entity_value: u32,
        entity_auth: &AuthValue,
    ) -> Result<AuthSession> {
        let nonce_odd_osap = auth::random_nonce();
        let mut params = CommandBuffer::new();
        params.put_u16(entity_type.to_u16());
        params.put_u32(entity_value);
        params.put_bytes(&nonce_odd_osap);

        let reply = self.execute(Request::new(TpmOrd::Osap).params(params), &mut [])?;
        let mut rd = reply.reader();
        let handle = rd.get_u32()?;
        let nonce_even = rd.get_digest()?;
        let nonce_even_osap = rd.get_digest()?;
        rd.finish()?;

        let session = AuthSession::osap(
            handle,
            nonce_even,
            entity_type,
            entity_value,
            entity_auth,
            &nonce_even_osap,
            &nonce_odd_osap,
        );
        self.state().session_opened(handle, session.kind().clone());
        Ok(session)
    }

    /// Close a session on the TPM
    pub fn terminate_handle(&self, mut session: AuthSession) -> Result<()> {
        let handle = session.handle();
        session.close();
        self.state().session_closed(handle);
        let mut params = CommandBuffer::new();
        params.put_u32(handle);
        self.execute(Request::new(TpmOrd::TerminateHandle).params(params), &mut [])?;
        Ok(())
    }

    /// Flush any resource from the TPM
    pub fn flush_specific(&self, handle: u32, resource_type: TpmResourceType) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_u32(resource_type.to_u32());
        self.execute(
            Request::new(TpmOrd::FlushSpecific)
                .handle(handle)
                .params(params),
            &mut [],
        )?;

        let mut state = self.state();
        match resource_type {
            TpmResourceType::Key => state.key_evicted(handle),
            TpmResourceType::Auth | TpmResourceType::Trans => state.session_closed(handle),
            _ => {}
        }
        Ok(())
    }
}

fn abort_all(auths: &mut [SessionAuth<'_>]) {
    for a in auths.iter_mut() {
        a.session.abort();
    }
}

/// ADIP: `new_auth` encrypted under the first session's shared secret and
/// current even nonce, followed by the remaining parameters
fn adip_params(new_auth: &AuthValue, auths: &[SessionAuth<'_>], rest: &[u8]) -> Result<Vec<u8>> {
    let session = auths
        .first()
        .map(|a| &*a.session)
        .ok_or_else(|| Error::Encoding("an encrypted auth value needs an OSAP session".into()))?;
    let shared = session
        .shared_secret()
        .ok_or_else(|| Error::Encoding("OSAP session has no shared secret".into()))?;
    let mut params = CommandBuffer::with_capacity(DIGEST_SIZE + rest.len());
    params.put_bytes(&auth::encrypt_auth(shared, session.nonce_even(), new_auth));
    params.put_bytes(rest);
    Ok(params.into_vec())
}

/// VALIDATE: split trailers, check each HMAC over outParamDigest
fn validate(req: &Request, response: &TpmResponse, auths: &mut [SessionAuth<'_>]) -> Result<Reply> {
    let (body, trailers) = response.split_auth(auths.len())?;
    let mut rd = ResponseBuffer::new(body);
    let handles = (0..req.out_handles)
        .map(|_| rd.get_u32())
        .collect::<Result<Vec<_>>>()?;
    let params = rd.get_remaining();

    if !auths.is_empty() {
        let digested = if req.out_handles_in_digest {
            body
        } else {
            &params[..]
        };
        let out_digest = auth::response_digest(response.return_code, req.ordinal, digested);
        for (a, trailer) in auths.iter_mut().zip(&trailers) {
            a.session
                .verify(req.ordinal, a.entity_auth, &out_digest, trailer)?;
        }
    }
    Ok(Reply { handles, params })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_ordinal_declares_sessions() {
        for ord in TpmOrd::ALL {
            let (min, max) = session_rule(ord);
            assert!(min <= max && max <= 2, "{ord:?}");
        }
        assert_eq!(session_rule(TpmOrd::IncrementCounter), (1, 1));
        assert_eq!(session_rule(TpmOrd::GetAuditDigest), (0, 0));
    }

    #[test]
    fn test_optional_slice() {
        let mut none: Option<SessionAuth<'_>> = None;
        assert!(optional(&mut none).is_empty());
    }
}
