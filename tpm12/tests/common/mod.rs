// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! In-process TPM 1.2 model speaking the real wire format
//!
//! It checks every authorization trailer, rolls even nonces and signs its
//! responses, so the library under test cannot tell it from a TPM. "Wrapped"
//! keys carry their usage secret in `enc_data` in the clear.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tpm12::auth::{self, AuthValue};
use tpm12::*;

type MockResult<T> = std::result::Result<T, u32>;

fn bad<T>(r: tpm12::Result<T>) -> MockResult<T> {
    r.map_err(|_| tpm_rc::BAD_PARAMETER)
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tpm12=debug")
        .with_test_writer()
        .try_init();
}

/// Config with instant retries
pub fn config() -> TpmConfig {
    TpmConfig::default().with_retry(RetryPolicy {
        attempts: 7,
        delay: Duration::ZERO,
    })
}

pub fn context(tpm: &MockTpm) -> TpmContext {
    init_logging();
    TpmContext::with_transport(tpm.clone(), &config().with_wire_dump(true)).unwrap()
}

/// A signing key wrapped the way the model expects
pub fn wrapped_key(usage_auth: &AuthValue) -> KeyBlob {
    let mut key = KeyBlob::template(TpmKeyUsage::Signing, 2048, TpmKeyFlags::new());
    key.format = KeyFormat::Key12;
    key.pub_key = StorePubkey::new(auth::sha1(&[usage_auth.as_bytes()]).repeat(13)[..256].to_vec());
    key.enc_data = usage_auth.as_bytes().to_vec();
    key
}

#[derive(Clone)]
struct MockSession {
    nonce_even: Digest,
    shared: Option<AuthValue>,
}

struct MockCounter {
    auth: AuthValue,
    label: [u8; 4],
    value: u32,
}

#[derive(Clone)]
enum Saved {
    Key(KeyBlob),
    Session(MockSession),
}

struct AuthCtx {
    handle: u32,
    key: AuthValue,
    shared: Option<AuthValue>,
    nonce_even: Digest,
    nonce_odd: Digest,
    continue_session: bool,
}

#[derive(Default)]
struct Out {
    handles: Vec<u32>,
    params: CommandBuffer,
}

pub struct MockState {
    pub owner_auth: AuthValue,
    pub srk_auth: AuthValue,
    sessions: HashMap<u32, MockSession>,
    keys: BTreeMap<u32, KeyBlob>,
    saved_keys: HashMap<Vec<u8>, KeyBlob>,
    saved_sessions: HashMap<Vec<u8>, MockSession>,
    saved_contexts: HashMap<u32, Saved>,
    context_count: u32,
    counters: BTreeMap<u32, MockCounter>,
    next_counter: u32,
    pub pcrs: [Digest; 24],
    dir: Digest,
    audited: BTreeSet<u32>,
    audit_digest: Digest,
    audit_counter: u32,
    /// Ordinals listed per GetAuditDigest page
    pub audit_page_size: usize,
    next_handle: u32,
    /// Ordinal -> number of upcoming requests answered with TPM_RETRY
    pub retry_next: HashMap<u32, usize>,
    /// Flip a bit in the next response HMAC
    pub tamper_next: bool,
    /// Hand back the previous even nonce in the next response
    pub repeat_nonce_next: bool,
    /// Fail the next exchange as if the TPM never answered
    pub timeout_next: bool,
    /// Keep listing the first key after EvictKey
    pub sticky_keys: bool,
    pub reopens: usize,
    pub requests: Vec<Vec<u8>>,
    pending: Option<Vec<u8>>,
}

#[derive(Clone)]
pub struct MockTpm {
    inner: Arc<Mutex<MockState>>,
}

impl MockTpm {
    pub fn new() -> Self {
        let state = MockState {
            owner_auth: AuthValue::from_password("owner"),
            srk_auth: AuthValue::well_known(),
            sessions: HashMap::new(),
            keys: BTreeMap::new(),
            saved_keys: HashMap::new(),
            saved_sessions: HashMap::new(),
            saved_contexts: HashMap::new(),
            context_count: 1,
            counters: BTreeMap::new(),
            next_counter: 1,
            pcrs: [[0; 20]; 24],
            dir: [0; 20],
            audited: BTreeSet::new(),
            audit_digest: [0; 20],
            audit_counter: 1,
            audit_page_size: 4,
            next_handle: 1,
            retry_next: HashMap::new(),
            tamper_next: false,
            repeat_nonce_next: false,
            timeout_next: false,
            sticky_keys: false,
            reopens: 0,
            requests: Vec::new(),
            pending: None,
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap()
    }

    /// Number of requests seen for one ordinal
    pub fn requests_for(&self, ordinal: TpmOrd) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|r| r[6..10] == ordinal.to_u32().to_be_bytes())
            .count()
    }

    /// Odd nonces of every authorized request, in order
    pub fn odd_nonces(&self) -> Vec<Digest> {
        let state = self.state();
        let mut out = Vec::new();
        for req in &state.requests {
            let auths = match u16::from_be_bytes([req[0], req[1]]) {
                0xC2 => 1,
                0xC3 => 2,
                _ => 0,
            };
            for i in 0..auths {
                let start = req.len() - (auths - i) * AUTH_COMMAND_SIZE + 4;
                out.push(req[start..start + 20].try_into().unwrap());
            }
        }
        out
    }

    pub fn define_audit(&self, ordinals: &[u32]) {
        self.state().audited.extend(ordinals.iter().copied());
    }
}

impl Transport for MockTpm {
    fn send(&mut self, command: &[u8]) -> tpm12::Result<()> {
        let mut state = self.state();
        if state.timeout_next {
            state.timeout_next = false;
            return Err(Error::Timeout(Duration::from_secs(1)));
        }
        state.requests.push(command.to_vec());
        let response = state.process(command);
        state.pending = Some(response);
        Ok(())
    }

    fn receive(&mut self) -> tpm12::Result<Vec<u8>> {
        self.state().pending.take().ok_or_else(|| Error::Transport {
            context: "reading response".into(),
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "nothing pending"),
        })
    }

    fn reopen(&mut self) -> tpm12::Result<()> {
        self.state().reopens += 1;
        Ok(())
    }

    fn endpoint(&self) -> String {
        "mock".into()
    }
}

fn handle_count(ordinal: TpmOrd) -> usize {
    use TpmOrd::*;
    match ordinal {
        LoadKey | LoadKey2 | GetPubKey | EvictKey | CreateWrapKey | Sign | SaveKeyContext
        | SaveAuthContext | SaveContext | FlushSpecific | GetAuditDigestSigned => 1,
        _ => 0,
    }
}

fn error_response(code: u32) -> Vec<u8> {
    let mut out = vec![0x00, 0xC4, 0, 0, 0, 10];
    out.extend_from_slice(&code.to_be_bytes());
    out
}

impl MockState {
    fn alloc(&mut self, base: u32) -> u32 {
        self.next_handle += 1;
        base + self.next_handle
    }

    fn key_auth(&self, handle: u32) -> MockResult<AuthValue> {
        if handle == tpm_kh::SRK {
            return Ok(self.srk_auth.clone());
        }
        let key = self.keys.get(&handle).ok_or(tpm_rc::INVALID_KEYHANDLE)?;
        AuthValue::from_slice(&key.enc_data).map_err(|_| tpm_rc::DECRYPT_ERROR)
    }

    fn counter_auth(&self, id: u32) -> MockResult<AuthValue> {
        self.counters
            .get(&id)
            .map(|c| c.auth.clone())
            .ok_or(tpm_rc::BAD_COUNTER)
    }

    /// The secret an OIAP session proves knowledge of
    fn entity_auth(
        &self,
        ordinal: TpmOrd,
        handles: &[u32],
        params: &[u8],
    ) -> MockResult<AuthValue> {
        use TpmOrd::*;
        match ordinal {
            LoadKey | LoadKey2 | GetPubKey | Sign | CreateWrapKey | GetAuditDigestSigned => {
                self.key_auth(handles[0])
            }
            IncrementCounter | ReleaseCounter => {
                let id = bad(ResponseBuffer::new(params).get_u32())?;
                self.counter_auth(id)
            }
            _ => Ok(self.owner_auth.clone()),
        }
    }

    fn process(&mut self, cmd: &[u8]) -> Vec<u8> {
        match self.try_process(cmd) {
            Ok(response) => response,
            Err(code) => error_response(code),
        }
    }

    fn try_process(&mut self, cmd: &[u8]) -> MockResult<Vec<u8>> {
        if cmd.len() < HEADER_SIZE {
            return Err(tpm_rc::BAD_PARAM_SIZE);
        }
        let mut header = ResponseBuffer::new(cmd);
        let tag = bad(header.get_u16())?;
        let size = bad(header.get_u32())? as usize;
        let ordinal_raw = bad(header.get_u32())?;
        if size != cmd.len() {
            return Err(tpm_rc::BAD_PARAM_SIZE);
        }
        let ordinal = TpmOrd::from_u32(ordinal_raw).ok_or(tpm_rc::BAD_ORDINAL)?;
        let auth_count = match tag {
            0xC1 => 0,
            0xC2 => 1,
            0xC3 => 2,
            _ => return Err(tpm_rc::BADTAG),
        };

        let body = &cmd[HEADER_SIZE..];
        let nh = handle_count(ordinal);
        let trailer_len = auth_count * AUTH_COMMAND_SIZE;
        if body.len() < nh * 4 + trailer_len {
            return Err(tpm_rc::BAD_PARAM_SIZE);
        }
        let handles: Vec<u32> = body[..nh * 4]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let params = &body[nh * 4..body.len() - trailer_len];
        let trailers = body[body.len() - trailer_len..]
            .chunks_exact(AUTH_COMMAND_SIZE)
            .map(|c| bad(AuthCommand::from_bytes(c)))
            .collect::<MockResult<Vec<_>>>()?;

        let result = self.respond(ordinal, &handles, params, &trailers);
        if result.is_err() {
            // an error answer ends every session the command named
            for t in &trailers {
                self.sessions.remove(&t.handle);
            }
        }
        result
    }

    fn respond(
        &mut self,
        ordinal: TpmOrd,
        handles: &[u32],
        params: &[u8],
        trailers: &[AuthCommand],
    ) -> MockResult<Vec<u8>> {
        if let Some(remaining) = self.retry_next.get_mut(&ordinal.to_u32()) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(tpm_rc::RETRY);
            }
        }

        let in_digest = auth::command_digest(ordinal, params);
        let mut auths = Vec::new();
        for t in trailers {
            let session = self
                .sessions
                .get(&t.handle)
                .cloned()
                .ok_or(tpm_rc::INVALID_AUTHHANDLE)?;
            let key = match &session.shared {
                Some(shared) => shared.clone(),
                None => self.entity_auth(ordinal, handles, params)?,
            };
            let expected = auth::session_hmac(
                &key,
                &in_digest,
                &session.nonce_even,
                &t.nonce_odd,
                t.continue_session,
            );
            if expected != t.auth {
                return Err(tpm_rc::AUTHFAIL);
            }
            auths.push(AuthCtx {
                handle: t.handle,
                key,
                shared: session.shared.clone(),
                nonce_even: session.nonce_even,
                nonce_odd: t.nonce_odd,
                continue_session: t.continue_session,
            });
        }

        let out = self.dispatch(ordinal, handles, params, &auths)?;

        let mut response = CommandBuffer::new();
        response.put_u16(0x00C4 + auths.len() as u16);
        response.put_u32(0);
        response.put_u32(tpm_rc::SUCCESS);
        for &h in &out.handles {
            response.put_u32(h);
        }
        response.put_bytes(out.params.as_bytes());

        let digested = if ordinal == TpmOrd::LoadKey {
            response.as_bytes()[HEADER_SIZE..].to_vec()
        } else {
            out.params.as_bytes().to_vec()
        };
        let out_digest = auth::response_digest(tpm_rc::SUCCESS, ordinal, &digested);
        for a in &auths {
            let nonce_even = if self.repeat_nonce_next {
                a.nonce_even
            } else {
                auth::random_nonce()
            };
            let mut hmac = auth::session_hmac(
                &a.key,
                &out_digest,
                &nonce_even,
                &a.nonce_odd,
                a.continue_session,
            );
            if self.tamper_next {
                hmac[7] ^= 0x10;
            }
            response.put_bytes(&nonce_even);
            response.put_bool(a.continue_session);
            response.put_bytes(&hmac);
            if !a.continue_session {
                self.sessions.remove(&a.handle);
            } else if let Some(session) = self.sessions.get_mut(&a.handle) {
                session.nonce_even = nonce_even;
            }
        }
        self.tamper_next = false;
        self.repeat_nonce_next = false;

        let len = response.len() as u32;
        response.update_u32(2, len);
        Ok(response.into_vec())
    }

    fn dispatch(
        &mut self,
        ordinal: TpmOrd,
        handles: &[u32],
        params: &[u8],
        auths: &[AuthCtx],
    ) -> MockResult<Out> {
        let mut rd = ResponseBuffer::new(params);
        let mut out = Out::default();
        match ordinal {
            TpmOrd::Oiap => {
                let handle = self.alloc(0x0200_0000);
                let nonce_even = auth::random_nonce();
                self.sessions.insert(
                    handle,
                    MockSession {
                        nonce_even,
                        shared: None,
                    },
                );
                out.params.put_u32(handle);
                out.params.put_bytes(&nonce_even);
            }
            TpmOrd::Osap => {
                let entity_type = bad(rd.get_u16())?;
                let entity_value = bad(rd.get_u32())?;
                let nonce_odd_osap = bad(rd.get_digest())?;
                let entity_auth = match entity_type {
                    0x0002 => self.owner_auth.clone(),
                    0x0001 | 0x0004 | 0x0005 => self.key_auth(entity_value)?,
                    0x000A => self.counter_auth(entity_value)?,
                    _ => return Err(tpm_rc::WRONG_ENTITYTYPE),
                };
                let nonce_even_osap = auth::random_nonce();
                let shared = auth::hmac_sha1(&entity_auth, &[&nonce_even_osap, &nonce_odd_osap]);
                let handle = self.alloc(0x0200_0000);
                let nonce_even = auth::random_nonce();
                self.sessions.insert(
                    handle,
                    MockSession {
                        nonce_even,
                        shared: Some(AuthValue::from_raw(shared)),
                    },
                );
                out.params.put_u32(handle);
                out.params.put_bytes(&nonce_even);
                out.params.put_bytes(&nonce_even_osap);
            }
            TpmOrd::TerminateHandle => {
                let handle = bad(rd.get_u32())?;
                self.sessions
                    .remove(&handle)
                    .ok_or(tpm_rc::INVALID_AUTHHANDLE)?;
            }
            TpmOrd::FlushSpecific => {
                let resource = bad(rd.get_u32())?;
                let found = match resource {
                    1 => self.keys.remove(&handles[0]).is_some(),
                    2 => self.sessions.remove(&handles[0]).is_some(),
                    _ => return Err(tpm_rc::INVALID_RESOURCE),
                };
                if !found {
                    return Err(tpm_rc::BAD_HANDLE);
                }
            }
            TpmOrd::LoadKey | TpmOrd::LoadKey2 => {
                if handles[0] != tpm_kh::SRK && !self.keys.contains_key(&handles[0]) {
                    return Err(tpm_rc::INVALID_KEYHANDLE);
                }
                let key = bad(KeyBlob::unmarshal(&mut rd))?;
                let handle = self.alloc(0x0100_0000);
                self.keys.insert(handle, key);
                out.handles.push(handle);
            }
            TpmOrd::EvictKey => {
                if self.sticky_keys {
                    return Ok(out);
                }
                self.keys
                    .remove(&handles[0])
                    .ok_or(tpm_rc::INVALID_KEYHANDLE)?;
            }
            TpmOrd::GetPubKey => {
                let key = self.keys.get(&handles[0]).ok_or(tpm_rc::INVALID_KEYHANDLE)?;
                bad(key.pubkey().marshal(&mut out.params))?;
            }
            TpmOrd::CreateWrapKey => {
                let a = auths.first().ok_or(tpm_rc::AUTHFAIL)?;
                let shared = a.shared.as_ref().ok_or(tpm_rc::AUTHFAIL)?;
                let enc_usage = bad(rd.get_digest())?;
                let _enc_migration = bad(rd.get_digest())?;
                let mut key = bad(KeyBlob::unmarshal(&mut rd))?;
                let usage =
                    auth::encrypt_auth(shared, &a.nonce_even, &AuthValue::from_raw(enc_usage));
                let modulus_len = key
                    .algorithm_parms
                    .rsa_parms()
                    .map(|p| p.key_length as usize / 8)
                    .unwrap_or(256);
                key.pub_key = StorePubkey::new(
                    auth::random_nonce().repeat(modulus_len / 20 + 1)[..modulus_len].to_vec(),
                );
                key.enc_data = usage.to_vec();
                bad(key.marshal(&mut out.params))?;
            }
            TpmOrd::Sign => {
                let data = bad(rd.get_sized())?;
                let key = self.keys.get(&handles[0]).ok_or(tpm_rc::INVALID_KEYHANDLE)?;
                let sig = auth::sha1(&[&key.pub_key.key, &data]);
                bad(out.params.put_sized(&sig))?;
            }
            TpmOrd::SaveKeyContext => {
                let key = self
                    .keys
                    .get(&handles[0])
                    .cloned()
                    .ok_or(tpm_rc::INVALID_KEYHANDLE)?;
                let blob = self.next_blob(b"keyctx");
                self.saved_keys.insert(blob.clone(), key);
                bad(out.params.put_sized(&blob))?;
            }
            TpmOrd::LoadKeyContext => {
                let blob = bad(rd.get_sized())?;
                let key = self
                    .saved_keys
                    .get(&blob)
                    .cloned()
                    .ok_or(tpm_rc::BADCONTEXT)?;
                let handle = self.alloc(0x0100_0000);
                self.keys.insert(handle, key);
                out.handles.push(handle);
            }
            TpmOrd::SaveAuthContext => {
                let session = self
                    .sessions
                    .remove(&handles[0])
                    .ok_or(tpm_rc::INVALID_AUTHHANDLE)?;
                let blob = self.next_blob(b"authctx");
                self.saved_sessions.insert(blob.clone(), session);
                bad(out.params.put_sized(&blob))?;
            }
            TpmOrd::LoadAuthContext => {
                let blob = bad(rd.get_sized())?;
                let session = self
                    .saved_sessions
                    .remove(&blob)
                    .ok_or(tpm_rc::BADCONTEXT)?;
                let handle = self.alloc(0x0200_0000);
                self.sessions.insert(handle, session);
                out.handles.push(handle);
            }
            TpmOrd::SaveContext => {
                let resource_type = bad(rd.get_u32())?;
                let label = bad(rd.get_array::<16>())?;
                let saved = match resource_type {
                    1 => Saved::Key(
                        self.keys
                            .get(&handles[0])
                            .cloned()
                            .ok_or(tpm_rc::INVALID_KEYHANDLE)?,
                    ),
                    2 => Saved::Session(
                        self.sessions
                            .remove(&handles[0])
                            .ok_or(tpm_rc::INVALID_AUTHHANDLE)?,
                    ),
                    _ => return Err(tpm_rc::INVALID_RESOURCE),
                };
                let context_count = self.context_count;
                self.context_count += 1;
                self.saved_contexts.insert(context_count, saved);
                let blob = ContextBlob {
                    resource_type,
                    handle: handles[0],
                    label,
                    context_count,
                    integrity_digest: auth::sha1(&[&context_count.to_be_bytes()]),
                    additional_data: Vec::new(),
                    sensitive_data: vec![0xA5; 64],
                };
                bad(out.params.put_sized(&bad(blob.to_bytes())?))?;
            }
            TpmOrd::LoadContext => {
                let hint = bad(rd.get_u32())?;
                let keep_handle = bad(rd.get_bool())?;
                let raw = bad(rd.get_sized())?;
                let blob = bad(ContextBlob::from_bytes(&raw))?;
                let saved = self
                    .saved_contexts
                    .get(&blob.context_count)
                    .cloned()
                    .ok_or(tpm_rc::BADCONTEXT)?;
                if matches!(saved, Saved::Session(_)) {
                    self.saved_contexts.remove(&blob.context_count);
                }
                let handle = match saved {
                    Saved::Key(key) => {
                        let handle = if keep_handle && !self.keys.contains_key(&hint) {
                            hint
                        } else {
                            self.alloc(0x0100_0000)
                        };
                        self.keys.insert(handle, key);
                        handle
                    }
                    Saved::Session(session) => {
                        let handle = self.alloc(0x0200_0000);
                        self.sessions.insert(handle, session);
                        handle
                    }
                };
                out.handles.push(handle);
            }
            TpmOrd::CreateCounter => {
                let a = auths.first().ok_or(tpm_rc::AUTHFAIL)?;
                let shared = a.shared.as_ref().ok_or(tpm_rc::AUTHFAIL)?;
                let enc_auth = bad(rd.get_digest())?;
                let label = bad(rd.get_array::<4>())?;
                let counter_auth =
                    auth::encrypt_auth(shared, &a.nonce_even, &AuthValue::from_raw(enc_auth));
                let id = self.next_counter;
                self.next_counter += 1;
                self.counters.insert(
                    id,
                    MockCounter {
                        auth: AuthValue::from_raw(counter_auth),
                        label,
                        value: 1,
                    },
                );
                out.params.put_u32(id);
                bad(CounterValue { label, counter: 1 }.marshal(&mut out.params))?;
            }
            TpmOrd::IncrementCounter | TpmOrd::ReadCounter => {
                let id = bad(rd.get_u32())?;
                let counter = self.counters.get_mut(&id).ok_or(tpm_rc::BAD_COUNTER)?;
                if ordinal == TpmOrd::IncrementCounter {
                    counter.value += 1;
                }
                let value = CounterValue {
                    label: counter.label,
                    counter: counter.value,
                };
                bad(value.marshal(&mut out.params))?;
            }
            TpmOrd::ReleaseCounter | TpmOrd::ReleaseCounterOwner => {
                let id = bad(rd.get_u32())?;
                self.counters.remove(&id).ok_or(tpm_rc::BAD_COUNTER)?;
            }
            TpmOrd::Extend => {
                let pcr = bad(rd.get_u32())? as usize;
                let digest = bad(rd.get_digest())?;
                let slot = self.pcrs.get_mut(pcr).ok_or(tpm_rc::BADINDEX)?;
                *slot = auth::sha1(&[&slot[..], &digest]);
                out.params.put_bytes(&slot[..]);
            }
            TpmOrd::PcrRead => {
                let pcr = bad(rd.get_u32())? as usize;
                let value = self.pcrs.get(pcr).ok_or(tpm_rc::BADINDEX)?;
                out.params.put_bytes(value);
            }
            TpmOrd::PcrReset => {
                let selection = bad(PcrSelection::unmarshal(&mut rd))?;
                for pcr in selection.indices() {
                    if !(16..24).contains(&pcr) {
                        return Err(tpm_rc::NOTRESETABLE);
                    }
                }
                for pcr in selection.indices() {
                    self.pcrs[pcr as usize] = [0; 20];
                }
            }
            TpmOrd::DirWriteAuth => {
                if bad(rd.get_u32())? != 0 {
                    return Err(tpm_rc::BADINDEX);
                }
                self.dir = bad(rd.get_digest())?;
            }
            TpmOrd::DirRead => {
                if bad(rd.get_u32())? != 0 {
                    return Err(tpm_rc::BADINDEX);
                }
                out.params.put_bytes(&self.dir);
            }
            TpmOrd::Startup => {
                bad(rd.get_u16())?;
            }
            TpmOrd::SelfTestFull | TpmOrd::ContinueSelfTest => {}
            TpmOrd::GetTestResult => {
                bad(out.params.put_sized(&[0, 0, 0, 0]))?;
            }
            TpmOrd::GetRandom => {
                // hand out at most 16 bytes per call
                let want = (bad(rd.get_u32())? as usize).min(16);
                let nonce = auth::random_nonce();
                bad(out.params.put_sized(&nonce[..want]))?;
            }
            TpmOrd::StirRandom => {
                bad(rd.get_sized())?;
            }
            TpmOrd::GetCapability => {
                let cap = bad(rd.get_u32())?;
                let sub = bad(rd.get_sized())?;
                let keys: Vec<u32> = self.keys.keys().copied().collect();
                let resp = match cap {
                    0x07 => bad(HandleList { handles: keys }.to_bytes())?,
                    0x14 => {
                        let resource = bad(u32::from_bytes(&sub))?;
                        let handles = match resource {
                            1 => keys,
                            2 => self.sessions.keys().copied().collect(),
                            _ => Vec::new(),
                        };
                        bad(HandleList { handles }.to_bytes())?
                    }
                    0x05 => match bad(u32::from_bytes(&sub))? {
                        tpm_cap_prop::PCR => 24u32.to_be_bytes().to_vec(),
                        tpm_cap_prop::KEYS => (10 - self.keys.len() as u32).to_be_bytes().to_vec(),
                        _ => return Err(tpm_rc::BAD_MODE),
                    },
                    _ => return Err(tpm_rc::BAD_MODE),
                };
                bad(out.params.put_sized(&resp))?;
            }
            TpmOrd::GetAuditDigest => {
                let start = bad(rd.get_u32())?;
                let listed: Vec<u32> = self.audited.range(start..).copied().collect();
                let page = &listed[..listed.len().min(self.audit_page_size)];
                self.put_audit_head(&mut out)?;
                out.params.put_bytes(&self.audit_digest);
                out.params.put_bool(listed.len() > page.len());
                let bytes: Vec<u8> = page.iter().flat_map(|o| o.to_be_bytes()).collect();
                bad(out.params.put_sized(&bytes))?;
            }
            TpmOrd::GetAuditDigestSigned => {
                let _close_audit = bad(rd.get_bool())?;
                let anti_replay = bad(rd.get_digest())?;
                if !self.keys.contains_key(&handles[0]) {
                    return Err(tpm_rc::INVALID_KEYHANDLE);
                }
                let list: Vec<u8> = self.audited.iter().flat_map(|o| o.to_be_bytes()).collect();
                self.put_audit_head(&mut out)?;
                out.params.put_bytes(&self.audit_digest);
                out.params.put_bytes(&auth::sha1(&[&list]));
                bad(out
                    .params
                    .put_sized(&auth::sha1(&[&anti_replay, &self.audit_digest])))?;
            }
            TpmOrd::SetOrdinalAuditStatus => {
                let target = bad(rd.get_u32())?;
                if bad(rd.get_bool())? {
                    self.audited.insert(target);
                } else {
                    self.audited.remove(&target);
                }
                self.audit_digest = auth::sha1(&[&self.audit_digest, &target.to_be_bytes()]);
            }
        }
        rd.finish().map_err(|_| tpm_rc::BAD_PARAM_SIZE)?;
        Ok(out)
    }

    fn put_audit_head(&self, out: &mut Out) -> MockResult<()> {
        bad(CounterValue {
            label: *b"AUDT",
            counter: self.audit_counter,
        }
        .marshal(&mut out.params))
    }

    fn next_blob(&mut self, kind: &[u8]) -> Vec<u8> {
        let mut blob = kind.to_vec();
        blob.extend_from_slice(&self.context_count.to_be_bytes());
        blob.extend_from_slice(&[0x5A; 300]);
        self.context_count += 1;
        blob
    }
}
