// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Authorization primitives shared by OIAP and OSAP sessions
//!
//! Every authorization value handed to the library is a 20-byte secret.
//! Passwords are converted here and nowhere else.

use std::fmt;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest as _, Sha1};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{TpmOrd, DIGEST_SIZE};
use crate::error::{Error, Result};
use crate::marshal::Digest;

type HmacSha1 = Hmac<Sha1>;

/// A 20-byte authorization secret (usage auth, owner auth, OSAP shared secret)
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AuthValue([u8; DIGEST_SIZE]);

impl AuthValue {
    /// SHA-1 of the UTF-8 password, the TPM 1.x convention
    pub fn from_password(password: &str) -> Self {
        Self(sha1(&[password.as_bytes()]))
    }

    pub fn from_raw(raw: [u8; DIGEST_SIZE]) -> Self {
        Self(raw)
    }

    /// Use a raw 20-byte blob (e.g. read from an auth file) as the secret
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let raw: [u8; DIGEST_SIZE] = raw.try_into().map_err(|_| {
            Error::Encoding(format!(
                "authorization value must be {DIGEST_SIZE} bytes, got {}",
                raw.len()
            ))
        })?;
        Ok(Self(raw))
    }

    /// The all-zero well-known secret
    pub fn well_known() -> Self {
        Self([0u8; DIGEST_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }
}

impl fmt::Debug for AuthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthValue(..)")
    }
}

/// Draw a fresh nonce from the OS CSPRNG
pub fn random_nonce() -> Digest {
    let mut nonce = [0u8; DIGEST_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// SHA-1 over the concatenation of `parts`
pub fn sha1(parts: &[&[u8]]) -> Digest {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// HMAC-SHA1 keyed with `key` over the concatenation of `parts`
pub fn hmac_sha1(key: &AuthValue, parts: &[&[u8]]) -> Digest {
    mac_over(key, parts).finalize().into_bytes().into()
}

/// Constant-time check of `tag` against HMAC-SHA1(`key`, `parts`)
pub fn hmac_sha1_verify(key: &AuthValue, parts: &[&[u8]], tag: &[u8]) -> bool {
    mac_over(key, parts).verify_slice(tag).is_ok()
}

fn mac_over(key: &AuthValue, parts: &[&[u8]]) -> HmacSha1 {
    let mut mac = match <HmacSha1 as Mac>::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA1 takes keys of any size"),
    };
    for part in parts {
        mac.update(part);
    }
    mac
}

/// inParamDigest = SHA1(ordinal || params)
pub fn command_digest(ordinal: TpmOrd, params: &[u8]) -> Digest {
    sha1(&[&ordinal.to_u32().to_be_bytes(), params])
}

/// outParamDigest = SHA1(returnCode || ordinal || params)
pub fn response_digest(code: u32, ordinal: TpmOrd, params: &[u8]) -> Digest {
    sha1(&[
        &code.to_be_bytes(),
        &ordinal.to_u32().to_be_bytes(),
        params,
    ])
}

/// The authorization HMAC carried in both request and response trailers:
/// HMAC(key, paramDigest || nonceEven || nonceOdd || continueAuthSession)
pub fn session_hmac(
    key: &AuthValue,
    param_digest: &Digest,
    nonce_even: &Digest,
    nonce_odd: &Digest,
    continue_session: bool,
) -> Digest {
    hmac_sha1(
        key,
        &[param_digest, nonce_even, nonce_odd, &[u8::from(continue_session)]],
    )
}

/// ADIP: encrypt a new authorization value for transport under an OSAP secret.
///
/// `nonce` is the session's even nonce for the first encrypted value of a
/// command and the command's odd nonce for the second.
pub fn encrypt_auth(shared_secret: &AuthValue, nonce: &Digest, new_auth: &AuthValue) -> Digest {
    let pad = sha1(&[shared_secret.as_bytes(), nonce]);
    let mut out = [0u8; DIGEST_SIZE];
    for (o, (a, p)) in out.iter_mut().zip(new_auth.as_bytes().iter().zip(pad)) {
        *o = a ^ p;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_is_sha1() {
        let auth = AuthValue::from_password("abc");
        assert_eq!(hex::encode(auth.as_bytes()), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_hmac_rfc2202_case_1() {
        let key = AuthValue::from_raw([0x0b; 20]);
        let tag = hmac_sha1(&key, &[b"Hi ", b"There"]);
        assert_eq!(hex::encode(tag), "b617318655057264e28bc0b6fb378c8ef146be00");
        assert!(hmac_sha1_verify(&key, &[b"Hi There"], &tag));
    }

    #[test]
    fn test_hmac_rejects_single_bit_flip() {
        let key = AuthValue::from_password("owner");
        let digest = command_digest(TpmOrd::IncrementCounter, &[0, 0, 0, 1]);
        let even = random_nonce();
        let odd = random_nonce();
        let tag = session_hmac(&key, &digest, &even, &odd, true);
        assert!(hmac_sha1_verify(
            &key,
            &[&digest, &even, &odd, &[1]],
            &tag
        ));
        for bit in 0..(DIGEST_SIZE * 8) {
            let mut flipped = tag;
            flipped[bit / 8] ^= 1 << (bit % 8);
            assert!(!hmac_sha1_verify(&key, &[&digest, &even, &odd, &[1]], &flipped));
        }
    }

    // Fixed vectors below were computed independently of this crate
    // (SHA-1/HMAC-SHA1 over the TPM 1.2 field layouts).

    #[test]
    fn test_oiap_auth_known_answer() {
        let counter_auth = AuthValue::from_password("counter");
        let in_digest = command_digest(TpmOrd::IncrementCounter, &1u32.to_be_bytes());
        assert_eq!(hex::encode(in_digest), "0b4c4cc4fb06e1a4a7e6c8c596de37b2a75d6c99");
        let tag = session_hmac(&counter_auth, &in_digest, &[0x11; 20], &[0x22; 20], true);
        assert_eq!(hex::encode(tag), "f109c4f50f424b91a0759131be9408c910c2707f");
    }

    #[test]
    fn test_response_digest_known_answer() {
        let value = [b'A', b'B', b'C', b'D', 0, 0, 0, 42];
        let out_digest = response_digest(0, TpmOrd::IncrementCounter, &value);
        assert_eq!(hex::encode(out_digest), "9a9053fff25e3cf91f203140cacdd1d5c3578311");
    }

    #[test]
    fn test_adip_known_answer() {
        let shared = AuthValue::from_slice(
            &hex::decode("8d6009e2c6ebd2a53a1c635536dba9c64b763e23").unwrap(),
        )
        .unwrap();
        let enc = encrypt_auth(&shared, &[0x55; 20], &AuthValue::from_password("counter"));
        assert_eq!(hex::encode(enc), "ca6e69eed224fe56a980a96a55eb3eb839af23e5");
    }

    #[test]
    fn test_adip_is_an_involution() {
        let secret = AuthValue::from_raw([7; 20]);
        let nonce = [3u8; 20];
        let new_auth = AuthValue::from_password("counter");
        let enc = encrypt_auth(&secret, &nonce, &new_auth);
        assert_ne!(&enc, new_auth.as_bytes());
        let dec = encrypt_auth(&secret, &nonce, &AuthValue::from_raw(enc));
        assert_eq!(&dec, new_auth.as_bytes());
    }

    #[test]
    fn test_from_slice_length() {
        assert!(AuthValue::from_slice(&[0; 19]).is_err());
        assert_eq!(
            AuthValue::from_slice(&[0; 20]).unwrap(),
            AuthValue::well_known()
        );
    }

    #[test]
    fn test_nonces_differ() {
        assert_ne!(random_nonce(), random_nonce());
    }
}
