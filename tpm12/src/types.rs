// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 data structures

use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;

/// TPM_STRUCT_VER - version header of 1.1 style structures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructVer {
    pub major: u8,
    pub minor: u8,
    pub rev_major: u8,
    pub rev_minor: u8,
}

impl Default for StructVer {
    fn default() -> Self {
        Self {
            major: 1,
            minor: 1,
            rev_major: 0,
            rev_minor: 0,
        }
    }
}

impl Marshal for StructVer {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_bytes(&[self.major, self.minor, self.rev_major, self.rev_minor]);
        Ok(())
    }
}

impl Unmarshal for StructVer {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let [major, minor, rev_major, rev_minor] = buf.get_array::<4>()?;
        Ok(Self {
            major,
            minor,
            rev_major,
            rev_minor,
        })
    }
}

/// TPM_RSA_KEY_PARMS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaKeyParms {
    /// Modulus size in bits
    pub key_length: u32,
    pub num_primes: u32,
    /// Empty means the default exponent 65537
    pub exponent: Vec<u8>,
}

impl RsaKeyParms {
    pub fn new(key_length: u32) -> Self {
        Self {
            key_length,
            num_primes: 2,
            exponent: Vec::new(),
        }
    }
}

impl Marshal for RsaKeyParms {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        if self.key_length as usize > MAX_RSA_MODULUS_SIZE * 8 {
            return Err(Error::Encoding(format!(
                "RSA key length {} bits exceeds {} bits",
                self.key_length,
                MAX_RSA_MODULUS_SIZE * 8
            )));
        }
        buf.put_u32(self.key_length);
        buf.put_u32(self.num_primes);
        buf.put_sized(&self.exponent)
    }
}

impl Unmarshal for RsaKeyParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            key_length: buf.get_u32()?,
            num_primes: buf.get_u32()?,
            exponent: buf.get_sized()?,
        })
    }
}

/// Algorithm specific part of TPM_KEY_PARMS
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlgorithmParms {
    Rsa(RsaKeyParms),
    /// Parameters of any other algorithm, kept verbatim
    Raw(Vec<u8>),
}

/// TPM_KEY_PARMS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParms {
    pub algorithm_id: u32,
    pub enc_scheme: u16,
    pub sig_scheme: u16,
    pub parms: AlgorithmParms,
}

impl KeyParms {
    pub fn rsa(key_length: u32, enc_scheme: u16, sig_scheme: u16) -> Self {
        Self {
            algorithm_id: tpm_alg::RSA,
            enc_scheme,
            sig_scheme,
            parms: AlgorithmParms::Rsa(RsaKeyParms::new(key_length)),
        }
    }

    pub fn rsa_parms(&self) -> Option<&RsaKeyParms> {
        match &self.parms {
            AlgorithmParms::Rsa(p) => Some(p),
            AlgorithmParms::Raw(_) => None,
        }
    }
}

impl Marshal for KeyParms {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u32(self.algorithm_id);
        buf.put_u16(self.enc_scheme);
        buf.put_u16(self.sig_scheme);
        match &self.parms {
            AlgorithmParms::Rsa(rsa) => buf.put_sized(&rsa.to_bytes()?),
            AlgorithmParms::Raw(raw) => buf.put_sized(raw),
        }
    }
}

impl Unmarshal for KeyParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let algorithm_id = buf.get_u32()?;
        let enc_scheme = buf.get_u16()?;
        let sig_scheme = buf.get_u16()?;
        let raw = buf.get_sized()?;
        let parms = if algorithm_id == tpm_alg::RSA {
            AlgorithmParms::Rsa(RsaKeyParms::from_bytes(&raw)?)
        } else {
            AlgorithmParms::Raw(raw)
        };
        Ok(Self {
            algorithm_id,
            enc_scheme,
            sig_scheme,
            parms,
        })
    }
}

/// TPM_STORE_PUBKEY - the public modulus of an RSA key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorePubkey {
    pub key: Vec<u8>,
}

impl StorePubkey {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }
}

impl Marshal for StorePubkey {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        if self.key.len() > MAX_RSA_MODULUS_SIZE {
            return Err(Error::Encoding(format!(
                "public key of {} bytes exceeds {} bytes",
                self.key.len(),
                MAX_RSA_MODULUS_SIZE
            )));
        }
        buf.put_sized(&self.key)
    }
}

impl Unmarshal for StorePubkey {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            key: buf.get_sized()?,
        })
    }
}

/// TPM_PUBKEY - returned by GetPubKey
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pubkey {
    pub algorithm_parms: KeyParms,
    pub pub_key: StorePubkey,
}

impl Marshal for Pubkey {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        self.algorithm_parms.marshal(buf)?;
        self.pub_key.marshal(buf)
    }
}

impl Unmarshal for Pubkey {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            algorithm_parms: KeyParms::unmarshal(buf)?,
            pub_key: StorePubkey::unmarshal(buf)?,
        })
    }
}

/// Layout of a key blob: TPM_KEY (1.1) or TPM_KEY12
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    Key11(StructVer),
    Key12,
}

/// TPM_KEY / TPM_KEY12 - a wrapped asymmetric key
///
/// The private part is encrypted under the parent storage key and opaque
/// to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBlob {
    pub format: KeyFormat,
    pub key_usage: u16,
    pub key_flags: TpmKeyFlags,
    pub auth_data_usage: u8,
    pub algorithm_parms: KeyParms,
    pub pcr_info: Vec<u8>,
    pub pub_key: StorePubkey,
    pub enc_data: Vec<u8>,
}

impl KeyBlob {
    /// Template for CreateWrapKey: an RSA key of `key_length` bits
    pub fn template(usage: TpmKeyUsage, key_length: u32, flags: TpmKeyFlags) -> Self {
        let (enc_scheme, sig_scheme) = match usage {
            TpmKeyUsage::Signing | TpmKeyUsage::Identity => {
                (tpm_es::NONE, tpm_ss::RSASSAPKCS1V15_SHA1)
            }
            TpmKeyUsage::Legacy => (tpm_es::RSAESOAEP_SHA1_MGF1, tpm_ss::RSASSAPKCS1V15_SHA1),
            _ => (tpm_es::RSAESOAEP_SHA1_MGF1, tpm_ss::NONE),
        };
        Self {
            format: KeyFormat::Key11(StructVer::default()),
            key_usage: usage.to_u16(),
            key_flags: flags,
            auth_data_usage: tpm_auth::ALWAYS,
            algorithm_parms: KeyParms::rsa(key_length, enc_scheme, sig_scheme),
            pcr_info: Vec::new(),
            pub_key: StorePubkey::default(),
            enc_data: Vec::new(),
        }
    }

    /// The public portion, as GetPubKey would return it
    pub fn pubkey(&self) -> Pubkey {
        Pubkey {
            algorithm_parms: self.algorithm_parms.clone(),
            pub_key: self.pub_key.clone(),
        }
    }

    pub fn usage(&self) -> Option<TpmKeyUsage> {
        TpmKeyUsage::from_u16(self.key_usage)
    }
}

impl Marshal for KeyBlob {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        match self.format {
            KeyFormat::Key11(ver) => {
                if ver.major != 1 || ver.minor != 1 {
                    return Err(Error::Encoding(format!(
                        "TPM_KEY carries version 1.1, not {}.{}",
                        ver.major, ver.minor
                    )));
                }
                ver.marshal(buf)?
            }
            KeyFormat::Key12 => {
                buf.put_u16(tpm_tag::KEY12);
                buf.put_u16(0); // fill
            }
        }
        buf.put_u16(self.key_usage);
        buf.put_u32(self.key_flags.0);
        buf.put_u8(self.auth_data_usage);
        self.algorithm_parms.marshal(buf)?;
        buf.put_sized(&self.pcr_info)?;
        self.pub_key.marshal(buf)?;
        buf.put_sized(&self.enc_data)
    }
}

impl Unmarshal for KeyBlob {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let head = buf.peek_bytes(2)?;
        let format = if u16::from_be_bytes([head[0], head[1]]) == tpm_tag::KEY12 {
            buf.skip(2)?;
            let fill = buf.get_u16()?;
            if fill != 0 {
                return Err(Error::MalformedResponse(format!(
                    "TPM_KEY12 fill is 0x{fill:04x}, expected zero"
                )));
            }
            KeyFormat::Key12
        } else {
            let ver = StructVer::unmarshal(buf)?;
            if ver.major != 1 || ver.minor != 1 {
                return Err(Error::MalformedResponse(format!(
                    "unsupported key structure version {}.{}",
                    ver.major, ver.minor
                )));
            }
            KeyFormat::Key11(ver)
        };
        Ok(Self {
            format,
            key_usage: buf.get_u16()?,
            key_flags: TpmKeyFlags(buf.get_u32()?),
            auth_data_usage: buf.get_u8()?,
            algorithm_parms: KeyParms::unmarshal(buf)?,
            pcr_info: buf.get_sized()?,
            pub_key: StorePubkey::unmarshal(buf)?,
            enc_data: buf.get_sized()?,
        })
    }
}

/// TPM_PCR_SELECTION - bitmap of selected PCRs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcrSelection {
    pub select: Vec<u8>,
}

impl PcrSelection {
    /// Selection covering `pcrs`, at least 3 bytes wide (PCR 0-23)
    pub fn new(pcrs: &[u32]) -> Result<Self> {
        let max_pcr = pcrs.iter().max().copied().unwrap_or(0);
        let size = ((max_pcr / 8) + 1).max(3) as usize;
        if size > MAX_PCR_SELECT_SIZE {
            return Err(Error::Encoding(format!("PCR index {max_pcr} out of range")));
        }
        let mut select = vec![0u8; size];
        for &pcr in pcrs {
            select[(pcr / 8) as usize] |= 1 << (pcr % 8);
        }
        Ok(Self { select })
    }

    /// Selected PCR indices in ascending order
    pub fn indices(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (byte_idx, &byte) in self.select.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    out.push((byte_idx * 8 + bit) as u32);
                }
            }
        }
        out
    }
}

impl Marshal for PcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        if self.select.len() > MAX_PCR_SELECT_SIZE {
            return Err(Error::Encoding(format!(
                "PCR selection of {} bytes exceeds {}",
                self.select.len(),
                MAX_PCR_SELECT_SIZE
            )));
        }
        buf.put_sized_u16(&self.select)
    }
}

impl Unmarshal for PcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            select: buf.get_sized_u16()?,
        })
    }
}

/// TPM_COUNTER_VALUE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterValue {
    pub label: [u8; 4],
    pub counter: u32,
}

impl Marshal for CounterValue {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u16(tpm_tag::COUNTER_VALUE);
        buf.put_bytes(&self.label);
        buf.put_u32(self.counter);
        Ok(())
    }
}

impl Unmarshal for CounterValue {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let tag = buf.get_u16()?;
        if tag != tpm_tag::COUNTER_VALUE {
            return Err(Error::MalformedResponse(format!(
                "unexpected counter value tag 0x{tag:04x}"
            )));
        }
        Ok(Self {
            label: buf.get_array::<4>()?,
            counter: buf.get_u32()?,
        })
    }
}

/// TPM_CONTEXT_BLOB - an encrypted snapshot of a TPM resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextBlob {
    pub resource_type: u32,
    pub handle: u32,
    pub label: [u8; 16],
    pub context_count: u32,
    pub integrity_digest: Digest,
    pub additional_data: Vec<u8>,
    pub sensitive_data: Vec<u8>,
}

impl ContextBlob {
    pub fn resource(&self) -> Option<TpmResourceType> {
        TpmResourceType::from_u32(self.resource_type)
    }
}

impl Marshal for ContextBlob {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u16(tpm_tag::CONTEXTBLOB);
        buf.put_u32(self.resource_type);
        buf.put_u32(self.handle);
        buf.put_bytes(&self.label);
        buf.put_u32(self.context_count);
        buf.put_bytes(&self.integrity_digest);
        buf.put_sized(&self.additional_data)?;
        buf.put_sized(&self.sensitive_data)
    }
}

impl Unmarshal for ContextBlob {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let tag = buf.get_u16()?;
        if tag != tpm_tag::CONTEXTBLOB {
            return Err(Error::MalformedResponse(format!(
                "unexpected context blob tag 0x{tag:04x}"
            )));
        }
        Ok(Self {
            resource_type: buf.get_u32()?,
            handle: buf.get_u32()?,
            label: buf.get_array::<16>()?,
            context_count: buf.get_u32()?,
            integrity_digest: buf.get_digest()?,
            additional_data: buf.get_sized()?,
            sensitive_data: buf.get_sized()?,
        })
    }
}

/// TPM_KEY_HANDLE_LIST - 2-byte count followed by 4-byte handles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleList {
    pub handles: Vec<u32>,
}

impl Marshal for HandleList {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        let count = u16::try_from(self.handles.len())
            .map_err(|_| Error::Encoding("too many handles".into()))?;
        buf.put_u16(count);
        for &h in &self.handles {
            buf.put_u32(h);
        }
        Ok(())
    }
}

impl Unmarshal for HandleList {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u16()? as usize;
        if count * 4 > buf.remaining() {
            return Err(Error::MalformedResponse(format!(
                "handle list declares {count} entries but only {} bytes remain",
                buf.remaining()
            )));
        }
        let handles = (0..count)
            .map(|_| buf.get_u32())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { handles })
    }
}

/// Authorization trailer appended to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCommand {
    pub handle: u32,
    pub nonce_odd: Digest,
    pub continue_session: bool,
    pub auth: Digest,
}

impl Marshal for AuthCommand {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u32(self.handle);
        buf.put_bytes(&self.nonce_odd);
        buf.put_bool(self.continue_session);
        buf.put_bytes(&self.auth);
        Ok(())
    }
}

impl Unmarshal for AuthCommand {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            handle: buf.get_u32()?,
            nonce_odd: buf.get_digest()?,
            continue_session: buf.get_bool()?,
            auth: buf.get_digest()?,
        })
    }
}

/// Authorization trailer of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub nonce_even: Digest,
    pub continue_session: bool,
    pub auth: Digest,
}

impl Marshal for AuthResponse {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_bytes(&self.nonce_even);
        buf.put_bool(self.continue_session);
        buf.put_bytes(&self.auth);
        Ok(())
    }
}

impl Unmarshal for AuthResponse {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nonce_even: buf.get_digest()?,
            continue_session: buf.get_bool()?,
            auth: buf.get_digest()?,
        })
    }
}

/// One page of GetAuditDigest output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditDigestPage {
    pub counter: CounterValue,
    pub digest: Digest,
    pub more: bool,
    pub ordinals: Vec<u32>,
}

impl Unmarshal for AuditDigestPage {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let counter = CounterValue::unmarshal(buf)?;
        let digest = buf.get_digest()?;
        let more = buf.get_bool()?;
        let list = buf.get_sized()?;
        if list.len() % 4 != 0 {
            return Err(Error::MalformedResponse(format!(
                "ordinal list of {} bytes is not a multiple of 4",
                list.len()
            )));
        }
        let ordinals = list
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self {
            counter,
            digest,
            more,
            ordinals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key(format: KeyFormat) -> KeyBlob {
        let mut key = KeyBlob::template(TpmKeyUsage::Signing, 2048, TpmKeyFlags::new());
        key.format = format;
        key.pub_key = StorePubkey::new(vec![0xC3; 256]);
        key.enc_data = vec![0x11; 256];
        key
    }

    #[test]
    fn test_key11_round_trip() {
        let key = sample_key(KeyFormat::Key11(StructVer::default()));
        let bytes = key.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[1, 1, 0, 0]);
        assert_eq!(KeyBlob::from_bytes(&bytes).unwrap(), key);
    }

    #[test]
    fn test_key12_is_detected_by_tag() {
        let key = sample_key(KeyFormat::Key12);
        let bytes = key.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0x00, 0x28, 0x00, 0x00]);
        let parsed = KeyBlob::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.format, KeyFormat::Key12);
        assert_eq!(parsed.pubkey().pub_key.key.len(), 256);
    }

    #[test]
    fn test_key11_version_other_than_1_1_rejected() {
        let key = sample_key(KeyFormat::Key11(StructVer {
            major: 1,
            minor: 2,
            rev_major: 0,
            rev_minor: 0,
        }));
        assert!(matches!(key.to_bytes(), Err(Error::Encoding(_))));

        let mut bytes = sample_key(KeyFormat::Key11(StructVer::default()))
            .to_bytes()
            .unwrap();
        bytes[1] = 2;
        assert!(matches!(
            KeyBlob::from_bytes(&bytes),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_key12_nonzero_fill_rejected() {
        let mut bytes = sample_key(KeyFormat::Key12).to_bytes().unwrap();
        bytes[3] = 0x5A;
        assert!(matches!(
            KeyBlob::from_bytes(&bytes),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_oversized_modulus_rejected() {
        let mut key = sample_key(KeyFormat::Key12);
        key.pub_key = StorePubkey::new(vec![0; 257]);
        assert!(matches!(key.to_bytes(), Err(Error::Encoding(_))));

        let parms = RsaKeyParms::new(4096);
        assert!(matches!(parms.to_bytes(), Err(Error::Encoding(_))));
    }

    #[test]
    fn test_truncated_key_blob() {
        let bytes = sample_key(KeyFormat::Key12).to_bytes().unwrap();
        let err = KeyBlob::from_bytes(&bytes[..bytes.len() - 10]).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }

    #[test]
    fn test_pcr_selection_bitmap() {
        let sel = PcrSelection::new(&[0, 1, 2, 7, 16]).unwrap();
        assert_eq!(sel.select, vec![0x87, 0x00, 0x01]);
        assert_eq!(sel.indices(), vec![0, 1, 2, 7, 16]);
        assert_eq!(sel.to_bytes().unwrap(), vec![0x00, 0x03, 0x87, 0x00, 0x01]);
        assert!(PcrSelection::new(&[40]).is_err());
    }

    #[test]
    fn test_handle_list_parsing() {
        let data = [
            0x00, 0x03, // count
            0x01, 0x00, 0x00, 0x00, //
            0x01, 0x00, 0x00, 0x01, //
            0x02, 0x00, 0x00, 0x07,
        ];
        let list = HandleList::from_bytes(&data).unwrap();
        assert_eq!(list.handles, vec![0x0100_0000, 0x0100_0001, 0x0200_0007]);

        assert!(HandleList::from_bytes(&data[..8]).is_err());
    }

    #[test]
    fn test_context_blob_tag_checked() {
        let blob = ContextBlob {
            resource_type: TpmResourceType::Key.to_u32(),
            handle: 0x0100_0000,
            label: *b"tpm12-ctx-label!",
            context_count: 7,
            integrity_digest: [9; 20],
            additional_data: vec![1, 2, 3],
            sensitive_data: vec![4; 600],
        };
        let mut bytes = blob.to_bytes().unwrap();
        assert_eq!(ContextBlob::from_bytes(&bytes).unwrap(), blob);
        bytes[1] = 0x02;
        assert!(ContextBlob::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_audit_page_ordinal_list_in_bytes() {
        let mut buf = CommandBuffer::new();
        CounterValue {
            label: *b"AUDT",
            counter: 3,
        }
        .marshal(&mut buf)
        .unwrap();
        buf.put_bytes(&[0xAB; 20]);
        buf.put_bool(true);
        buf.put_u32(8);
        buf.put_u32(0x20);
        buf.put_u32(0x41);
        let page = AuditDigestPage::from_bytes(buf.as_bytes()).unwrap();
        assert!(page.more);
        assert_eq!(page.ordinals, vec![0x20, 0x41]);
        assert_eq!(page.counter.counter, 3);
    }
}
