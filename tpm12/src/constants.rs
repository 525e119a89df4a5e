// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 constants, ordinals and result codes

/// Size of a SHA-1 digest, nonce or authorization value
pub const DIGEST_SIZE: usize = 20;

/// Size of a command or response header: tag (2) + size (4) + ordinal/result (4)
pub const HEADER_SIZE: usize = 10;

/// Size of a request authorization trailer: handle (4) + nonceOdd (20) + continue (1) + auth (20)
pub const AUTH_COMMAND_SIZE: usize = 4 + DIGEST_SIZE + 1 + DIGEST_SIZE;

/// Size of a response authorization trailer: nonceEven (20) + continue (1) + auth (20)
pub const AUTH_RESPONSE_SIZE: usize = DIGEST_SIZE + 1 + DIGEST_SIZE;

/// Largest RSA modulus a TPM 1.2 key blob may carry (2048 bits)
pub const MAX_RSA_MODULUS_SIZE: usize = 256;

/// Largest PCR selection bitmap accepted by the codec
pub const MAX_PCR_SELECT_SIZE: usize = 4;

/// TPM 1.2 ordinals (TPM_COMMAND_CODE)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum TpmOrd {
    Oiap = 0x0000000A,
    Osap = 0x0000000B,
    Extend = 0x00000014,
    PcrRead = 0x00000015,
    DirWriteAuth = 0x00000019,
    DirRead = 0x0000001A,
    CreateWrapKey = 0x0000001F,
    LoadKey = 0x00000020,
    GetPubKey = 0x00000021,
    EvictKey = 0x00000022,
    Sign = 0x0000003C,
    LoadKey2 = 0x00000041,
    GetRandom = 0x00000046,
    StirRandom = 0x00000047,
    SelfTestFull = 0x00000050,
    ContinueSelfTest = 0x00000053,
    GetTestResult = 0x00000054,
    GetCapability = 0x00000065,
    GetAuditDigest = 0x00000085,
    GetAuditDigestSigned = 0x00000086,
    SetOrdinalAuditStatus = 0x0000008D,
    TerminateHandle = 0x00000096,
    Startup = 0x00000099,
    SaveKeyContext = 0x000000B4,
    LoadKeyContext = 0x000000B5,
    SaveAuthContext = 0x000000B6,
    LoadAuthContext = 0x000000B7,
    SaveContext = 0x000000B8,
    LoadContext = 0x000000B9,
    FlushSpecific = 0x000000BA,
    PcrReset = 0x000000C8,
    CreateCounter = 0x000000DC,
    IncrementCounter = 0x000000DD,
    ReadCounter = 0x000000DE,
    ReleaseCounter = 0x000000DF,
    ReleaseCounterOwner = 0x000000E0,
}

impl TpmOrd {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|ord| ord.to_u32() == v)
    }

    /// Ordinals that may answer `TPM_RETRY` while the TPM is busy updating
    /// monotonic counter state.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            TpmOrd::CreateCounter
                | TpmOrd::IncrementCounter
                | TpmOrd::ReleaseCounter
                | TpmOrd::ReleaseCounterOwner
        )
    }

    pub const ALL: [TpmOrd; 36] = [
        TpmOrd::Oiap,
        TpmOrd::Osap,
        TpmOrd::Extend,
        TpmOrd::PcrRead,
        TpmOrd::DirWriteAuth,
        TpmOrd::DirRead,
        TpmOrd::CreateWrapKey,
        TpmOrd::LoadKey,
        TpmOrd::GetPubKey,
        TpmOrd::EvictKey,
        TpmOrd::Sign,
        TpmOrd::LoadKey2,
        TpmOrd::GetRandom,
        TpmOrd::StirRandom,
        TpmOrd::SelfTestFull,
        TpmOrd::ContinueSelfTest,
        TpmOrd::GetTestResult,
        TpmOrd::GetCapability,
        TpmOrd::GetAuditDigest,
        TpmOrd::GetAuditDigestSigned,
        TpmOrd::SetOrdinalAuditStatus,
        TpmOrd::TerminateHandle,
        TpmOrd::Startup,
        TpmOrd::SaveKeyContext,
        TpmOrd::LoadKeyContext,
        TpmOrd::SaveAuthContext,
        TpmOrd::LoadAuthContext,
        TpmOrd::SaveContext,
        TpmOrd::LoadContext,
        TpmOrd::FlushSpecific,
        TpmOrd::PcrReset,
        TpmOrd::CreateCounter,
        TpmOrd::IncrementCounter,
        TpmOrd::ReadCounter,
        TpmOrd::ReleaseCounter,
        TpmOrd::ReleaseCounterOwner,
    ];
}

/// Command and response tags (TPM_TAG)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmTag {
    RquCommand = 0x00C1,
    RquAuth1Command = 0x00C2,
    RquAuth2Command = 0x00C3,
    RspCommand = 0x00C4,
    RspAuth1Command = 0x00C5,
    RspAuth2Command = 0x00C6,
}

impl TpmTag {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x00C1 => Some(TpmTag::RquCommand),
            0x00C2 => Some(TpmTag::RquAuth1Command),
            0x00C3 => Some(TpmTag::RquAuth2Command),
            0x00C4 => Some(TpmTag::RspCommand),
            0x00C5 => Some(TpmTag::RspAuth1Command),
            0x00C6 => Some(TpmTag::RspAuth2Command),
            _ => None,
        }
    }

    /// Request tag for a command carrying `auth_count` authorization trailers
    pub fn request(auth_count: usize) -> Option<Self> {
        match auth_count {
            0 => Some(TpmTag::RquCommand),
            1 => Some(TpmTag::RquAuth1Command),
            2 => Some(TpmTag::RquAuth2Command),
            _ => None,
        }
    }

    /// Number of authorization trailers a response with this tag carries
    pub fn response_auth_count(self) -> Option<usize> {
        match self {
            TpmTag::RspCommand => Some(0),
            TpmTag::RspAuth1Command => Some(1),
            TpmTag::RspAuth2Command => Some(2),
            _ => None,
        }
    }
}

/// Structure tags (TPM_STRUCTURE_TAG)
pub mod tpm_tag {
    pub const CONTEXTBLOB: u16 = 0x0001;
    pub const COUNTER_VALUE: u16 = 0x000E;
    pub const KEY12: u16 = 0x0028;
}

/// TPM 1.2 result codes (TPM_RESULT)
pub mod tpm_rc {
    pub const SUCCESS: u32 = 0x00000000;
    pub const AUTHFAIL: u32 = 0x00000001;
    pub const BADINDEX: u32 = 0x00000002;
    pub const BAD_PARAMETER: u32 = 0x00000003;
    pub const AUDITFAILURE: u32 = 0x00000004;
    pub const CLEAR_DISABLED: u32 = 0x00000005;
    pub const DEACTIVATED: u32 = 0x00000006;
    pub const DISABLED: u32 = 0x00000007;
    pub const DISABLED_CMD: u32 = 0x00000008;
    pub const FAIL: u32 = 0x00000009;
    pub const BAD_ORDINAL: u32 = 0x0000000A;
    pub const INSTALL_DISABLED: u32 = 0x0000000B;
    pub const INVALID_KEYHANDLE: u32 = 0x0000000C;
    pub const KEYNOTFOUND: u32 = 0x0000000D;
    pub const INAPPROPRIATE_ENC: u32 = 0x0000000E;
    pub const MIGRATEFAIL: u32 = 0x0000000F;
    pub const INVALID_PCR_INFO: u32 = 0x00000010;
    pub const NOSPACE: u32 = 0x00000011;
    pub const NOSRK: u32 = 0x00000012;
    pub const NOTSEALED_BLOB: u32 = 0x00000013;
    pub const OWNER_SET: u32 = 0x00000014;
    pub const RESOURCES: u32 = 0x00000015;
    pub const SHORTRANDOM: u32 = 0x00000016;
    pub const SIZE: u32 = 0x00000017;
    pub const WRONGPCRVAL: u32 = 0x00000018;
    pub const BAD_PARAM_SIZE: u32 = 0x00000019;
    pub const SHA_THREAD: u32 = 0x0000001A;
    pub const SHA_ERROR: u32 = 0x0000001B;
    pub const FAILEDSELFTEST: u32 = 0x0000001C;
    pub const AUTH2FAIL: u32 = 0x0000001D;
    pub const BADTAG: u32 = 0x0000001E;
    pub const IOERROR: u32 = 0x0000001F;
    pub const ENCRYPT_ERROR: u32 = 0x00000020;
    pub const DECRYPT_ERROR: u32 = 0x00000021;
    pub const INVALID_AUTHHANDLE: u32 = 0x00000022;
    pub const NO_ENDORSEMENT: u32 = 0x00000023;
    pub const INVALID_KEYUSAGE: u32 = 0x00000024;
    pub const WRONG_ENTITYTYPE: u32 = 0x00000025;
    pub const INVALID_POSTINIT: u32 = 0x00000026;
    pub const INAPPROPRIATE_SIG: u32 = 0x00000027;
    pub const BAD_KEY_PROPERTY: u32 = 0x00000028;
    pub const BAD_MIGRATION: u32 = 0x00000029;
    pub const BAD_SCHEME: u32 = 0x0000002A;
    pub const BAD_DATASIZE: u32 = 0x0000002B;
    pub const BAD_MODE: u32 = 0x0000002C;
    pub const BAD_PRESENCE: u32 = 0x0000002D;
    pub const BAD_VERSION: u32 = 0x0000002E;
    pub const NO_WRAP_TRANSPORT: u32 = 0x0000002F;
    pub const AUDITFAIL_UNSUCCESSFUL: u32 = 0x00000030;
    pub const AUDITFAIL_SUCCESSFUL: u32 = 0x00000031;
    pub const NOTRESETABLE: u32 = 0x00000032;
    pub const NOTLOCAL: u32 = 0x00000033;
    pub const BAD_TYPE: u32 = 0x00000034;
    pub const INVALID_RESOURCE: u32 = 0x00000035;
    pub const NOTFIPS: u32 = 0x00000036;
    pub const INVALID_FAMILY: u32 = 0x00000037;
    pub const NO_NV_PERMISSION: u32 = 0x00000038;
    pub const REQUIRES_SIGN: u32 = 0x00000039;
    pub const KEY_NOTSUPPORTED: u32 = 0x0000003A;
    pub const AUTH_CONFLICT: u32 = 0x0000003B;
    pub const AREA_LOCKED: u32 = 0x0000003C;
    pub const BAD_LOCALITY: u32 = 0x0000003D;
    pub const READ_ONLY: u32 = 0x0000003E;
    pub const PER_NOWRITE: u32 = 0x0000003F;
    pub const FAMILYCOUNT: u32 = 0x00000040;
    pub const WRITE_LOCKED: u32 = 0x00000041;
    pub const BAD_ATTRIBUTES: u32 = 0x00000042;
    pub const INVALID_STRUCTURE: u32 = 0x00000043;
    pub const KEY_OWNER_CONTROL: u32 = 0x00000044;
    pub const BAD_COUNTER: u32 = 0x00000045;
    pub const NOT_FULLWRITE: u32 = 0x00000046;
    pub const CONTEXT_GAP: u32 = 0x00000047;
    pub const MAXNVWRITES: u32 = 0x00000048;
    pub const NOOPERATOR: u32 = 0x00000049;
    pub const RESOURCEMISSING: u32 = 0x0000004A;
    pub const DELEGATE_LOCK: u32 = 0x0000004B;
    pub const DELEGATE_FAMILY: u32 = 0x0000004C;
    pub const DELEGATE_ADMIN: u32 = 0x0000004D;
    pub const TRANSPORT_NOTEXCLUSIVE: u32 = 0x0000004E;
    pub const OWNER_CONTROL: u32 = 0x0000004F;
    pub const DAA_RESOURCES: u32 = 0x00000050;
    pub const DAA_INPUT_DATA0: u32 = 0x00000051;
    pub const DAA_INPUT_DATA1: u32 = 0x00000052;
    pub const DAA_ISSUER_SETTINGS: u32 = 0x00000053;
    pub const DAA_TPM_SETTINGS: u32 = 0x00000054;
    pub const DAA_STAGE: u32 = 0x00000055;
    pub const DAA_ISSUER_VALIDITY: u32 = 0x00000056;
    pub const DAA_WRONG_W: u32 = 0x00000057;
    pub const BAD_HANDLE: u32 = 0x00000058;
    pub const BAD_DELEGATE: u32 = 0x00000059;
    pub const BADCONTEXT: u32 = 0x0000005A;
    pub const TOOMANYCONTEXTS: u32 = 0x0000005B;
    pub const MA_TICKET_SIGNATURE: u32 = 0x0000005C;
    pub const MA_DESTINATION: u32 = 0x0000005D;
    pub const MA_SOURCE: u32 = 0x0000005E;
    pub const MA_AUTHORITY: u32 = 0x0000005F;
    pub const PERMANENTEK: u32 = 0x00000061;
    pub const BAD_SIGNATURE: u32 = 0x00000062;
    pub const NOCONTEXTSPACE: u32 = 0x00000063;

    /// Non-fatal codes have this bit set
    pub const NON_FATAL: u32 = 0x00000800;
    pub const RETRY: u32 = NON_FATAL;
    pub const NEEDS_SELFTEST: u32 = NON_FATAL + 1;
    pub const DOING_SELFTEST: u32 = NON_FATAL + 2;
    pub const DEFEND_LOCK_RUNNING: u32 = NON_FATAL + 3;
}

/// Entity types used when establishing an OSAP session (TPM_ENTITY_TYPE)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TpmEntityType {
    KeyHandle = 0x0001,
    Owner = 0x0002,
    Data = 0x0003,
    Srk = 0x0004,
    Key = 0x0005,
    Counter = 0x000A,
    Nv = 0x000B,
    Operator = 0x000C,
}

impl TpmEntityType {
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Reserved key handles (TPM_KEY_HANDLE)
pub mod tpm_kh {
    pub const SRK: u32 = 0x40000000;
    pub const OWNER: u32 = 0x40000001;
    pub const REVOKE: u32 = 0x40000002;
    pub const TRANSPORT: u32 = 0x40000003;
    pub const OPERATOR: u32 = 0x40000004;
    pub const ADMIN: u32 = 0x40000005;
    pub const EK: u32 = 0x40000006;
}

/// Resource types (TPM_RESOURCE_TYPE)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum TpmResourceType {
    Key = 0x00000001,
    Auth = 0x00000002,
    Hash = 0x00000003,
    Trans = 0x00000004,
    Context = 0x00000005,
    Counter = 0x00000006,
    Delegate = 0x00000007,
    DaaTpm = 0x00000008,
    DaaV0 = 0x00000009,
    DaaV1 = 0x0000000A,
}

impl TpmResourceType {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x01 => Some(TpmResourceType::Key),
            0x02 => Some(TpmResourceType::Auth),
            0x03 => Some(TpmResourceType::Hash),
            0x04 => Some(TpmResourceType::Trans),
            0x05 => Some(TpmResourceType::Context),
            0x06 => Some(TpmResourceType::Counter),
            0x07 => Some(TpmResourceType::Delegate),
            0x08 => Some(TpmResourceType::DaaTpm),
            0x09 => Some(TpmResourceType::DaaV0),
            0x0A => Some(TpmResourceType::DaaV1),
            _ => None,
        }
    }

    /// Session contexts may be loaded only once per save
    pub fn is_session(self) -> bool {
        matches!(self, TpmResourceType::Auth | TpmResourceType::Trans)
    }
}

/// Capability areas (TPM_CAPABILITY_AREA)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCap {
    Ord = 0x00000001,
    Alg = 0x00000002,
    Pid = 0x00000003,
    Flag = 0x00000004,
    Property = 0x00000005,
    Version = 0x00000006,
    KeyHandle = 0x00000007,
    CheckLoaded = 0x00000008,
    SymMode = 0x00000009,
    KeyStatus = 0x0000000C,
    NvList = 0x0000000D,
    Mfr = 0x00000010,
    NvIndex = 0x00000011,
    TransAlg = 0x00000012,
    Handle = 0x00000014,
    TransEs = 0x00000015,
    AuthEncrypt = 0x00000017,
    SelectSize = 0x00000018,
    DaLogic = 0x00000019,
    VersionVal = 0x0000001A,
}

impl TpmCap {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// Sub-capabilities of `TpmCap::Property` (TPM_CAP_PROP_*)
pub mod tpm_cap_prop {
    pub const PCR: u32 = 0x00000101;
    pub const DIR: u32 = 0x00000102;
    pub const MANUFACTURER: u32 = 0x00000103;
    pub const KEYS: u32 = 0x00000104;
    pub const MIN_COUNTER: u32 = 0x00000107;
    pub const AUTHSESS: u32 = 0x0000010A;
    pub const TRANSESS: u32 = 0x0000010B;
    pub const COUNTERS: u32 = 0x0000010C;
    pub const MAX_AUTHSESS: u32 = 0x0000010D;
    pub const MAX_TRANSESS: u32 = 0x0000010E;
    pub const MAX_COUNTERS: u32 = 0x0000010F;
    pub const MAX_KEYS: u32 = 0x00000110;
    pub const OWNER: u32 = 0x00000111;
    pub const CONTEXT: u32 = 0x00000112;
    pub const MAX_CONTEXT: u32 = 0x00000113;
    pub const FAMILYROWS: u32 = 0x00000114;
    pub const TIS_TIMEOUT: u32 = 0x00000115;
    pub const STARTUP_EFFECT: u32 = 0x00000116;
    pub const DELEGATE_ROW: u32 = 0x00000117;
    pub const CONTEXT_DIST: u32 = 0x0000011B;
    pub const SESSIONS: u32 = 0x0000011D;
    pub const MAX_SESSIONS: u32 = 0x0000011E;
    pub const DURATION: u32 = 0x00000120;
    pub const ACTIVE_COUNTER: u32 = 0x00000122;
    pub const MAX_NV_AVAILABLE: u32 = 0x00000123;
    pub const INPUT_BUFFER: u32 = 0x00000124;
}

/// Key usage (TPM_KEY_USAGE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmKeyUsage {
    Signing = 0x0010,
    Storage = 0x0011,
    Identity = 0x0012,
    AuthChange = 0x0013,
    Bind = 0x0014,
    Legacy = 0x0015,
    Migrate = 0x0016,
}

impl TpmKeyUsage {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0010 => Some(TpmKeyUsage::Signing),
            0x0011 => Some(TpmKeyUsage::Storage),
            0x0012 => Some(TpmKeyUsage::Identity),
            0x0013 => Some(TpmKeyUsage::AuthChange),
            0x0014 => Some(TpmKeyUsage::Bind),
            0x0015 => Some(TpmKeyUsage::Legacy),
            0x0016 => Some(TpmKeyUsage::Migrate),
            _ => None,
        }
    }
}

/// Key flags (TPM_KEY_FLAGS)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmKeyFlags(pub u32);

impl TpmKeyFlags {
    pub const REDIRECTION: u32 = 1 << 0;
    pub const MIGRATABLE: u32 = 1 << 1;
    pub const IS_VOLATILE: u32 = 1 << 2;
    pub const PCR_IGNORED_ON_READ: u32 = 1 << 3;
    pub const MIGRATE_AUTHORITY: u32 = 1 << 4;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_migratable(mut self) -> Self {
        self.0 |= Self::MIGRATABLE;
        self
    }
}

/// Authorization data usage (TPM_AUTH_DATA_USAGE)
pub mod tpm_auth {
    pub const NEVER: u8 = 0x00;
    pub const ALWAYS: u8 = 0x01;
    pub const PRIV_USE_ONLY: u8 = 0x03;
}

/// Algorithm identifiers (TPM_ALGORITHM_ID)
pub mod tpm_alg {
    pub const RSA: u32 = 0x00000001;
    pub const SHA: u32 = 0x00000004;
    pub const HMAC: u32 = 0x00000005;
    pub const AES128: u32 = 0x00000006;
    pub const MGF1: u32 = 0x00000007;
    pub const AES192: u32 = 0x00000008;
    pub const AES256: u32 = 0x00000009;
    pub const XOR: u32 = 0x0000000A;
}

/// Encryption schemes (TPM_ENC_SCHEME)
pub mod tpm_es {
    pub const NONE: u16 = 0x0001;
    pub const RSAESPKCSV15: u16 = 0x0002;
    pub const RSAESOAEP_SHA1_MGF1: u16 = 0x0003;
    pub const SYM_CTR: u16 = 0x0004;
    pub const SYM_OFB: u16 = 0x0005;
}

/// Signature schemes (TPM_SIG_SCHEME)
pub mod tpm_ss {
    pub const NONE: u16 = 0x0001;
    pub const RSASSAPKCS1V15_SHA1: u16 = 0x0002;
    pub const RSASSAPKCS1V15_DER: u16 = 0x0003;
    pub const RSASSAPKCS1V15_INFO: u16 = 0x0004;
}

/// Startup types (TPM_STARTUP_TYPE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmStartupType {
    Clear = 0x0001,
    State = 0x0002,
    Deactivated = 0x0003,
}

impl TpmStartupType {
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}
