// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy and the TPM result code message table

use std::io;

use thiserror::Error;

use super::constants::{tpm_rc, TpmOrd};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Connection refused, partial write, broken pipe and the like
    #[error("transport failure: {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out waiting for the TPM after {0:?}")]
    Timeout(std::time::Duration),
    /// Local marshaling failure, e.g. an oversized field
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    /// The TPM answered with a nonzero result code
    #[error("{ordinal:?} failed: {} (0x{code:08x})", describe(.code))]
    Protocol { ordinal: TpmOrd, code: u32 },
    /// The response HMAC did not match; the output must not be trusted
    #[error("{ordinal:?}: response authorization does not verify")]
    AuthValidation { ordinal: TpmOrd },
    #[error("nonce reuse detected on session 0x{0:08x}")]
    NonceReuse(u32),
    #[error("session 0x{0:08x} is closed")]
    SessionClosed(u32),
    /// A saved session context may be loaded only once
    #[error("session context was already loaded once")]
    ContextReused,
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn transport(context: impl Into<String>, source: io::Error) -> Self {
        Error::Transport {
            context: context.into(),
            source,
        }
    }

    /// The TPM result code carried by a protocol error
    pub fn tpm_code(&self) -> Option<u32> {
        match self {
            Error::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True only for `TPM_RETRY`
    pub fn is_retryable(&self) -> bool {
        self.tpm_code() == Some(tpm_rc::RETRY)
    }

    /// Errors raised before or outside a TPM round trip
    pub fn is_local(&self) -> bool {
        !matches!(self, Error::Protocol { .. })
    }
}

fn describe(code: &u32) -> &'static str {
    error_message(*code)
}

/// Human readable text for a TPM result code
pub fn error_message(code: u32) -> &'static str {
    match code {
        tpm_rc::SUCCESS => "Success",
        tpm_rc::AUTHFAIL => "Authentication failed",
        tpm_rc::BADINDEX => "The index to a PCR, DIR or other register is incorrect",
        tpm_rc::BAD_PARAMETER => "One or more parameter is bad",
        tpm_rc::AUDITFAILURE => "An operation completed successfully but the auditing of that operation failed",
        tpm_rc::CLEAR_DISABLED => "The clear disable flag is set and all clear operations now require physical access",
        tpm_rc::DEACTIVATED => "The TPM is deactivated",
        tpm_rc::DISABLED => "The TPM is disabled",
        tpm_rc::DISABLED_CMD => "The target command has been disabled",
        tpm_rc::FAIL => "The operation failed",
        tpm_rc::BAD_ORDINAL => "The ordinal was unknown or inconsistent",
        tpm_rc::INSTALL_DISABLED => "The ability to install an owner is disabled",
        tpm_rc::INVALID_KEYHANDLE => "The key handle can not be interpreted",
        tpm_rc::KEYNOTFOUND => "The key handle points to an invalid key",
        tpm_rc::INAPPROPRIATE_ENC => "Unacceptable encryption scheme",
        tpm_rc::MIGRATEFAIL => "Migration authorization failed",
        tpm_rc::INVALID_PCR_INFO => "PCR information could not be interpreted",
        tpm_rc::NOSPACE => "No room to load key",
        tpm_rc::NOSRK => "There is no SRK set",
        tpm_rc::NOTSEALED_BLOB => "An encrypted blob is invalid or was not created by this TPM",
        tpm_rc::OWNER_SET => "There is already an Owner",
        tpm_rc::RESOURCES => "The TPM has insufficient internal resources to perform the requested action",
        tpm_rc::SHORTRANDOM => "A random string was too short",
        tpm_rc::SIZE => "The TPM does not have the space to perform the operation",
        tpm_rc::WRONGPCRVAL => "The named PCR value does not match the current PCR value",
        tpm_rc::BAD_PARAM_SIZE => "The paramSize argument to the command has the incorrect value",
        tpm_rc::SHA_THREAD => "There is no existing SHA-1 thread",
        tpm_rc::SHA_ERROR => "The calculation is unable to proceed because the existing SHA-1 thread has already encountered an error",
        tpm_rc::FAILEDSELFTEST => "Self-test has failed and the TPM has shut down",
        tpm_rc::AUTH2FAIL => "The authorization for the second key in a 2 key function failed authorization",
        tpm_rc::BADTAG => "The tag value sent to for a command is invalid",
        tpm_rc::IOERROR => "An IO error occurred transmitting information to the TPM",
        tpm_rc::ENCRYPT_ERROR => "The encryption process had a problem",
        tpm_rc::DECRYPT_ERROR => "The decryption process did not complete",
        tpm_rc::INVALID_AUTHHANDLE => "An invalid handle was used",
        tpm_rc::NO_ENDORSEMENT => "The TPM does not have an Endorsement Key installed",
        tpm_rc::INVALID_KEYUSAGE => "The usage of a key is not allowed",
        tpm_rc::WRONG_ENTITYTYPE => "The submitted entity type is not allowed",
        tpm_rc::INVALID_POSTINIT => "The command was received in the wrong sequence relative to TPM_Init and a subsequent TPM_Startup",
        tpm_rc::INAPPROPRIATE_SIG => "Signed data cannot include additional DER information",
        tpm_rc::BAD_KEY_PROPERTY => "The key properties in TPM_KEY_PARMs are not supported by this TPM",
        tpm_rc::BAD_MIGRATION => "The migration properties of this key are incorrect",
        tpm_rc::BAD_SCHEME => "The signature or encryption scheme for this key is incorrect or not permitted in this situation",
        tpm_rc::BAD_DATASIZE => "The size of the data (or blob) parameter is bad or inconsistent with the referenced key",
        tpm_rc::BAD_MODE => "A mode parameter is bad",
        tpm_rc::BAD_PRESENCE => "Either the physicalPresence or physicalPresenceLock bits have the wrong value",
        tpm_rc::BAD_VERSION => "The TPM cannot perform this version of the capability",
        tpm_rc::NO_WRAP_TRANSPORT => "The TPM does not allow for wrapped transport sessions",
        tpm_rc::AUDITFAIL_UNSUCCESSFUL => "TPM audit construction failed and the underlying command was returning a failure code also",
        tpm_rc::AUDITFAIL_SUCCESSFUL => "TPM audit construction failed and the underlying command was returning success",
        tpm_rc::NOTRESETABLE => "Attempt to reset a PCR register that does not have the resettable attribute",
        tpm_rc::NOTLOCAL => "Attempt to reset a PCR register that requires locality and locality modifier not part of command transport",
        tpm_rc::BAD_TYPE => "Make identity blob not properly typed",
        tpm_rc::INVALID_RESOURCE => "When saving context identified resource type does not match actual resource",
        tpm_rc::NOTFIPS => "The TPM is attempting to execute a command only available when in FIPS mode",
        tpm_rc::INVALID_FAMILY => "The command is attempting to use an invalid family ID",
        tpm_rc::NO_NV_PERMISSION => "The permission to manipulate the NV storage is not available",
        tpm_rc::REQUIRES_SIGN => "The operation requires a signed command",
        tpm_rc::KEY_NOTSUPPORTED => "Wrong operation to load an NV key",
        tpm_rc::AUTH_CONFLICT => "NV_LoadKey blob requires both owner and blob authorization",
        tpm_rc::AREA_LOCKED => "The NV area is locked and not writable",
        tpm_rc::BAD_LOCALITY => "The locality is incorrect for the attempted operation",
        tpm_rc::READ_ONLY => "The NV area is read only and can't be written to",
        tpm_rc::PER_NOWRITE => "There is no protection on the write to the NV area",
        tpm_rc::FAMILYCOUNT => "The family count value does not match",
        tpm_rc::WRITE_LOCKED => "The NV area has already been written to",
        tpm_rc::BAD_ATTRIBUTES => "The NV area attributes conflict",
        tpm_rc::INVALID_STRUCTURE => "The structure tag and version are invalid or inconsistent",
        tpm_rc::KEY_OWNER_CONTROL => "The key is under control of the TPM Owner and can only be evicted by the TPM Owner",
        tpm_rc::BAD_COUNTER => "The counter handle is incorrect",
        tpm_rc::NOT_FULLWRITE => "The write is not a complete write of the area",
        tpm_rc::CONTEXT_GAP => "The gap between saved context counts is too large",
        tpm_rc::MAXNVWRITES => "The maximum number of NV writes without an owner has been exceeded",
        tpm_rc::NOOPERATOR => "No operator AuthData value is set",
        tpm_rc::RESOURCEMISSING => "The resource pointed to by context is not loaded",
        tpm_rc::DELEGATE_LOCK => "The delegate administration is locked",
        tpm_rc::DELEGATE_FAMILY => "Attempt to manage a family other than the delegated family",
        tpm_rc::DELEGATE_ADMIN => "Delegation table management not enabled",
        tpm_rc::TRANSPORT_NOTEXCLUSIVE => "There was a command executed outside of an exclusive transport session",
        tpm_rc::OWNER_CONTROL => "Attempt to context save an owner evict controlled key",
        tpm_rc::DAA_RESOURCES => "The DAA command has no resources available to execute the command",
        tpm_rc::DAA_INPUT_DATA0 => "The consistency check on DAA parameter inputData0 has failed",
        tpm_rc::DAA_INPUT_DATA1 => "The consistency check on DAA parameter inputData1 has failed",
        tpm_rc::DAA_ISSUER_SETTINGS => "The consistency check on DAA_issuerSettings has failed",
        tpm_rc::DAA_TPM_SETTINGS => "The consistency check on DAA_tpmSpecific has failed",
        tpm_rc::DAA_STAGE => "The atomic process indicated by the submitted DAA command is not the expected process",
        tpm_rc::DAA_ISSUER_VALIDITY => "The issuer's validity check has detected an inconsistency",
        tpm_rc::DAA_WRONG_W => "The consistency check on w has failed",
        tpm_rc::BAD_HANDLE => "The handle is incorrect",
        tpm_rc::BAD_DELEGATE => "Delegation is not correct",
        tpm_rc::BADCONTEXT => "The context blob is invalid",
        tpm_rc::TOOMANYCONTEXTS => "Too many contexts held by the TPM",
        tpm_rc::MA_TICKET_SIGNATURE => "Migration authority signature validation failure",
        tpm_rc::MA_DESTINATION => "Migration destination not authenticated",
        tpm_rc::MA_SOURCE => "Migration source incorrect",
        tpm_rc::MA_AUTHORITY => "Incorrect migration authority",
        tpm_rc::PERMANENTEK => "Attempt to revoke the EK and the EK is not revocable",
        tpm_rc::BAD_SIGNATURE => "Bad signature of CMK ticket",
        tpm_rc::NOCONTEXTSPACE => "There is no room in the context list for additional contexts",
        tpm_rc::RETRY => "The TPM is too busy to respond to the command immediately, but the command could be resubmitted at a later time",
        tpm_rc::NEEDS_SELFTEST => "TPM_ContinueSelfTest has not been run",
        tpm_rc::DOING_SELFTEST => "The TPM is currently executing the actions of TPM_ContinueSelfTest",
        tpm_rc::DEFEND_LOCK_RUNNING => "The TPM is defending against dictionary attacks and is in some time-out period",
        _ => "Unknown TPM error",
    }
}
