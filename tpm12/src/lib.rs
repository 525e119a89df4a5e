// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 1.2 command library
//!
//! This crate marshals TPM 1.2 commands, authorizes them with OIAP/OSAP
//! sessions, exchanges them with the TPM and verifies the authorization of
//! every response before decoding it.
//!
//! ## Features
//!
//! - **Three transports**: TCP (software TPM), character device
//!   (`/dev/tpm0`) and Unix socket, selected by configuration
//! - **Verified sessions**: response HMACs are always checked; a mismatch is
//!   an error, never a warning
//! - **Thread safe**: one command in flight per TPM, whichever thread asks
//!
//! ## Supported Commands
//!
//! - Sessions: `OIAP`, `OSAP`, `TerminateHandle`, `FlushSpecific`
//! - Keys: `LoadKey`, `LoadKey2`, `EvictKey`, `GetPubKey`, `CreateWrapKey`, `Sign`
//! - Contexts: `SaveKeyContext`, `LoadKeyContext`, `SaveAuthContext`,
//!   `LoadAuthContext`, `SaveContext`, `LoadContext`
//! - Counters: `CreateCounter`, `IncrementCounter`, `ReadCounter`,
//!   `ReleaseCounter`, `ReleaseCounterOwner`
//! - PCR/DIR: `Extend`, `PcrRead`, `PCR_Reset`, `DirWriteAuth`, `DirRead`
//! - Maintenance: `Startup`, `SelfTestFull`, `ContinueSelfTest`,
//!   `GetTestResult`, `GetRandom`, `StirRandom`, `GetCapability`
//! - Audit: `GetAuditDigest`, `GetAuditDigestSigned`, `SetOrdinalAuditStatus`
//!
//! ## Example
//!
//! ```no_run
//! use tpm12::{AuthValue, SessionAuth, TpmConfig, TpmContext};
//!
//! let ctx = TpmContext::new(TpmConfig::from_env()?)?;
//! let random_bytes = ctx.get_random(32)?;
//!
//! let counter_auth = AuthValue::from_password("counter");
//! let mut session = ctx.oiap()?;
//! let value = ctx.increment_counter(1, SessionAuth::new(&mut session, &counter_auth))?;
//! # Ok::<(), tpm12::Error>(())
//! ```

mod commands;
mod constants;
mod device;
mod marshal;
mod session;
mod types;

pub mod auth;
pub mod config;
pub mod error;
pub mod pcr;
pub mod state;
pub mod transport;

pub use auth::AuthValue;
pub use commands::{AuditDigest, SignedAuditDigest, TpmContext};
pub use config::{LogConfig, RetryPolicy, TpmConfig, TransportConfig};
pub use constants::*;
pub use error::{error_message, Error, Result};
pub use types::*;

// Re-export device for advanced usage
pub use device::{TpmCommand, TpmDevice, TpmResponse};
pub use marshal::{CommandBuffer, Digest, Marshal, ResponseBuffer, Unmarshal};
pub use session::{AuthSession, SessionAuth, SessionKind};
pub use transport::Transport;
