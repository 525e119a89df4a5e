// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Argument parsing shared by every subcommand

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use fs_err as fs;
use tpm12::{AuthValue, Digest, Unmarshal};

fn strip_hex_prefix(s: &str) -> Option<&str> {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
}

/// Handles are hex, with or without a `0x` prefix
pub fn parse_handle(s: &str) -> Result<u32, String> {
    let digits = strip_hex_prefix(s).unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid handle {s:?}: {e}"))
}

/// Decimal, or hex when prefixed with `0x`
pub fn parse_number(s: &str) -> Result<u32, String> {
    match strip_hex_prefix(s) {
        Some(digits) => u32::from_str_radix(digits, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid number {s:?}: {e}"))
}

pub fn parse_digest(s: &str) -> Result<Digest, String> {
    let bytes = hex::decode(strip_hex_prefix(s).unwrap_or(s))
        .map_err(|e| format!("invalid hex {s:?}: {e}"))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("expected a 20 byte digest, got {} bytes", b.len()))
}

pub fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    hex::decode(strip_hex_prefix(s).unwrap_or(s)).map_err(|e| format!("invalid hex {s:?}: {e}"))
}

/// An authorization secret given as a password or as a file holding the
/// raw 20-byte value
pub fn secret(password: Option<&str>, file: Option<&Path>) -> Result<Option<AuthValue>> {
    match (password, file) {
        (Some(_), Some(_)) => bail!("give either a password or a password file, not both"),
        (Some(password), None) => Ok(Some(AuthValue::from_password(password))),
        (None, Some(path)) => {
            let raw = fs::read(path)?;
            AuthValue::from_slice(&raw)
                .map(Some)
                .map_err(|e| anyhow!("{}: {e}", path.display()))
        }
        (None, None) => Ok(None),
    }
}

pub fn required_secret(
    password: Option<&str>,
    file: Option<&Path>,
    what: &str,
) -> Result<AuthValue> {
    secret(password, file)?.with_context(|| format!("{what} password is required"))
}

/// Decode a TPM structure stored in a file
pub fn read_structure<T: Unmarshal>(path: &Path) -> Result<T> {
    let data = fs::read(path)?;
    T::from_bytes(&data).map_err(|e| anyhow!("{}: {e}", path.display()))
}

/// Fixed-size label, zero padded
pub fn label<const N: usize>(s: &str) -> Result<[u8; N]> {
    let bytes = s.as_bytes();
    if bytes.len() > N {
        bail!("label {s:?} is longer than {N} bytes");
    }
    let mut out = [0u8; N];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}
