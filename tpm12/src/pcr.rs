// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Host-side PCR arithmetic, for predicting register values

use crate::auth::sha1;
use crate::error::{Error, Result};
use crate::marshal::{CommandBuffer, Digest, Marshal};
use crate::types::PcrSelection;

/// PCR' = SHA1(PCR || value)
pub fn extend(current: &Digest, value: &Digest) -> Digest {
    sha1(&[current, value])
}

/// Fold `values` into `initial` in order
pub fn replay<'a>(initial: Digest, values: impl IntoIterator<Item = &'a Digest>) -> Digest {
    values.into_iter().fold(initial, |pcr, v| extend(&pcr, v))
}

/// SHA-1 of a TPM_PCR_COMPOSITE: the selection followed by the selected
/// values in ascending PCR order
pub fn composite_hash(selection: &PcrSelection, values: &[Digest]) -> Result<Digest> {
    let selected = selection.indices().len();
    if selected != values.len() {
        return Err(Error::Encoding(format!(
            "selection covers {selected} PCRs but {} values were given",
            values.len()
        )));
    }
    let mut buf = CommandBuffer::new();
    selection.marshal(&mut buf)?;
    buf.put_sized(&values.concat())?;
    Ok(sha1(&[buf.as_bytes()]))
}
