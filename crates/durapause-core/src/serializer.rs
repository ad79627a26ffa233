// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Block wire format.
//!
//! ```text
//! +----------+----------+---------------------+
//! | encoding | metadata | payload ...         |
//! |  1 byte  |  1 byte  |                     |
//! +----------+----------+---------------------+
//! ```
//!
//! The leading byte selects the payload encoding. `0x00` is a JSON encoding of
//! the whole block; every other value is reserved for future encodings and is
//! rejected by this build. The metadata byte is carried verbatim and is
//! currently always `0x00`.

use crate::block::Block;
use crate::error::{PauseError, Result};

/// Supported block encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    /// Plain JSON encoding of the whole block.
    Json = 0x00,
}

impl Encoding {
    /// The format tag written as the first byte of a block.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Parse a format tag.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0x00 => Ok(Self::Json),
            other => Err(PauseError::UnknownEncoding(other)),
        }
    }
}

/// Encode a block with the given encoding and metadata byte.
pub fn serialize(block: &Block, encoding: Encoding, metadata: u8) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Json => {
            let payload = serde_json::to_vec(block)?;
            let mut out = Vec::with_capacity(payload.len() + 2);
            out.push(encoding.tag());
            out.push(metadata);
            out.extend_from_slice(&payload);
            Ok(out)
        }
    }
}

/// Decode a block, using the leading byte to select the encoding.
pub fn deserialize(bytes: &[u8]) -> Result<Block> {
    let Some((&tag, rest)) = bytes.split_first() else {
        return Err(PauseError::Integrity("empty block payload".to_string()));
    };

    match Encoding::from_tag(tag)? {
        Encoding::Json => {
            let Some((_metadata, payload)) = rest.split_first() else {
                return Err(PauseError::Integrity(
                    "block payload missing metadata byte".to_string(),
                ));
            };
            Ok(serde_json::from_slice(payload)?)
        }
    }
}
