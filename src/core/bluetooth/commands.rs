//! Unlock command encoding
//! This module builds the 16-byte command block written to the unlock characteristic.

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use serde::{Deserialize, Serialize};

use crate::core::bluetooth::constants::COMMAND_BLOCK_LEN;
use crate::error::EncodeError;

/// Order of the two plaintext parts inside the command block.
/// Fixed per deployment, it has to match the controller firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaintextLayout {
    #[default]
    KeyThenPayload,
    PayloadThenKey,
}

/// An encrypted command ready to be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockCommand([u8; COMMAND_BLOCK_LEN]);

impl UnlockCommand {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Builds the zero-padded plaintext block.
pub fn plaintext_block(
    layout: PlaintextLayout,
    key_material: &[u8],
    last_payload: &[u8],
) -> Result<[u8; COMMAND_BLOCK_LEN], EncodeError> {
    let len = key_material.len() + last_payload.len();
    if len > COMMAND_BLOCK_LEN {
        return Err(EncodeError::BlockOverflow { len });
    }

    let (first, second) = match layout {
        PlaintextLayout::KeyThenPayload => (key_material, last_payload),
        PlaintextLayout::PayloadThenKey => (last_payload, key_material),
    };

    let mut block = [0u8; COMMAND_BLOCK_LEN];
    block[..first.len()].copy_from_slice(first);
    block[first.len()..len].copy_from_slice(second);
    Ok(block)
}

/// Encrypts the command block with AES-128 in ECB mode, no padding.
/// `static_code` is the raw key. Pure: equal inputs give equal output.
pub fn encode(
    layout: PlaintextLayout,
    key_material: &[u8],
    static_code: &[u8],
    last_payload: &[u8],
) -> Result<UnlockCommand, EncodeError> {
    let block = plaintext_block(layout, key_material, last_payload)?;
    let cipher = Aes128::new_from_slice(static_code).map_err(|_| EncodeError::InvalidKeyLength {
        len: static_code.len(),
    })?;

    let mut block = GenericArray::clone_from_slice(&block);
    cipher.encrypt_block(&mut block);

    let mut ciphertext = [0u8; COMMAND_BLOCK_LEN];
    ciphertext.copy_from_slice(&block);
    Ok(UnlockCommand(ciphertext))
}
