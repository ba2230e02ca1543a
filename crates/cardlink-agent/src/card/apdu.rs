//! PC/SC pseudo-APDUs for MIFARE Classic style readers.
//!
//! Every command is a single request/response exchange. A response is the
//! optional data field followed by the two status bytes; `90 00` is success.

use std::fmt;

use super::layout::LAYOUT_LEN;

/// Class byte for reader-level (pseudo) commands.
const CLA_READER: u8 = 0xFF;

const INS_GET_DATA: u8 = 0xCA;
const INS_LOAD_KEY: u8 = 0x82;
const INS_GENERAL_AUTHENTICATE: u8 = 0x86;
const INS_UPDATE_BINARY: u8 = 0xD6;

/// Status word for a successful exchange.
pub const SW_SUCCESS: (u8, u8) = (0x90, 0x00);

/// Transport-default MIFARE key.
pub const DEFAULT_KEY: [u8; 6] = [0xFF; 6];

/// Volatile key slot used for the load/authenticate pair.
pub const VOLATILE_KEY_SLOT: u8 = 0x00;

/// Key-A selector for General Authenticate.
pub const KEY_TYPE_A: u8 = 0x60;

/// Stage of the encode sequence, used in error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ReadUid,
    LoadKey,
    Authenticate,
    Write,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadUid => "read UID",
            Self::LoadKey => "load key",
            Self::Authenticate => "authenticate",
            Self::Write => "write block",
        })
    }
}

/// `FF CA 00 00 00`: read the card's UID.
pub fn get_uid() -> Vec<u8> {
    vec![CLA_READER, INS_GET_DATA, 0x00, 0x00, 0x00]
}

/// `FF 82 00 <slot> 06 <key>`: load a key into the reader's volatile memory.
pub fn load_key(slot: u8, key: &[u8; 6]) -> Vec<u8> {
    let mut cmd = vec![CLA_READER, INS_LOAD_KEY, 0x00, slot, 0x06];
    cmd.extend_from_slice(key);
    cmd
}

/// `FF 86 00 00 05 01 00 <block> <key type> <slot>`: authenticate a block.
pub fn authenticate(block: u8, key_type: u8, slot: u8) -> Vec<u8> {
    vec![
        CLA_READER,
        INS_GENERAL_AUTHENTICATE,
        0x00,
        0x00,
        0x05,
        0x01,
        0x00,
        block,
        key_type,
        slot,
    ]
}

/// `FF D6 00 <block> 10 <16 bytes>`: write one block.
#[allow(clippy::cast_possible_truncation)]
pub fn update_binary(block: u8, data: &[u8; LAYOUT_LEN]) -> Vec<u8> {
    let mut cmd = vec![CLA_READER, INS_UPDATE_BINARY, 0x00, block, LAYOUT_LEN as u8];
    cmd.extend_from_slice(data);
    cmd
}

/// A parsed reader response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl Response {
    /// Split a raw response into data and status word.
    ///
    /// Returns `None` when the response is too short to carry a status word.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let split = raw.len().checked_sub(2)?;
        let (data, sw) = raw.split_at(split);
        Some(Self {
            data: data.to_vec(),
            sw1: sw[0],
            sw2: sw[1],
        })
    }

    pub fn is_success(&self) -> bool {
        (self.sw1, self.sw2) == SW_SUCCESS
    }
}
