//! Fixed 16-byte layout written to the card's data block.
//!
//! | Offset | Len | Field     | Encoding                         |
//! |--------|-----|-----------|----------------------------------|
//! | 0      | 4   | Magic     | ASCII `HOTL`                     |
//! | 4      | 4   | Room      | ASCII, truncated, zero-filled    |
//! | 8      | 4   | Check-in  | Unix seconds, little-endian u32  |
//! | 12     | 4   | Check-out | Unix seconds, little-endian u32  |

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Issuer magic at the start of every encoded block.
pub const CARD_MAGIC: [u8; 4] = *b"HOTL";

/// Total size of an encoded layout (one MIFARE Classic block).
pub const LAYOUT_LEN: usize = 16;

/// Maximum room characters stored on the card.
pub const ROOM_FIELD_LEN: usize = 4;

/// Default stay length when the job carries no check-out time.
const DEFAULT_STAY_HOURS: i64 = 24;

/// Errors raised while building or parsing a card layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CardError {
    #[error("Invalid card payload: {0}")]
    InvalidPayload(String),

    #[error("Timestamp {0} does not fit in 32 bits")]
    TimestampOutOfRange(i64),

    #[error("Invalid card layout: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Card was not issued by this system (magic {0:02X?})")]
    ForeignCard([u8; 4]),
}

/// What the cloud asks us to put on a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardPayload {
    pub room_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_out: Option<DateTime<Utc>>,
}

/// Decoded contents of a card block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardLayout {
    /// Room identifier with zero padding stripped.
    pub room: String,
    pub check_in: u32,
    pub check_out: u32,
}

impl CardLayout {
    /// Build a layout from a cloud payload.
    ///
    /// A missing check-in defaults to `now`; a missing check-out defaults to
    /// one day after check-in.
    pub fn from_payload(payload: &CardPayload, now: DateTime<Utc>) -> Result<Self, CardError> {
        let room = payload.room_number.trim();
        if room.is_empty() {
            return Err(CardError::InvalidPayload("room number is empty".into()));
        }
        if !room.chars().all(|c| c.is_ascii() && c != '\0') {
            return Err(CardError::InvalidPayload(format!(
                "room number {room:?} is not plain ASCII"
            )));
        }

        let check_in = payload.check_in.unwrap_or(now);
        let check_out = payload
            .check_out
            .unwrap_or_else(|| check_in + Duration::hours(DEFAULT_STAY_HOURS));

        Ok(Self {
            room: room.chars().take(ROOM_FIELD_LEN).collect(),
            check_in: to_u32_seconds(check_in)?,
            check_out: to_u32_seconds(check_out)?,
        })
    }

    /// Serialize into the on-card byte layout.
    pub fn encode(&self) -> [u8; LAYOUT_LEN] {
        let mut buf = [0u8; LAYOUT_LEN];
        buf[0..4].copy_from_slice(&CARD_MAGIC);
        for (slot, byte) in buf[4..8].iter_mut().zip(self.room.bytes()) {
            *slot = byte;
        }
        buf[8..12].copy_from_slice(&self.check_in.to_le_bytes());
        buf[12..16].copy_from_slice(&self.check_out.to_le_bytes());
        buf
    }

    /// Parse a block read back from a card.
    pub fn decode(bytes: &[u8]) -> Result<Self, CardError> {
        let bytes: &[u8; LAYOUT_LEN] = bytes.try_into().map_err(|_| CardError::InvalidLength {
            expected: LAYOUT_LEN,
            actual: bytes.len(),
        })?;

        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != CARD_MAGIC {
            return Err(CardError::ForeignCard(magic));
        }

        let room_bytes: Vec<u8> = bytes[4..8]
            .iter()
            .copied()
            .take_while(|b| *b != 0)
            .collect();
        let room = String::from_utf8(room_bytes)
            .map_err(|_| CardError::InvalidPayload("room field is not ASCII".into()))?;

        Ok(Self {
            room,
            check_in: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            check_out: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }
}

fn to_u32_seconds(at: DateTime<Utc>) -> Result<u32, CardError> {
    let secs = at.timestamp();
    u32::try_from(secs).map_err(|_| CardError::TimestampOutOfRange(secs))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn payload(room: &str, check_in: Option<i64>, check_out: Option<i64>) -> CardPayload {
        CardPayload {
            room_number: room.into(),
            check_in: check_in.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
            check_out: check_out.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
        }
    }

    #[test]
    fn encodes_fixed_offsets() {
        let layout = CardLayout::from_payload(
            &payload("101", Some(1_704_117_600), Some(1_704_279_600)),
            Utc::now(),
        )
        .unwrap();
        let bytes = layout.encode();

        assert_eq!(bytes.len(), LAYOUT_LEN);
        assert_eq!(&bytes[0..4], b"HOTL");
        assert_eq!(&bytes[4..8], b"101\0");
        assert_eq!(&bytes[8..12], &1_704_117_600u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &1_704_279_600u32.to_le_bytes());
    }

    #[test]
    fn round_trip_recovers_room_and_times() {
        for (ts1, ts2) in [(0, u32::MAX), (1_704_117_600, 1_704_279_600), (u32::MAX, 0)] {
            let original = CardLayout::from_payload(
                &payload("101", Some(i64::from(ts1)), Some(i64::from(ts2))),
                Utc::now(),
            )
            .unwrap();
            let decoded = CardLayout::decode(&original.encode()).unwrap();
            assert_eq!(decoded.room, "101");
            assert_eq!(decoded.check_in, ts1);
            assert_eq!(decoded.check_out, ts2);
        }
    }

    #[test]
    fn long_room_is_truncated() {
        let layout =
            CardLayout::from_payload(&payload("12345", Some(10), Some(20)), Utc::now()).unwrap();
        assert_eq!(layout.room, "1234");
        assert_eq!(&layout.encode()[4..8], b"1234");
    }

    #[test]
    fn missing_times_default_to_now_plus_one_day() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let layout = CardLayout::from_payload(&payload("7", None, None), now).unwrap();
        assert_eq!(layout.check_in, 1_700_000_000);
        assert_eq!(layout.check_out, 1_700_000_000 + 86_400);
    }

    #[test]
    fn rejects_unrepresentable_timestamps() {
        let err = CardLayout::from_payload(&payload("7", Some(-1), Some(10)), Utc::now())
            .unwrap_err();
        assert_eq!(err, CardError::TimestampOutOfRange(-1));

        let too_late = i64::from(u32::MAX) + 1;
        let err = CardLayout::from_payload(&payload("7", Some(10), Some(too_late)), Utc::now())
            .unwrap_err();
        assert_eq!(err, CardError::TimestampOutOfRange(too_late));
    }

    #[test]
    fn rejects_empty_and_non_ascii_rooms() {
        assert!(matches!(
            CardLayout::from_payload(&payload("  ", None, None), Utc::now()),
            Err(CardError::InvalidPayload(_))
        ));
        assert!(matches!(
            CardLayout::from_payload(&payload("Zé1", None, None), Utc::now()),
            Err(CardError::InvalidPayload(_))
        ));
    }

    #[test]
    fn decode_rejects_wrong_length_and_magic() {
        assert_eq!(
            CardLayout::decode(&[0u8; 15]),
            Err(CardError::InvalidLength {
                expected: 16,
                actual: 15
            })
        );
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(b"ABCD");
        assert_eq!(
            CardLayout::decode(&bytes),
            Err(CardError::ForeignCard(*b"ABCD"))
        );
    }

    #[test]
    fn payload_deserializes_iso8601() {
        let p: CardPayload = serde_json::from_str(
            r#"{"roomNumber":"204","checkIn":"2024-01-01T14:00:00Z","checkOut":"2024-01-03T11:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(p.room_number, "204");
        assert_eq!(p.check_in.unwrap().timestamp(), 1_704_117_600);
        assert_eq!(p.check_out.unwrap().timestamp(), 1_704_279_600);
    }
}
