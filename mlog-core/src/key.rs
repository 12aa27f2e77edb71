//! Key/column codec — spec §3, §4.A.
//!
//! All multi-byte fields are big-endian so that column-lexicographic order
//! (plain `Vec<u8>`/`[u8]` `Ord`) matches field order.

use crate::error::{LogError, Result};

/// Width of one timeslice, in microseconds. Wire format; never changes.
pub const TIMESLICE_INTERVAL: i64 = 100_000_000;

/// Reserved partition id for the system/settings partition.
pub const SYSTEM_PARTITION: u32 = 0xFFFF_FFFF;

/// System column tag: the send-side message counter.
const TAG_MESSAGE_COUNTER: u8 = 1;
/// System column tag: a per-(partition, bucket) read marker.
const TAG_READ_MARKER: u8 = 2;

/// `floor(timestamp_micros / TIMESLICE_INTERVAL)`, checked against the i32
/// row-key field width.
pub fn timeslice(timestamp_micros: i64) -> Result<i32> {
    let slice = timestamp_micros.div_euclid(TIMESLICE_INTERVAL);
    i32::try_from(slice)
        .map_err(|_| LogError::InvalidArgument(format!("timeslice {slice} overflows i32")))
}

/// Left-shift a partition id into the top `partition_bit_width` bits of a
/// u32, per spec §3. `partition_bit_width` of 0 always yields 0.
fn shift_partition(partition_id: u32, partition_bit_width: u8) -> u32 {
    if partition_bit_width == 0 {
        0
    } else {
        partition_id.wrapping_shl(32 - partition_bit_width as u32)
    }
}

/// Builds the 12-byte big-endian row key for a message row.
pub fn log_key(
    partition_id: u32,
    bucket_id: u32,
    num_buckets: u32,
    timeslice: i32,
    partition_bit_width: u8,
) -> Result<[u8; 12]> {
    if bucket_id >= num_buckets {
        return Err(LogError::InvalidArgument(format!(
            "bucket {bucket_id} out of range [0, {num_buckets})"
        )));
    }
    let mut out = [0u8; 12];
    out[0..4].copy_from_slice(&shift_partition(partition_id, partition_bit_width).to_be_bytes());
    out[4..8].copy_from_slice(&bucket_id.to_be_bytes());
    out[8..12].copy_from_slice(&(timeslice as u32).to_be_bytes());
    Ok(out)
}

/// Builds the reserved-partition setting key: `0xFFFFFFFF || len(id) || id`.
pub fn setting_key(identifier: &str) -> Vec<u8> {
    let id_bytes = identifier.as_bytes();
    let mut out = Vec::with_capacity(4 + 4 + id_bytes.len());
    out.extend_from_slice(&SYSTEM_PARTITION.to_be_bytes());
    out.extend_from_slice(&(id_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(id_bytes);
    out
}

/// The single-byte message-counter column.
pub fn message_counter_column() -> Vec<u8> {
    vec![TAG_MESSAGE_COUNTER]
}

/// The 9-byte per-(partition, bucket) read-marker column.
pub fn marker_column(partition_id: u32, bucket_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(TAG_READ_MARKER);
    out.extend_from_slice(&partition_id.to_be_bytes());
    out.extend_from_slice(&bucket_id.to_be_bytes());
    out
}

/// A decoded message entry (spec §3 "Message entry").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedMessage {
    pub timestamp_micros: i64,
    pub sender_id: String,
    pub payload: Vec<u8>,
}

/// The column/value pair a `KvStore` row addition is made of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub column: Vec<u8>,
    pub value: Vec<u8>,
}

/// Encodes one message into its column (`timestamp || senderId || sequence`)
/// and value (the raw payload), per spec §3/§4.A.
pub fn encode_message(
    timestamp_micros: i64,
    sender_id: &str,
    sequence_number: i64,
    payload: &[u8],
) -> Entry {
    let sender_bytes = sender_id.as_bytes();
    let mut column = Vec::with_capacity(8 + 4 + sender_bytes.len() + 8);
    column.extend_from_slice(&timestamp_micros.to_be_bytes());
    column.extend_from_slice(&(sender_bytes.len() as u32).to_be_bytes());
    column.extend_from_slice(sender_bytes);
    column.extend_from_slice(&sequence_number.to_be_bytes());
    Entry {
        column,
        value: payload.to_vec(),
    }
}

/// Decodes the timestamp and sender out of a column; the payload is simply
/// the entry's value. The sequence number is present in the column but, per
/// spec §4.A, not needed on the read side.
pub fn decode_message(entry: &Entry) -> Result<DecodedMessage> {
    let col = &entry.column;
    if col.len() < 12 {
        return Err(LogError::InvalidArgument(format!(
            "message column too short: {} bytes",
            col.len()
        )));
    }
    let timestamp_micros = i64::from_be_bytes(col[0..8].try_into().unwrap());
    let sender_len = u32::from_be_bytes(col[8..12].try_into().unwrap()) as usize;
    let sender_start = 12;
    let sender_end = sender_start
        .checked_add(sender_len)
        .filter(|&end| end <= col.len())
        .ok_or_else(|| LogError::InvalidArgument("message column truncated".to_string()))?;
    let sender_id = String::from_utf8(col[sender_start..sender_end].to_vec())
        .map_err(|e| LogError::InvalidArgument(format!("sender id not utf8: {e}")))?;
    Ok(DecodedMessage {
        timestamp_micros,
        sender_id,
        payload: entry.value.clone(),
    })
}

/// Returns the lexicographic successor of `column` — the smallest byte
/// string strictly greater than it. Used to turn the saturation follow-up
/// query's lower bound from exclusive-of-last into inclusive-of-next.
pub fn successor(column: &[u8]) -> Vec<u8> {
    let mut out = column.to_vec();
    out.push(0);
    out
}

/// Encodes a bare microsecond timestamp as an 8-byte big-endian column
/// prefix, used as a range bound.
pub fn timestamp_bound(timestamp_micros: i64) -> Vec<u8> {
    timestamp_micros.to_be_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeslice_floors_to_the_window() {
        assert_eq!(timeslice(0).unwrap(), 0);
        assert_eq!(timeslice(TIMESLICE_INTERVAL - 1).unwrap(), 0);
        assert_eq!(timeslice(TIMESLICE_INTERVAL).unwrap(), 1);
        assert_eq!(timeslice(TIMESLICE_INTERVAL * 3 + 7).unwrap(), 3);
    }

    #[test]
    fn timeslice_overflow_is_invalid_argument() {
        let huge = (i32::MAX as i64 + 1) * TIMESLICE_INTERVAL;
        assert!(matches!(
            timeslice(huge),
            Err(LogError::InvalidArgument(_))
        ));
    }

    #[test]
    fn log_key_shifts_partition_to_top_bits() {
        let key = log_key(0xA, 0, 2, 0, 4).unwrap();
        // 0xA left-shifted by 28 bits = 0xA000_0000
        assert_eq!(&key[0..4], &0xA000_0000u32.to_be_bytes());
    }

    #[test]
    fn log_key_zero_width_partition_is_always_zero() {
        let key = log_key(0xFF, 1, 2, 0, 0).unwrap();
        assert_eq!(&key[0..4], &0u32.to_be_bytes());
    }

    #[test]
    fn log_key_rejects_out_of_range_bucket() {
        assert!(log_key(0, 2, 2, 0, 8).is_err());
    }

    #[test]
    fn setting_key_uses_reserved_partition() {
        let key = setting_key("s1");
        assert_eq!(&key[0..4], &SYSTEM_PARTITION.to_be_bytes());
        assert_eq!(&key[4..8], &2u32.to_be_bytes());
        assert_eq!(&key[8..], b"s1");
    }

    #[test]
    fn marker_column_layout() {
        let col = marker_column(7, 3);
        assert_eq!(col.len(), 9);
        assert_eq!(col[0], 2);
        assert_eq!(&col[1..5], &7u32.to_be_bytes());
        assert_eq!(&col[5..9], &3u32.to_be_bytes());
    }

    #[test]
    fn encode_decode_round_trip() {
        let entry = encode_message(1_234_567, "sender-1", 42, b"\xde\xad");
        let decoded = decode_message(&entry).unwrap();
        assert_eq!(decoded.timestamp_micros, 1_234_567);
        assert_eq!(decoded.sender_id, "sender-1");
        assert_eq!(decoded.payload, vec![0xde, 0xad]);
    }

    #[test]
    fn column_order_is_timestamp_order() {
        let a = encode_message(100, "s1", 1, b"a");
        let b = encode_message(101, "s1", 1, b"b");
        assert!(a.column < b.column);
    }

    #[test]
    fn successor_is_strictly_greater() {
        let col = encode_message(100, "s1", 1, b"a").column;
        assert!(successor(&col) > col);
    }
}
