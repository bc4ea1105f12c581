use byteorder::{ByteOrder, LittleEndian};

/// Bytes in front of the event data: u64 stream hash, i64 version.
pub const EVENT_HEADER_SIZE: usize = 16;

/// An event as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub stream_hash: u64,
    pub version: i64,
    /// Log position of the record holding the event.
    pub position: i64,
    pub data: Vec<u8>,
}

pub fn encode_event(stream_hash: u64, version: i64, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; EVENT_HEADER_SIZE + data.len()];
    LittleEndian::write_u64(&mut buf[0..8], stream_hash);
    LittleEndian::write_i64(&mut buf[8..16], version);
    buf[EVENT_HEADER_SIZE..].copy_from_slice(data);
    buf
}

/// Returns `None` if the payload is too short to hold an event.
pub fn decode_event(position: i64, payload: &[u8]) -> Option<Event> {
    if payload.len() < EVENT_HEADER_SIZE {
        return None;
    }
    Some(Event {
        stream_hash: LittleEndian::read_u64(&payload[0..8]),
        version: LittleEndian::read_i64(&payload[8..16]),
        position,
        data: payload[EVENT_HEADER_SIZE..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope() {
        let payload = encode_event(0xDEAD_BEEF_0000_0001, 42, b"body");
        assert_eq!(payload.len(), EVENT_HEADER_SIZE + 4);

        let event = decode_event(512, &payload).expect("event");
        assert_eq!(event.stream_hash, 0xDEAD_BEEF_0000_0001);
        assert_eq!(event.version, 42);
        assert_eq!(event.position, 512);
        assert_eq!(event.data, b"body");

        assert!(decode_event(0, &payload[..15]).is_none());
    }
}
