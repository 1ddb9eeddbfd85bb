use bytes::BufMut as _;
use std::io;

const HEADER_LEN: usize = 4;

/// A decoded TURN channel-data frame.
pub struct Packet<'a> {
    channel: u16,
    payload: &'a [u8],
}

impl<'a> Packet<'a> {
    pub(crate) fn channel(&self) -> u16 {
        self.channel
    }

    pub(crate) fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

/// Whether a datagram looks like a channel-data frame (top two bits `01`).
pub(crate) fn is_channel_data(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN && data[0] & 0xC0 == 0x40
}

pub(crate) fn decode(data: &[u8]) -> Result<Packet<'_>, io::Error> {
    if data.len() < HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "channel data messages are at least 4 bytes long",
        ));
    }

    let (header, payload) = data.split_at(HEADER_LEN);

    let channel = u16::from_be_bytes([header[0], header[1]]);
    if !(0x4000..=0x7FFF).contains(&channel) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "channel number out of bounds",
        ));
    }

    let length = u16::from_be_bytes([header[2], header[3]]) as usize;

    // The declared length may be shorter than the datagram, never longer.
    if length > payload.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "channel data message specified {length} bytes but the payload is {} bytes",
                payload.len()
            ),
        ));
    }

    Ok(Packet {
        channel,
        payload: &payload[..length],
    })
}

/// Frame a payload for transmission on the given channel: 2-byte channel
/// number, 2-byte length, payload, no padding.
pub(crate) fn encode(channel: u16, payload: &[u8]) -> Vec<u8> {
    debug_assert!((0x4000..=0x7FFF).contains(&channel));
    debug_assert!(payload.len() <= u16::MAX as usize);

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.put_u16(channel);
    frame.put_u16(payload.len() as u16);
    frame.extend_from_slice(payload);

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip() {
        let frame = encode(0x4000, b"foobar");

        assert_eq!(&frame[..4], &[0x40, 0x00, 0x00, 0x06]);

        let packet = decode(&frame).unwrap();
        assert_eq!(packet.channel(), 0x4000);
        assert_eq!(packet.payload(), b"foobar");
    }

    #[test]
    fn accepts_a_declared_length_shorter_than_the_datagram() {
        let mut frame = encode(0x4001, b"foobar");
        frame.extend_from_slice(&[0, 0]); // trailing junk

        let packet = decode(&frame).unwrap();
        assert_eq!(packet.payload(), b"foobar");
    }

    #[test]
    fn rejects_a_declared_length_longer_than_the_datagram() {
        let mut frame = encode(0x4001, b"foobar");
        frame.truncate(8);

        assert!(decode(&frame).is_err());
    }

    #[test]
    fn rejects_channel_numbers_outside_the_turn_range() {
        assert!(decode(&[0x3F, 0xFF, 0x00, 0x00]).is_err());
        assert!(decode(&[0x80, 0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn channel_data_is_recognised_by_its_first_two_bits() {
        assert!(is_channel_data(&[0x40, 0x00, 0x00, 0x00]));
        assert!(is_channel_data(&[0x7F, 0xFF, 0x00, 0x00]));
        assert!(!is_channel_data(&[0x00, 0x01, 0x00, 0x00])); // STUN binding
        assert!(!is_channel_data(&[0x80, 0x00, 0x00, 0x00]));
        assert!(!is_channel_data(&[0x40, 0x00]));
    }
}
