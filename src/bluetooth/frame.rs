/// DSD TECH relay command frames
///
/// Frame layout written to the relay's FFE1 characteristic:
/// - Byte 0: sync (0xA1)
/// - Bytes 1-2: password, big-endian (factory default 1234 = 0x04D2)
/// - Byte 3: opcode
/// - Bytes 4..: content
/// - Next byte: XOR of every preceding byte, sync included
/// - Last byte: terminator (0xAA)
const SYNC: u8 = 0xA1;
const TERMINATOR: u8 = 0xAA;
const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    OnNow = 0x01,
    OffNow = 0x02,
}

/// One relay command; immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    password: u16,
    opcode: u8,
    content: Vec<u8>,
}

impl RelayFrame {
    pub fn new(password: u16, opcode: u8, content: &[u8]) -> Self {
        debug_assert!(content.len() <= 255, "relay frame content too long");
        Self {
            password,
            opcode,
            content: content.to_vec(),
        }
    }

    pub fn on_now(password: u16, channel: u8) -> Self {
        Self::new(password, Opcode::OnNow as u8, &[channel])
    }

    pub fn off_now(password: u16, channel: u8) -> Self {
        Self::new(password, Opcode::OffNow as u8, &[channel])
    }

    pub fn encode(&self) -> Vec<u8> {
        let frame = encode(self.password, self.opcode, &self.content);
        debug_assert!(checksum_valid(&frame));
        frame
    }
}

fn xor_all(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

pub fn encode(password: u16, opcode: u8, content: &[u8]) -> Vec<u8> {
    let [pwd_hi, pwd_lo] = password.to_be_bytes();
    let mut frame = Vec::with_capacity(HEADER_LEN + content.len() + 2);
    frame.extend_from_slice(&[SYNC, pwd_hi, pwd_lo, opcode]);
    frame.extend_from_slice(content);
    let checksum = xor_all(&frame);
    frame.push(checksum);
    frame.push(TERMINATOR);
    frame
}

/// Check sync, terminator and checksum of an encoded frame.
pub fn checksum_valid(frame: &[u8]) -> bool {
    let [body @ .., checksum, terminator] = frame else {
        return false;
    };
    body.len() >= HEADER_LEN && body[0] == SYNC && *terminator == TERMINATOR && xor_all(body) == *checksum
}
