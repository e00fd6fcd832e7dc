//! # AGV Link Codec
//!
//! Binary frames exchanged with the AGV controller over UDP. Every frame begins with a fixed
//! 28 byte header followed by a command specific payload. All multi-byte fields are little endian.
//!
//! Header layout:
//!
//! | Offset | Size | Field                                  |
//! |--------|------|----------------------------------------|
//! | 0x00   | 16   | Authorisation code (zeros)             |
//! | 0x10   | 1    | Protocol version (`0x01`)              |
//! | 0x11   | 1    | Frame kind (`0x00` req, `0x01` resp)   |
//! | 0x12   | 2    | Sequence number                        |
//! | 0x14   | 1    | Service code (`0x10`)                  |
//! | 0x15   | 1    | Command code                           |
//! | 0x16   | 1    | Execution code                         |
//! | 0x17   | 1    | Reserved                               |
//! | 0x18   | 2    | Payload length                         |
//! | 0x1A   | 2    | Reserved                               |
//!
//! No I/O is performed here, the UDP transport lives in the executable.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use byteorder::{ByteOrder, LittleEndian};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Length of the frame header in bytes.
pub const HEADER_LEN: usize = 28;

/// Length of the authorisation code at the start of the header.
pub const AUTH_CODE_LEN: usize = 16;

pub const PROTOCOL_VERSION: u8 = 0x01;

pub const SERVICE_CODE: u8 = 0x10;

/// Operational status code reported by an AGV with no active task.
pub const STATUS_IDLE: u8 = 0x00;

/// Length of the navigate command payload.
pub const NAVIGATE_PAYLOAD_LEN: usize = 12;

/// Number of bytes the ASCII point id occupies in the navigate payload.
const POINT_ID_LEN: usize = 8;

/// Offset of the point id within the navigate payload, after the four control bytes.
const POINT_ID_OFFSET: usize = 4;

// Status response blocks. Offsets are relative to the end of the header.
const LOCATION_OFFSET: usize = 0x04;
const LOCATION_LEN: usize = 16;
const RUNNING_OFFSET: usize = 0x24;
const RUNNING_LEN: usize = 14;
const TASK_OFFSET: usize = 0x38;
const TASK_HEADER_LEN: usize = 12;
const TASK_ITEM_LEN: usize = 8;
const BATTERY_LEN: usize = 4;

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Direction of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
}

/// Commands supported by the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    /// Start navigation to a point
    Navigate,

    /// Query the detailed running status
    QueryStatus,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum AgvCodecError {
    #[error("Malformed AGV frame: expected at least {expected} bytes but got {found}")]
    MalformedResponse { expected: usize, found: usize },

    #[error("Unexpected command code in AGV frame: {0:#04x}")]
    UnexpectedCommand(u8),

    #[error("The navigate payload does not contain a valid point id")]
    InvalidPointId,
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The fixed header carried by every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHeader {
    pub auth_code: [u8; AUTH_CODE_LEN],
    pub version: u8,
    pub kind: FrameKind,
    pub sequence: u16,
    pub service: u8,
    pub command: u8,
    pub exec_code: u8,
    pub payload_len: u16,
}

/// Builds outgoing request frames, numbering each one.
///
/// The sequence number starts at zero, increments after every frame and wraps at 16 bits. One
/// encoder should be owned by each transport instance.
#[derive(Debug, Default)]
pub struct FrameEncoder {
    next_sequence: u16,
}

/// Decoded status of the AGV.
///
/// Each block of the status response is independently optional, a short response simply leaves
/// the fields of the missing blocks unset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AgvStatus {
    /// Position along the X axis in metres
    pub x: Option<f32>,

    /// Position along the Y axis in metres
    pub y: Option<f32>,

    /// Forward velocity in metres per second
    pub vx: Option<f32>,

    /// Battery state of charge as a percentage (0-100)
    pub battery_soc: Option<f32>,

    pub operational_status: Option<u8>,

    /// Id of the last map point the AGV passed
    pub last_point_id: Option<u32>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl FrameKind {
    fn to_byte(self) -> u8 {
        match self {
            FrameKind::Request => 0x00,
            FrameKind::Response => 0x01,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => FrameKind::Request,
            _ => FrameKind::Response,
        }
    }
}

impl CommandCode {
    pub fn to_byte(self) -> u8 {
        match self {
            CommandCode::Navigate => 0x16,
            CommandCode::QueryStatus => 0xAF,
        }
    }
}

impl FrameHeader {
    /// Create the header of a request frame.
    pub fn request(sequence: u16, command: CommandCode, payload_len: u16) -> Self {
        Self {
            auth_code: [0; AUTH_CODE_LEN],
            version: PROTOCOL_VERSION,
            kind: FrameKind::Request,
            sequence,
            service: SERVICE_CODE,
            command: command.to_byte(),
            exec_code: 0,
            payload_len,
        }
    }

    /// Create the header of a response frame.
    pub fn response(sequence: u16, command: CommandCode, payload_len: u16) -> Self {
        Self {
            kind: FrameKind::Response,
            ..Self::request(sequence, command, payload_len)
        }
    }

    /// Serialise the header into its wire representation.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];

        buf[..AUTH_CODE_LEN].copy_from_slice(&self.auth_code);
        buf[0x10] = self.version;
        buf[0x11] = self.kind.to_byte();
        LittleEndian::write_u16(&mut buf[0x12..0x14], self.sequence);
        buf[0x14] = self.service;
        buf[0x15] = self.command;
        buf[0x16] = self.exec_code;
        LittleEndian::write_u16(&mut buf[0x18..0x1A], self.payload_len);

        buf
    }

    /// Parse the header from the start of a frame.
    pub fn parse(bytes: &[u8]) -> Result<Self, AgvCodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(AgvCodecError::MalformedResponse {
                expected: HEADER_LEN,
                found: bytes.len(),
            });
        }

        let mut auth_code = [0u8; AUTH_CODE_LEN];
        auth_code.copy_from_slice(&bytes[..AUTH_CODE_LEN]);

        Ok(Self {
            auth_code,
            version: bytes[0x10],
            kind: FrameKind::from_byte(bytes[0x11]),
            sequence: LittleEndian::read_u16(&bytes[0x12..0x14]),
            service: bytes[0x14],
            command: bytes[0x15],
            exec_code: bytes[0x16],
            payload_len: LittleEndian::read_u16(&bytes[0x18..0x1A]),
        })
    }
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an encoder whose next frame carries the given sequence number.
    pub fn starting_at(sequence: u16) -> Self {
        Self {
            next_sequence: sequence,
        }
    }

    /// The sequence number the next encoded frame will carry.
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence
    }

    /// Encode a navigate command to the given map point.
    ///
    /// The payload starts with four zero control bytes (start navigation, go to point, no path,
    /// no traffic management), then the point id written as ASCII decimal digits, zero padded or
    /// truncated to 8 bytes.
    pub fn encode_navigate(&mut self, target_point_id: u32) -> Vec<u8> {
        let mut payload = [0u8; NAVIGATE_PAYLOAD_LEN];

        let digits = target_point_id.to_string();
        let digits = digits.as_bytes();
        let len = digits.len().min(POINT_ID_LEN);
        payload[POINT_ID_OFFSET..POINT_ID_OFFSET + len].copy_from_slice(&digits[..len]);

        self.frame(CommandCode::Navigate, &payload)
    }

    /// Encode a detailed status query, which has no payload.
    pub fn encode_status_query(&mut self) -> Vec<u8> {
        self.frame(CommandCode::QueryStatus, &[])
    }

    fn frame(&mut self, command: CommandCode, payload: &[u8]) -> Vec<u8> {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let header = FrameHeader::request(sequence, command, payload.len() as u16);

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(payload);
        frame
    }
}

impl AgvStatus {
    /// True if the AGV reports that it has no active task.
    pub fn is_idle(&self) -> bool {
        self.operational_status == Some(STATUS_IDLE)
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Decode a detailed status response.
///
/// Buffers shorter than the header are rejected. Past the header each block is read only if the
/// buffer holds all of it:
///
/// - location (`+0x04`, 16 bytes): x, y, last passed point
/// - running (`+0x24`, 14 bytes): forward velocity, operational status
/// - task (`+0x38`, 12 bytes plus 8 per point and per path)
/// - battery (directly after the task block, 4 bytes): state of charge, scaled to a percentage
pub fn decode_status(bytes: &[u8]) -> Result<AgvStatus, AgvCodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(AgvCodecError::MalformedResponse {
            expected: HEADER_LEN,
            found: bytes.len(),
        });
    }

    let body = &bytes[HEADER_LEN..];
    let mut status = AgvStatus::default();

    if let Some(loc) = block(body, LOCATION_OFFSET, LOCATION_LEN) {
        status.x = Some(LittleEndian::read_f32(&loc[0x00..0x04]));
        status.y = Some(LittleEndian::read_f32(&loc[0x04..0x08]));
        status.last_point_id = Some(LittleEndian::read_u32(&loc[0x0C..0x10]));
    }

    if let Some(run) = block(body, RUNNING_OFFSET, RUNNING_LEN) {
        status.vx = Some(LittleEndian::read_f32(&run[0x00..0x04]));
        status.operational_status = Some(run[0x0D]);
    }

    if let Some(task) = block(body, TASK_OFFSET, TASK_HEADER_LEN) {
        let points = task[0x08] as usize;
        let paths = task[0x09] as usize;
        let task_len = TASK_HEADER_LEN + TASK_ITEM_LEN * (points + paths);

        if let Some(battery) = block(body, TASK_OFFSET + task_len, BATTERY_LEN) {
            status.battery_soc = Some(LittleEndian::read_f32(battery) * 100.0);
        }
    }

    Ok(status)
}

/// Recover the target point id from an encoded navigate frame.
pub fn decode_navigate_target(bytes: &[u8]) -> Result<u32, AgvCodecError> {
    let header = FrameHeader::parse(bytes)?;
    if header.command != CommandCode::Navigate.to_byte() {
        return Err(AgvCodecError::UnexpectedCommand(header.command));
    }

    let payload = block(&bytes[HEADER_LEN..], 0, NAVIGATE_PAYLOAD_LEN).ok_or(
        AgvCodecError::MalformedResponse {
            expected: HEADER_LEN + NAVIGATE_PAYLOAD_LEN,
            found: bytes.len(),
        },
    )?;

    let digits: Vec<u8> = payload[POINT_ID_OFFSET..]
        .iter()
        .copied()
        .take_while(|b| *b != 0)
        .collect();

    std::str::from_utf8(&digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(AgvCodecError::InvalidPointId)
}

/// Encode a detailed status response carrying the given status.
///
/// Used by the AGV simulator. Unset fields are written as zero and the task block is empty.
pub fn encode_status_response(sequence: u16, status: &AgvStatus) -> Vec<u8> {
    let body_len = TASK_OFFSET + TASK_HEADER_LEN + BATTERY_LEN;
    let mut body = vec![0u8; body_len];

    let loc = &mut body[LOCATION_OFFSET..LOCATION_OFFSET + LOCATION_LEN];
    LittleEndian::write_f32(&mut loc[0x00..0x04], status.x.unwrap_or_default());
    LittleEndian::write_f32(&mut loc[0x04..0x08], status.y.unwrap_or_default());
    LittleEndian::write_u32(&mut loc[0x0C..0x10], status.last_point_id.unwrap_or_default());

    let run = &mut body[RUNNING_OFFSET..RUNNING_OFFSET + RUNNING_LEN];
    LittleEndian::write_f32(&mut run[0x00..0x04], status.vx.unwrap_or_default());
    run[0x0D] = status.operational_status.unwrap_or(STATUS_IDLE);

    let battery_offset = TASK_OFFSET + TASK_HEADER_LEN;
    LittleEndian::write_f32(
        &mut body[battery_offset..battery_offset + BATTERY_LEN],
        status.battery_soc.unwrap_or_default() / 100.0,
    );

    let header = FrameHeader::response(sequence, CommandCode::QueryStatus, body_len as u16);

    let mut frame = Vec::with_capacity(HEADER_LEN + body_len);
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&body);
    frame
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Borrow `len` bytes of `body` starting at `offset`, if they are all present.
fn block(body: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    body.get(offset..offset.checked_add(len)?)
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut enc = FrameEncoder::starting_at(0x1234);
        let frame = enc.encode_status_query();

        assert_eq!(frame.len(), HEADER_LEN);
        assert!(frame[..AUTH_CODE_LEN].iter().all(|b| *b == 0));
        assert_eq!(frame[0x10], 0x01);
        assert_eq!(frame[0x11], 0x00);
        assert_eq!(&frame[0x12..0x14], &[0x34, 0x12]);
        assert_eq!(frame[0x14], 0x10);
        assert_eq!(frame[0x15], 0xAF);
        assert_eq!(frame[0x16], 0x00);
        assert_eq!(&frame[0x18..0x1A], &[0x00, 0x00]);
    }

    #[test]
    fn test_navigate_payload() {
        let mut enc = FrameEncoder::new();
        let frame = enc.encode_navigate(1234);

        assert_eq!(frame.len(), HEADER_LEN + NAVIGATE_PAYLOAD_LEN);
        assert_eq!(frame[0x15], 0x16);
        assert_eq!(LittleEndian::read_u16(&frame[0x18..0x1A]), 12);
        assert_eq!(&frame[HEADER_LEN..HEADER_LEN + 4], &[0, 0, 0, 0]);
        assert_eq!(&frame[HEADER_LEN + 4..], b"1234\0\0\0\0");
    }

    #[test]
    fn test_navigate_truncates_long_ids() {
        let mut enc = FrameEncoder::new();
        let frame = enc.encode_navigate(1_234_567_890);

        assert_eq!(&frame[HEADER_LEN + 4..], b"12345678");
        assert_eq!(decode_navigate_target(&frame), Ok(12_345_678));
    }

    #[test]
    fn test_navigate_target_recovered() {
        let mut enc = FrameEncoder::new();
        for id in [0u32, 1, 7, 42, 1000, 31_337, 99_999_999].iter() {
            let frame = enc.encode_navigate(*id);
            assert_eq!(decode_navigate_target(&frame), Ok(*id));
        }
    }

    #[test]
    fn test_sequence_increments_and_wraps() {
        let mut enc = FrameEncoder::starting_at(u16::MAX - 1);

        let a = FrameHeader::parse(&enc.encode_status_query()).unwrap();
        let b = FrameHeader::parse(&enc.encode_navigate(3)).unwrap();
        let c = FrameHeader::parse(&enc.encode_status_query()).unwrap();

        assert_eq!(a.sequence, u16::MAX - 1);
        assert_eq!(b.sequence, u16::MAX);
        assert_eq!(c.sequence, 0);
        assert_eq!(enc.next_sequence(), 1);
    }

    #[test]
    fn test_short_status_is_malformed() {
        assert_eq!(
            decode_status(&[0u8; 27]),
            Err(AgvCodecError::MalformedResponse {
                expected: 28,
                found: 27
            })
        );
    }

    #[test]
    fn test_header_only_status_is_empty() {
        let status = decode_status(&[0u8; HEADER_LEN]).unwrap();
        assert_eq!(status, AgvStatus::default());
        assert!(!status.is_idle());
    }

    #[test]
    fn test_full_status_decode() {
        let sent = AgvStatus {
            x: Some(1.5),
            y: Some(-2.25),
            vx: Some(0.75),
            battery_soc: Some(50.0),
            operational_status: Some(0x02),
            last_point_id: Some(88),
        };
        let frame = encode_status_response(9, &sent);

        let header = FrameHeader::parse(&frame).unwrap();
        assert_eq!(header.kind, FrameKind::Response);
        assert_eq!(header.sequence, 9);
        assert_eq!(header.payload_len as usize, frame.len() - HEADER_LEN);

        assert_eq!(decode_status(&frame).unwrap(), sent);
    }

    #[test]
    fn test_partial_blocks() {
        let sent = AgvStatus {
            x: Some(3.0),
            y: Some(4.0),
            vx: Some(1.0),
            battery_soc: Some(25.0),
            operational_status: Some(STATUS_IDLE),
            last_point_id: Some(12),
        };
        let frame = encode_status_response(0, &sent);

        // Location block only
        let loc_only = &frame[..HEADER_LEN + LOCATION_OFFSET + LOCATION_LEN];
        let status = decode_status(loc_only).unwrap();
        assert_eq!(status.x, Some(3.0));
        assert_eq!(status.last_point_id, Some(12));
        assert_eq!(status.vx, None);
        assert_eq!(status.operational_status, None);
        assert_eq!(status.battery_soc, None);

        // Everything but the battery
        let no_battery = &frame[..HEADER_LEN + TASK_OFFSET + TASK_HEADER_LEN];
        let status = decode_status(no_battery).unwrap();
        assert!(status.is_idle());
        assert_eq!(status.vx, Some(1.0));
        assert_eq!(status.battery_soc, None);
    }

    #[test]
    fn test_battery_follows_task_items() {
        let mut frame = vec![0u8; HEADER_LEN + TASK_OFFSET + TASK_HEADER_LEN + 2 * TASK_ITEM_LEN];
        let task = HEADER_LEN + TASK_OFFSET;
        frame[task + 0x08] = 1;
        frame[task + 0x09] = 1;

        // Battery missing, the two task items consume the rest of the buffer
        assert_eq!(decode_status(&frame).unwrap().battery_soc, None);

        let mut soc = [0u8; 4];
        LittleEndian::write_f32(&mut soc, 0.5);
        frame.extend_from_slice(&soc);
        assert_eq!(decode_status(&frame).unwrap().battery_soc, Some(50.0));
    }
}
