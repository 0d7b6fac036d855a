// Binary wire format for the legacy push gateway and feedback service.
use bytes::{BufMut, Bytes, BytesMut};

pub mod feedback;
pub mod token;

pub use feedback::{FEEDBACK_RECORD_LEN, FeedbackParser, FeedbackRecord};
pub use token::DeviceToken;

/// Command byte of an outbound notification frame.
pub const NOTIFY_COMMAND: u8 = 1;
/// Command byte of an inbound error-response frame.
pub const RESPONSE_COMMAND: u8 = 8;
/// On-wire size of an error-response frame.
pub const RESPONSE_LEN: usize = 6;
/// Payload byte limit the gateway enforces by default.
pub const DEFAULT_MAX_PAYLOAD: usize = 256;
/// Hard payload limit imposed by the u16 length field.
pub const MAX_WIRE_PAYLOAD: usize = u16::MAX as usize;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("device token must be {expected} bytes, got {actual}")]
    TokenLength { expected: usize, actual: usize },
    #[error("device token must be 64 hexadecimal characters, got {0:?}")]
    TokenHex(String),
    #[error("payload is {len} bytes, limit {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("unknown response status {0}")]
    UnknownStatus(u8),
    #[error("unexpected response command {0}")]
    UnexpectedCommand(u8),
    #[error("incomplete frame")]
    Incomplete,
}

/// Encode one notification frame for the gateway's binary interface.
///
/// Layout (big-endian): command `0x01`, u32 identifier, u32 expiry in unix
/// seconds, u16 token length, 32 token bytes, u16 payload length, payload.
///
/// ```
/// use courier_wire::{DeviceToken, encode_notification};
///
/// let token = DeviceToken::from_bytes(&[0x11; 32]).expect("token");
/// let frame = encode_notification(&token, b"{}", 2_000_000_000, 7, 256).expect("frame");
/// assert_eq!(frame[0], 0x01);
/// assert_eq!(frame.len(), 45 + 2);
/// ```
pub fn encode_notification(
    token: &DeviceToken,
    payload: &[u8],
    expiry: u32,
    identifier: u32,
    max_payload: usize,
) -> Result<Bytes> {
    // The length field is a u16; the configured limit can only tighten that.
    let max = max_payload.min(MAX_WIRE_PAYLOAD);
    if payload.len() > max {
        return Err(Error::PayloadTooLarge {
            len: payload.len(),
            max,
        });
    }
    let mut buf =
        BytesMut::with_capacity(1 + 4 + 4 + 2 + DeviceToken::LEN + 2 + payload.len());
    buf.put_u8(NOTIFY_COMMAND);
    buf.put_u32(identifier);
    buf.put_u32(expiry);
    buf.put_u16(DeviceToken::LEN as u16);
    buf.extend_from_slice(token.as_bytes());
    buf.put_u16(payload.len() as u16);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Status byte of an error-response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Success,
    ProcessingError,
    MissingDeviceToken,
    MissingTopic,
    MissingPayload,
    InvalidTokenSize,
    InvalidTopicSize,
    InvalidPayloadSize,
    InvalidToken,
    Unknown,
}

impl ResponseStatus {
    pub fn from_wire(status: u8) -> Result<Self> {
        match status {
            0 => Ok(Self::Success),
            1 => Ok(Self::ProcessingError),
            2 => Ok(Self::MissingDeviceToken),
            3 => Ok(Self::MissingTopic),
            4 => Ok(Self::MissingPayload),
            5 => Ok(Self::InvalidTokenSize),
            6 => Ok(Self::InvalidTopicSize),
            7 => Ok(Self::InvalidPayloadSize),
            8 => Ok(Self::InvalidToken),
            255 => Ok(Self::Unknown),
            other => Err(Error::UnknownStatus(other)),
        }
    }

    pub fn as_wire(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::ProcessingError => 1,
            Self::MissingDeviceToken => 2,
            Self::MissingTopic => 3,
            Self::MissingPayload => 4,
            Self::InvalidTokenSize => 5,
            Self::InvalidTopicSize => 6,
            Self::InvalidPayloadSize => 7,
            Self::InvalidToken => 8,
            Self::Unknown => 255,
        }
    }
}

/// Decoded error-response frame.
///
/// The gateway sends at most one of these, right before closing the
/// connection; correlation with the notification is by identifier only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: ResponseStatus,
    pub identifier: u32,
}

/// Decode a 6-byte error-response frame.
///
/// ```
/// use courier_wire::{ResponseStatus, decode_response};
///
/// let response = decode_response(&[8, 8, 0x0A, 0x0B, 0x0C, 0x0D]).expect("decode");
/// assert_eq!(response.status, ResponseStatus::InvalidToken);
/// assert_eq!(response.identifier, 0x0A0B_0C0D);
/// ```
pub fn decode_response(frame: &[u8]) -> Result<GatewayResponse> {
    if frame.len() < RESPONSE_LEN {
        return Err(Error::Incomplete);
    }
    let command = frame[0];
    if command != RESPONSE_COMMAND {
        return Err(Error::UnexpectedCommand(command));
    }
    let status = ResponseStatus::from_wire(frame[1])?;
    let identifier = u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]);
    Ok(GatewayResponse { status, identifier })
}
