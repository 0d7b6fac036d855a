// Streaming parser for the feedback service's record stream.
use bytes::{Buf, BytesMut};

use crate::token::DeviceToken;
use crate::{Error, Result};

/// On-wire size of one feedback record: u32 timestamp, u16 token length,
/// 32 token bytes.
pub const FEEDBACK_RECORD_LEN: usize = 4 + 2 + DeviceToken::LEN;

/// One record from the feedback stream: the unix second at which the peer
/// first observed the device as unreachable, and the device's token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackRecord {
    pub timestamp: u32,
    pub token: DeviceToken,
}

/// Reassembles feedback records from arbitrarily chunked reads.
///
/// A record is either consumed whole or fully retained; a trailing partial
/// record is kept across `feed` calls until the remaining bytes arrive.
///
/// ```
/// use courier_wire::FeedbackParser;
///
/// let mut record = 1_600_000_000u32.to_be_bytes().to_vec();
/// record.extend_from_slice(&32u16.to_be_bytes());
/// record.extend_from_slice(&[0xAA; 32]);
///
/// let mut parser = FeedbackParser::new();
/// assert!(parser.feed(&record[..10]).expect("partial").is_empty());
/// let records = parser.feed(&record[10..]).expect("rest");
/// assert_eq!(records.len(), 1);
/// assert_eq!(records[0].timestamp, 1_600_000_000);
/// ```
#[derive(Debug, Default)]
pub struct FeedbackParser {
    buf: BytesMut,
}

impl FeedbackParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete record from the buffer.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<FeedbackRecord>> {
        self.buf.extend_from_slice(chunk);
        let mut records = Vec::new();
        loop {
            if self.buf.len() < 6 {
                break;
            }
            // Validate the declared token length before waiting for the body.
            let token_len = u16::from_be_bytes([self.buf[4], self.buf[5]]) as usize;
            if token_len != DeviceToken::LEN {
                return Err(Error::TokenLength {
                    expected: DeviceToken::LEN,
                    actual: token_len,
                });
            }
            if self.buf.len() < FEEDBACK_RECORD_LEN {
                break;
            }
            let mut record = self.buf.split_to(FEEDBACK_RECORD_LEN);
            let timestamp = record.get_u32();
            record.advance(2);
            let token = DeviceToken::from_bytes(&record)?;
            records.push(FeedbackRecord { timestamp, token });
        }
        Ok(records)
    }

    /// Bytes retained for a not-yet-complete record.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
