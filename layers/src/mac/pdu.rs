//! MAC PDU Multiplexing
//!
//! Builds and parses MAC PDUs made of subPDUs (TS 38.321 6.1.2):
//! R/F/LCID/L subheaders for SDUs and variable-size CEs, R/R/LCID for
//! fixed-size CEs, and trailing padding.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    bytes::complete::take,
    combinator::all_consuming,
    error::{Error as NomError, ErrorKind},
    multi::many0,
    number::complete::{be_u16, be_u8},
    IResult,
};

use crate::LayerError;
use interfaces::message_types::BsrFormat;

/// Highest LCID carrying logical channel data
pub const MAX_SDU_LCID: u8 = 32;
/// Default data radio bearer logical channel
pub const LCID_DRB: u8 = 4;
pub const LCID_SHORT_TRUNCATED_BSR: u8 = 59;
pub const LCID_LONG_TRUNCATED_BSR: u8 = 60;
pub const LCID_SHORT_BSR: u8 = 61;
pub const LCID_LONG_BSR: u8 = 62;
pub const LCID_PADDING: u8 = 63;

const F_BIT: u8 = 0x40;
const LCID_MASK: u8 = 0x3F;

/// One parsed subPDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacSubPdu {
    Sdu { lcid: u8, data: Bytes },
    Bsr { format: BsrFormat, body: Bytes },
    Padding(usize),
}

/// Subheader length for a variable-size subPDU carrying `len` bytes
fn subheader_len(len: usize) -> usize {
    if len > u8::MAX as usize {
        3
    } else {
        2
    }
}

/// Assembles a MAC PDU of exactly the transport block size
#[derive(Debug)]
pub struct MacPduBuilder {
    buffer: BytesMut,
    tbs: usize,
}

impl MacPduBuilder {
    pub fn new(tbs: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(tbs),
            tbs,
        }
    }

    /// Bytes still free
    pub fn remaining(&self) -> usize {
        self.tbs - self.buffer.len()
    }

    /// Largest SDU that still fits together with its subheader
    pub fn max_sdu_len(&self) -> usize {
        let remaining = self.remaining();
        if remaining > 3 + u8::MAX as usize {
            (remaining - 3).min(u16::MAX as usize)
        } else {
            remaining.saturating_sub(2).min(u8::MAX as usize)
        }
    }

    /// Append an SDU for `lcid`. Returns false if it does not fit.
    pub fn add_sdu(&mut self, lcid: u8, data: &[u8]) -> bool {
        if lcid > MAX_SDU_LCID || data.is_empty() {
            return false;
        }
        self.add_variable(lcid, data)
    }

    /// Append a BSR MAC CE. Returns false if it does not fit.
    pub fn add_bsr(&mut self, format: BsrFormat, body: &[u8]) -> bool {
        match format {
            BsrFormat::Short | BsrFormat::ShortTruncated => {
                let lcid = if format == BsrFormat::Short {
                    LCID_SHORT_BSR
                } else {
                    LCID_SHORT_TRUNCATED_BSR
                };
                if body.len() != 1 || self.remaining() < 2 {
                    return false;
                }
                self.buffer.put_u8(lcid);
                self.buffer.put_u8(body[0]);
                true
            }
            BsrFormat::Long => self.add_variable(LCID_LONG_BSR, body),
            BsrFormat::LongTruncated => self.add_variable(LCID_LONG_TRUNCATED_BSR, body),
        }
    }

    fn add_variable(&mut self, lcid: u8, data: &[u8]) -> bool {
        if data.len() > u16::MAX as usize || subheader_len(data.len()) + data.len() > self.remaining() {
            return false;
        }
        if data.len() > u8::MAX as usize {
            self.buffer.put_u8(F_BIT | lcid);
            self.buffer.put_u16(data.len() as u16);
        } else {
            self.buffer.put_u8(lcid);
            self.buffer.put_u8(data.len() as u8);
        }
        self.buffer.put_slice(data);
        true
    }

    /// Pad to the transport block size and freeze
    pub fn finish(mut self) -> Bytes {
        let remaining = self.remaining();
        if remaining > 0 {
            self.buffer.put_u8(LCID_PADDING);
            self.buffer.put_bytes(0, remaining - 1);
        }
        self.buffer.freeze()
    }
}

fn length_field(f: bool) -> impl Fn(&[u8]) -> IResult<&[u8], usize> {
    move |input| {
        if f {
            be_u16(input).map(|(rest, len)| (rest, len as usize))
        } else {
            be_u8(input).map(|(rest, len)| (rest, len as usize))
        }
    }
}

fn variable_body(input: &[u8], f: bool) -> IResult<&[u8], Bytes> {
    let (input, len) = length_field(f)(input)?;
    let (input, body) = take(len)(input)?;
    Ok((input, Bytes::copy_from_slice(body)))
}

fn sub_pdu(input: &[u8]) -> IResult<&[u8], MacSubPdu> {
    let (input, header) = be_u8(input)?;
    let f = header & F_BIT != 0;
    let lcid = header & LCID_MASK;

    match lcid {
        LCID_PADDING => {
            let (input, padding) = take(input.len())(input)?;
            Ok((input, MacSubPdu::Padding(padding.len() + 1)))
        }
        LCID_SHORT_BSR | LCID_SHORT_TRUNCATED_BSR => {
            let (input, body) = take(1usize)(input)?;
            let format = if lcid == LCID_SHORT_BSR {
                BsrFormat::Short
            } else {
                BsrFormat::ShortTruncated
            };
            Ok((
                input,
                MacSubPdu::Bsr {
                    format,
                    body: Bytes::copy_from_slice(body),
                },
            ))
        }
        LCID_LONG_BSR | LCID_LONG_TRUNCATED_BSR => {
            let (input, body) = variable_body(input, f)?;
            let format = if lcid == LCID_LONG_BSR {
                BsrFormat::Long
            } else {
                BsrFormat::LongTruncated
            };
            Ok((input, MacSubPdu::Bsr { format, body }))
        }
        lcid if lcid <= MAX_SDU_LCID => {
            let (input, data) = variable_body(input, f)?;
            Ok((input, MacSubPdu::Sdu { lcid, data }))
        }
        _ => Err(nom::Err::Failure(NomError::new(input, ErrorKind::Switch))),
    }
}

/// Split a MAC PDU into its subPDUs
pub fn parse_pdu(data: &[u8]) -> Result<Vec<MacSubPdu>, LayerError> {
    all_consuming(many0(sub_pdu))(data)
        .map(|(_, subpdus)| subpdus)
        .map_err(|e| LayerError::InvalidPdu(format!("{:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_pads_to_tbs() {
        let mut builder = MacPduBuilder::new(32);
        assert!(builder.add_sdu(LCID_DRB, &[0xAB; 10]));
        assert_eq!(builder.remaining(), 20);
        let pdu = builder.finish();

        assert_eq!(pdu.len(), 32);
        assert_eq!(&pdu[..2], &[LCID_DRB, 10]);
        assert_eq!(pdu[12], LCID_PADDING);

        let parsed = parse_pdu(&pdu).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1], MacSubPdu::Padding(20));
    }

    #[test]
    fn test_long_length_field() {
        let data = vec![0x5A; 300];
        let mut builder = MacPduBuilder::new(303);
        assert_eq!(builder.max_sdu_len(), 300);
        assert!(builder.add_sdu(1, &data));
        let pdu = builder.finish();
        assert_eq!(pdu[0], F_BIT | 1);
        assert_eq!(u16::from_be_bytes([pdu[1], pdu[2]]), 300);

        let parsed = parse_pdu(&pdu).unwrap();
        assert_eq!(parsed, vec![MacSubPdu::Sdu { lcid: 1, data: Bytes::from(data) }]);
    }

    #[test]
    fn test_sdu_must_fit() {
        let mut builder = MacPduBuilder::new(10);
        assert_eq!(builder.max_sdu_len(), 8);
        assert!(!builder.add_sdu(LCID_DRB, &[0; 9]));
        assert!(builder.add_sdu(LCID_DRB, &[0; 8]));
        assert_eq!(builder.max_sdu_len(), 0);
        assert_eq!(builder.finish().len(), 10);
    }

    #[test]
    fn test_bsr_ce_round_trip() {
        let mut builder = MacPduBuilder::new(16);
        assert!(builder.add_bsr(BsrFormat::Short, &[0x2F]));
        assert!(builder.add_bsr(BsrFormat::Long, &[0x03, 10, 20]));
        assert!(builder.add_sdu(LCID_DRB, &[1, 2, 3]));
        let parsed = parse_pdu(&builder.finish()).unwrap();

        assert_eq!(
            parsed[0],
            MacSubPdu::Bsr { format: BsrFormat::Short, body: Bytes::from_static(&[0x2F]) }
        );
        assert_eq!(
            parsed[1],
            MacSubPdu::Bsr { format: BsrFormat::Long, body: Bytes::from_static(&[0x03, 10, 20]) }
        );
        assert!(matches!(parsed[2], MacSubPdu::Sdu { lcid: LCID_DRB, .. }));
        assert_eq!(parsed[3], MacSubPdu::Padding(4));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        // Length runs past the end
        assert!(parse_pdu(&[LCID_DRB, 10, 1, 2]).is_err());
        // Reserved LCID
        assert!(parse_pdu(&[40, 1, 0]).is_err());
        assert!(parse_pdu(&[]).unwrap().is_empty());
    }
}
