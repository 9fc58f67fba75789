use std::fmt;

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use super::ProtocolVersion;

/// Epoch and 48 bit sequence number of a record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Sequence {
    pub epoch: u16,
    pub sequence_number: u64,
}

/// Largest sequence number that fits the 48 bit field.
pub const MAX_SEQUENCE_NUMBER: u64 = (1 << 48) - 1;

impl Sequence {
    pub fn new(epoch: u16) -> Self {
        Sequence {
            epoch,
            sequence_number: 0,
        }
    }

    /// Epoch and sequence number as the 8 byte value used in AAD and nonces.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0_u8; 8];
        out[..2].copy_from_slice(&self.epoch.to_be_bytes());
        out[2..].copy_from_slice(&self.sequence_number.to_be_bytes()[2..]);
        out
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.epoch, self.sequence_number)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct DtlsRecord<'a> {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub sequence: Sequence,
    pub fragment: &'a [u8],
}

impl<'a> DtlsRecord<'a> {
    pub const HEADER_LEN: usize = 13;

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], DtlsRecord<'a>> {
        let (input, content_type) = ContentType::parse(input)?;
        let (input, version) = ProtocolVersion::parse(input)?;
        let (input, epoch) = be_u16(input)?;
        let (input, sequence_number) = be_u48(input)?;
        let (input, length) = be_u16(input)?;
        let (input, fragment) = take(length as usize)(input)?;

        Ok((
            input,
            DtlsRecord {
                content_type,
                version,
                sequence: Sequence {
                    epoch,
                    sequence_number,
                },
                fragment,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        Self::serialize_header(
            self.content_type,
            self.version,
            self.sequence,
            self.fragment.len(),
            output,
        );
        output.extend_from_slice(self.fragment);
    }

    pub fn serialize_header(
        content_type: ContentType,
        version: ProtocolVersion,
        sequence: Sequence,
        length: usize,
        output: &mut Vec<u8>,
    ) {
        output.push(content_type.as_u8());
        version.serialize(output);
        output.extend_from_slice(&sequence.to_bytes());
        output.extend_from_slice(&(length as u16).to_be_bytes());
    }
}

fn be_u48(input: &[u8]) -> IResult<&[u8], u64> {
    let (input, bytes) = take(6_usize)(input)?;
    let value = bytes.iter().fold(0_u64, |acc, b| (acc << 8) | *b as u64);
    Ok((input, value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Unknown(u8),
}

impl ContentType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            20 => ContentType::ChangeCipherSpec,
            21 => ContentType::Alert,
            22 => ContentType::Handshake,
            23 => ContentType::ApplicationData,
            _ => ContentType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
            ContentType::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ContentType> {
        let (input, byte) = be_u8(input)?;
        Ok((input, Self::from_u8(byte)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &[u8] = &[
        0x17, // ContentType::ApplicationData
        0xFE, 0xFD, // ProtocolVersion::DTLS1_2
        0x00, 0x01, // epoch
        0x00, 0x00, 0x00, 0x01, 0x02, 0x03, // sequence_number
        0x00, 0x04, // length
        0xDE, 0xAD, 0xBE, 0xEF, // fragment
    ];

    #[test]
    fn parse_and_serialize() {
        let (rest, record) = DtlsRecord::parse(RECORD).unwrap();
        assert!(rest.is_empty());
        assert_eq!(record.content_type, ContentType::ApplicationData);
        assert_eq!(record.version, ProtocolVersion::DTLS1_2);
        assert_eq!(record.sequence.epoch, 1);
        assert_eq!(record.sequence.sequence_number, 0x010203);
        assert_eq!(record.fragment, &[0xDE, 0xAD, 0xBE, 0xEF]);

        let mut out = Vec::new();
        record.serialize(&mut out);
        assert_eq!(out, RECORD);
    }

    #[test]
    fn truncated_fragment() {
        assert!(DtlsRecord::parse(&RECORD[..RECORD.len() - 1]).is_err());
    }

    #[test]
    fn sequence_bytes() {
        let seq = Sequence {
            epoch: 1,
            sequence_number: 0x0000_0102_0304,
        };
        assert_eq!(seq.to_bytes(), [0, 1, 0, 0, 1, 2, 3, 4]);
    }
}
