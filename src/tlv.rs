//! MeshCoP Type-Length-Value records.
//!
//! ```text
//!  0        1        2        3
//! +--------+--------+--------------------
//! |  type  | length | value ...            length < 255
//! +--------+--------+--------------------
//! |  type  |  0xFF  |  length (BE)    | value ...
//! +--------+--------+--------+--------+-----------
//! ```
//!
//! Records are appended with [`TlvWriter`], which refuses anything that
//! would overflow its capacity before touching the buffer. Received
//! payloads are walked with [`TlvView`], which checks every record against
//! the envelope it was handed and never reads past it.

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use crate::Error;

/// Length byte announcing a two byte length.
pub const EXTENDED_LENGTH: u8 = 0xFF;

/// Worst case header size of a single record.
pub const MAX_HEADER_LEN: usize = 4;

/// Largest value a record can carry.
pub const MAX_VALUE_LEN: usize = u16::MAX as usize;

/// A record borrowed from a received buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    tlv_type: u8,
    value: &'a [u8],
    header_len: usize,
}

impl<'a> Tlv<'a> {
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Tlv<'a>> {
        let (input, tlv_type) = be_u8(input)?;
        let (input, short_len) = be_u8(input)?;
        let (input, len, header_len) = if short_len == EXTENDED_LENGTH {
            let (input, len) = be_u16(input)?;
            (input, len as usize, 4)
        } else {
            (input, short_len as usize, 2)
        };
        let (input, value) = take(len)(input)?;

        Ok((
            input,
            Tlv {
                tlv_type,
                value,
                header_len,
            },
        ))
    }

    #[inline(always)]
    pub fn tlv_type(&self) -> u8 {
        self.tlv_type
    }

    #[inline(always)]
    pub fn value(&self) -> &'a [u8] {
        self.value
    }

    /// Header plus value. Adding this to the record's offset lands on the next record.
    pub fn encoded_len(&self) -> usize {
        self.header_len + self.value.len()
    }

    pub fn value_u8(&self) -> Result<u8, Error> {
        match self.value {
            [v, ..] => Ok(*v),
            [] => Err(Error::Tlv(self.tlv_type)),
        }
    }

    pub fn value_i8(&self) -> Result<i8, Error> {
        self.value_u8().map(|v| v as i8)
    }

    pub fn value_u16(&self) -> Result<u16, Error> {
        match self.value {
            [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
            _ => Err(Error::Tlv(self.tlv_type)),
        }
    }
}

/// Bounds-checked cursor over a sequence of records.
#[derive(Debug, Clone)]
pub struct TlvView<'a> {
    envelope: &'a [u8],
    offset: usize,
}

impl<'a> TlvView<'a> {
    /// View over all of `envelope`.
    pub fn new(envelope: &'a [u8]) -> Self {
        TlvView {
            envelope,
            offset: 0,
        }
    }

    /// View over the first `declared_len` bytes of `buf`.
    ///
    /// Fails when the buffer is shorter than what the caller declared.
    pub fn with_declared_len(buf: &'a [u8], declared_len: usize) -> Result<Self, Error> {
        if declared_len > buf.len() {
            return Err(Error::TooLarge {
                what: "tlv envelope",
                len: declared_len,
                max: buf.len(),
            });
        }
        Ok(TlvView::new(&buf[..declared_len]))
    }

    /// Bytes consumed so far.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_exhausted(&self) -> bool {
        self.offset >= self.envelope.len()
    }

    /// Read the record at the cursor and advance past it.
    ///
    /// A record whose header or value would cross the envelope end is an
    /// error and leaves the cursor where it was.
    pub fn next_tlv(&mut self) -> Result<Option<Tlv<'a>>, Error> {
        if self.is_exhausted() {
            return Ok(None);
        }
        let rest = &self.envelope[self.offset..];
        match Tlv::parse(rest) {
            Ok((_, tlv)) => {
                self.offset += tlv.encoded_len();
                Ok(Some(tlv))
            }
            Err(_) => {
                let tlv_type = rest[0];
                trace!("Truncated tlv type {} at offset {}", tlv_type, self.offset);
                Err(Error::Tlv(tlv_type))
            }
        }
    }

    /// First record of `tlv_type` in the whole envelope.
    pub fn find(&self, tlv_type: u8) -> Result<Option<Tlv<'a>>, Error> {
        let mut view = TlvView::new(self.envelope);
        while let Some(tlv) = view.next_tlv()? {
            if tlv.tlv_type() == tlv_type {
                return Ok(Some(tlv));
            }
        }
        Ok(None)
    }
}

impl<'a> Iterator for TlvView<'a> {
    type Item = Result<Tlv<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_tlv() {
            Ok(Some(tlv)) => Some(Ok(tlv)),
            Ok(None) => None,
            Err(e) => {
                // Stop iterating after a malformed record.
                self.offset = self.envelope.len();
                Some(Err(e))
            }
        }
    }
}

/// Appends records into a buffer of fixed capacity.
#[derive(Debug)]
pub struct TlvWriter {
    buf: Vec<u8>,
    capacity: usize,
}

impl TlvWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        TlvWriter {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    /// Header length needed for a value of `len` bytes.
    pub fn header_len(len: usize) -> usize {
        if len < EXTENDED_LENGTH as usize {
            2
        } else {
            4
        }
    }

    /// Append a record. Nothing is written if it does not fit.
    pub fn append(&mut self, tlv_type: u8, value: &[u8]) -> Result<(), Error> {
        if value.len() > MAX_VALUE_LEN {
            return Err(Error::TooLarge {
                what: "tlv value",
                len: value.len(),
                max: MAX_VALUE_LEN,
            });
        }
        let needed = Self::header_len(value.len()) + value.len();
        if needed > self.remaining() {
            debug!(
                "Tlv type {} needs {} bytes, {} remaining",
                tlv_type,
                needed,
                self.remaining()
            );
            return Err(Error::TooLarge {
                what: "tlv record",
                len: needed,
                max: self.remaining(),
            });
        }

        self.buf.push(tlv_type);
        if value.len() < EXTENDED_LENGTH as usize {
            self.buf.push(value.len() as u8);
        } else {
            self.buf.push(EXTENDED_LENGTH);
            self.buf
                .extend_from_slice(&(value.len() as u16).to_be_bytes());
        }
        self.buf.extend_from_slice(value);
        Ok(())
    }

    pub fn append_u8(&mut self, tlv_type: u8, value: u8) -> Result<(), Error> {
        self.append(tlv_type, &[value])
    }

    pub fn append_i8(&mut self, tlv_type: u8, value: i8) -> Result<(), Error> {
        self.append(tlv_type, &[value as u8])
    }

    pub fn append_u16(&mut self, tlv_type: u8, value: u16) -> Result<(), Error> {
        self.append(tlv_type, &value.to_be_bytes())
    }
}
