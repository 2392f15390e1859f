// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Primitive reads and writes for QMI TLV payloads.
//!
//! Writes append to a growable [`BytesMut`]; reads go through a [`Reader`]
//! cursor bounded by the owning TLV. Multi-byte fields take an explicit
//! [`Endian`] because QMI mixes little- and big-endian fields within one
//! message.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};

use crate::errors::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Declared encoding of an operator/network description string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Ascii,
    Gsm,
    Ucs2Le,
    Unicode,
    Unspecified,
}

/// A bounded read cursor over one TLV value (or any byte window).
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if len > self.remaining() {
            return Err(Error::TlvTooLong);
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, Error> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_u16(&mut self, endian: Endian) -> Result<u16, Error> {
        let raw = self.take(2)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u16(raw),
            Endian::Big => BigEndian::read_u16(raw),
        })
    }

    pub fn read_i16(&mut self, endian: Endian) -> Result<i16, Error> {
        Ok(self.read_u16(endian)? as i16)
    }

    pub fn read_u32(&mut self, endian: Endian) -> Result<u32, Error> {
        let raw = self.take(4)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u32(raw),
            Endian::Big => BigEndian::read_u32(raw),
        })
    }

    pub fn read_i32(&mut self, endian: Endian) -> Result<i32, Error> {
        Ok(self.read_u32(endian)? as i32)
    }

    pub fn read_u64(&mut self, endian: Endian) -> Result<u64, Error> {
        let raw = self.take(8)?;
        Ok(match endian {
            Endian::Little => LittleEndian::read_u64(raw),
            Endian::Big => BigEndian::read_u64(raw),
        })
    }

    pub fn read_i64(&mut self, endian: Endian) -> Result<i64, Error> {
        Ok(self.read_u64(endian)? as i64)
    }

    /// Reads an unsigned integer of 1..=8 bytes, zero-extended to 64 bits.
    ///
    /// The field is a logical integer of the requested width: the `n` bytes
    /// on the wire are its low-order bytes in the requested byte order.
    pub fn read_sized_u64(&mut self, n_bytes: usize, endian: Endian) -> Result<u64, Error> {
        if n_bytes == 0 || n_bytes > 8 {
            return Err(Error::InvalidArgs("sized read must be 1..=8 bytes"));
        }
        let raw = self.take(n_bytes)?;
        let mut tmp = [0u8; 8];
        match endian {
            Endian::Little => {
                tmp[..n_bytes].copy_from_slice(raw);
                Ok(LittleEndian::read_u64(&tmp))
            }
            Endian::Big => {
                tmp[8 - n_bytes..].copy_from_slice(raw);
                Ok(BigEndian::read_u64(&tmp))
            }
        }
    }

    /// Reads an IEEE-754 single, preserving the raw representation.
    pub fn read_f32(&mut self, endian: Endian) -> Result<f32, Error> {
        Ok(f32::from_bits(self.read_u32(endian)?))
    }

    pub fn read_f64(&mut self, endian: Endian) -> Result<f64, Error> {
        Ok(f64::from_bits(self.read_u64(endian)?))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        self.take(len)
    }

    /// Reads a length-prefixed string. `prefix_size` selects a 0-, 1- or
    /// 2-byte length prefix; with no prefix the rest of the window is the
    /// string. `max_size` (when nonzero) caps how many bytes are decoded,
    /// though the cursor still advances past the declared length.
    ///
    /// Decoding tries printable UTF-8 first, then GSM-7, then UCS-2LE, the
    /// same ladder firmware-provided names need in practice.
    pub fn read_string(&mut self, prefix_size: u8, max_size: u16) -> Result<String, Error> {
        let string_length = match prefix_size {
            0 => self.remaining(),
            1 => usize::from(self.read_u8()?),
            2 => usize::from(self.read_u16(Endian::Little)?),
            _ => return Err(Error::InvalidArgs("string size prefix must be 0..=2 bytes")),
        };

        if string_length == 0 {
            return Ok(String::new());
        }

        let valid_length = if max_size > 0 && string_length > usize::from(max_size) {
            usize::from(max_size)
        } else {
            string_length
        };

        if string_length > self.remaining() {
            return Err(Error::TlvTooLong);
        }
        let raw = &self.data[self.pos..self.pos + valid_length];
        let decoded = string_from_name(raw).ok_or(Error::InvalidData("invalid string"))?;
        self.pos += string_length;
        Ok(decoded)
    }

    /// Reads exactly `len` bytes as UTF-8 with no prefix. A trailing invalid
    /// region is dropped (firmware pads fixed fields with garbage); a buffer
    /// with no valid prefix at all is an error.
    pub fn read_fixed_string(&mut self, len: usize) -> Result<String, Error> {
        if len == 0 {
            return Ok(String::new());
        }
        let raw = self.take(len)?;
        match std::str::from_utf8(raw) {
            Ok(s) => Ok(s.to_string()),
            Err(e) if e.valid_up_to() > 0 => {
                Ok(std::str::from_utf8(&raw[..e.valid_up_to()]).unwrap().to_string())
            }
            Err(_) => Err(Error::InvalidData("invalid string")),
        }
    }
}

pub fn put_u8(buf: &mut BytesMut, value: u8) {
    buf.put_u8(value);
}

pub fn put_i8(buf: &mut BytesMut, value: i8) {
    buf.put_i8(value);
}

pub fn put_u16(buf: &mut BytesMut, endian: Endian, value: u16) {
    match endian {
        Endian::Little => buf.put_u16_le(value),
        Endian::Big => buf.put_u16(value),
    }
}

pub fn put_i16(buf: &mut BytesMut, endian: Endian, value: i16) {
    put_u16(buf, endian, value as u16);
}

pub fn put_u32(buf: &mut BytesMut, endian: Endian, value: u32) {
    match endian {
        Endian::Little => buf.put_u32_le(value),
        Endian::Big => buf.put_u32(value),
    }
}

pub fn put_i32(buf: &mut BytesMut, endian: Endian, value: i32) {
    put_u32(buf, endian, value as u32);
}

pub fn put_u64(buf: &mut BytesMut, endian: Endian, value: u64) {
    match endian {
        Endian::Little => buf.put_u64_le(value),
        Endian::Big => buf.put_u64(value),
    }
}

pub fn put_i64(buf: &mut BytesMut, endian: Endian, value: i64) {
    put_u64(buf, endian, value as u64);
}

/// Writes the low `n_bytes` of `value` in the requested byte order. The
/// mirror of [`Reader::read_sized_u64`].
pub fn put_sized_u64(
    buf: &mut BytesMut,
    n_bytes: usize,
    endian: Endian,
    value: u64,
) -> Result<(), Error> {
    if n_bytes == 0 || n_bytes > 8 {
        return Err(Error::InvalidArgs("sized write must be 1..=8 bytes"));
    }
    let mut tmp = [0u8; 8];
    match endian {
        Endian::Little => {
            LittleEndian::write_u64(&mut tmp, value);
            buf.put_slice(&tmp[..n_bytes]);
        }
        Endian::Big => {
            BigEndian::write_u64(&mut tmp, value);
            buf.put_slice(&tmp[8 - n_bytes..]);
        }
    }
    Ok(())
}

pub fn put_f32(buf: &mut BytesMut, endian: Endian, value: f32) {
    put_u32(buf, endian, value.to_bits());
}

pub fn put_f64(buf: &mut BytesMut, endian: Endian, value: f64) {
    put_u64(buf, endian, value.to_bits());
}

/// Writes a string with a 0-, 1- or 2-byte length prefix. Lengths that do
/// not fit the prefix are rejected before anything is written.
pub fn put_string(buf: &mut BytesMut, prefix_size: u8, value: &str) -> Result<(), Error> {
    let len = value.len();
    match prefix_size {
        0 => {}
        1 => {
            if len > usize::from(u8::MAX) {
                return Err(Error::InvalidArgs("string too long for a 1 byte size prefix"));
            }
            buf.put_u8(len as u8);
        }
        2 => {
            if len > usize::from(u16::MAX) {
                return Err(Error::InvalidArgs("string too long for a 2 byte size prefix"));
            }
            buf.put_u16_le(len as u16);
        }
        _ => return Err(Error::InvalidArgs("string size prefix must be 0..=2 bytes")),
    }
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Renders bytes as `aa:bb:cc` hex, the format used by message traces.
pub fn str_hex(data: &[u8], separator: char) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i != 0 {
            out.push(separator);
        }
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Checks that `data` is valid UTF-8 made of printable characters (plus
/// tab/CR/LF) and returns it as a `&str` if so.
pub fn utf8_validate_printable(data: &[u8]) -> Option<&str> {
    let s = std::str::from_utf8(data).ok()?;
    if s.chars().all(|c| !c.is_control() || matches!(c, '\t' | '\r' | '\n')) {
        Some(s)
    } else {
        None
    }
}

/// 3GPP TS 23.038 default alphabet. Position 0x1b is the escape to the
/// extension table and never decoded directly.
const GSM7_DEFAULT: [char; 128] = [
    '@', '£', '$', '¥', 'è', 'é', 'ù', 'ì', 'ò', 'Ç', '\n', 'Ø', 'ø', '\r', 'Å', 'å', //
    'Δ', '_', 'Φ', 'Γ', 'Λ', 'Ω', 'Π', 'Ψ', 'Σ', 'Θ', 'Ξ', ' ', 'Æ', 'æ', 'ß', 'É', //
    ' ', '!', '"', '#', '¤', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/', //
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?', //
    '¡', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', //
    'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'Ä', 'Ö', 'Ñ', 'Ü', '§', //
    '¿', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', //
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'ä', 'ö', 'ñ', 'ü', 'à',
];

const GSM7_ESCAPE: u8 = 0x1b;

fn gsm7_extension(septet: u8) -> Option<char> {
    Some(match septet {
        0x0a => '\u{0c}',
        0x14 => '^',
        0x28 => '{',
        0x29 => '}',
        0x2f => '\\',
        0x3c => '[',
        0x3d => '~',
        0x3e => ']',
        0x40 => '|',
        0x65 => '€',
        _ => return None,
    })
}

fn gsm7_unpack(data: &[u8]) -> Vec<u8> {
    let n_septets = data.len() * 8 / 7;
    let mut septets = Vec::with_capacity(n_septets);
    for i in 0..n_septets {
        let bit = i * 7;
        let byte = bit / 8;
        let shift = bit % 8;
        let mut value = u16::from(data[byte]) >> shift;
        if shift > 1 && byte + 1 < data.len() {
            value |= u16::from(data[byte + 1]) << (8 - shift);
        }
        septets.push((value & 0x7f) as u8);
    }
    septets
}

fn gsm7_decode(data: &[u8], strict: bool) -> Option<String> {
    let septets = gsm7_unpack(data);
    let mut out = String::with_capacity(septets.len());
    let mut iter = septets.iter().copied();
    while let Some(septet) = iter.next() {
        if septet == GSM7_ESCAPE {
            match iter.next() {
                Some(next) => match gsm7_extension(next) {
                    Some(c) => out.push(c),
                    // A receiver is told to fall back to the default
                    // alphabet for an unknown escape, but a guessing
                    // reader treats it as proof the payload was never
                    // GSM-7 to begin with.
                    None if strict => return None,
                    None => out.push(GSM7_DEFAULT[usize::from(next)]),
                },
                // Trailing escape is septet-alignment padding.
                None => break,
            }
        } else if septet == 0 && strict {
            // The '@' position doubles as filler, and it is what the NUL
            // bytes of a UCS-2 or UTF-16 payload unpack to.
            return None;
        } else {
            out.push(GSM7_DEFAULT[usize::from(septet)]);
        }
    }
    Some(out)
}

/// Decodes a packed GSM-7 buffer (default alphabet plus the extension
/// table) when the encoding is only guessed at, as in the operator-name
/// fallback ladder. Returns `None` for septet streams that do not read as
/// a faithful GSM-7 name (zero septets, unknown escapes), so the caller
/// can try the next encoding. Buffers *declared* to be GSM-7 go through
/// [`string_from_encoded`] instead, which never rejects.
pub fn utf8_from_gsm7(data: &[u8]) -> Option<String> {
    gsm7_decode(data, true)
}

/// Decodes a UCS-2 little-endian buffer into UTF-8. Surrogate pairs are
/// accepted (firmware occasionally emits full UTF-16).
pub fn utf8_from_ucs2le(data: &[u8]) -> Option<String> {
    if data.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = data.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    char::decode_utf16(units.into_iter()).collect::<Result<String, _>>().ok()
}

/// Decodes an operator name trying, in order, printable UTF-8, GSM-7 and
/// UCS-2LE.
pub fn string_from_name(data: &[u8]) -> Option<String> {
    if let Some(s) = utf8_validate_printable(data) {
        return Some(s.to_string());
    }
    if let Some(s) = utf8_from_gsm7(data) {
        return Some(s);
    }
    utf8_from_ucs2le(data)
}

/// Decodes a string whose encoding the message declares explicitly.
///
/// `Unspecified` only accepts ASCII-clean input; anything else reports an
/// unknown encoding.
pub fn string_from_encoded(encoding: TextEncoding, data: &[u8]) -> Result<String, Error> {
    match encoding {
        TextEncoding::Ascii => utf8_validate_printable(data)
            .filter(|s| s.is_ascii())
            .map(str::to_string)
            .ok_or(Error::InvalidData("invalid ASCII string")),
        // Declared GSM-7 decodes unconditionally, unknown escapes falling
        // back to the default alphabet as 3GPP prescribes for receivers.
        TextEncoding::Gsm => {
            gsm7_decode(data, false).ok_or(Error::InvalidData("invalid GSM-7 string"))
        }
        TextEncoding::Ucs2Le | TextEncoding::Unicode => {
            utf8_from_ucs2le(data).ok_or(Error::InvalidData("invalid UCS-2 string"))
        }
        TextEncoding::Unspecified => utf8_validate_printable(data)
            .filter(|s| s.is_ascii())
            .map(str::to_string)
            .ok_or(Error::InvalidData("unknown encoding")),
    }
}
