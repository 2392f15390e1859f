// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Framed QMI messages.
//!
//! A [`Message`] owns one complete QMUX frame:
//!
//! ```text
//! offset  size  field
//! 0       1     marker, always 0x01
//! 1       2     qmux length (LE), bytes following the marker
//! 3       1     qmux flags, bit 7 = sender is the modem
//! 4       1     service id
//! 5       1     client id
//! 6       6/7   control header (flags/tx:u8/message:u16/tlv_len:u16) or
//!               service header (flags/tx:u16/message:u16/tlv_len:u16)
//! ...           TLVs: type:u8, length:u16 LE, value
//! ```
//!
//! Every invariant relating the three length fields is re-checked after
//! each mutation; a message that fails [`Message::validate`] is never
//! handed out.

use bytes::{BufMut, BytesMut};

use crate::codec::{self, Endian, Reader};
use crate::errors::{Error, ProtocolError};
use crate::{Service, TraceOptions};

pub const QMUX_MARKER: u8 = 0x01;

const QMUX_FLAG_FROM_MODEM: u8 = 0x80;

const CTL_FLAG_RESPONSE: u8 = 0x01;
const CTL_FLAG_INDICATION: u8 = 0x02;

const SERVICE_FLAG_COMPOUND: u8 = 0x01;
const SERVICE_FLAG_RESPONSE: u8 = 0x02;
const SERVICE_FLAG_INDICATION: u8 = 0x04;

/// Size of the QMUX header (length, flags, service, client).
const QMUX_SIZE: usize = 5;
/// Offset of the QMI header, right after the marker and QMUX header.
const HEADER_OFFSET: usize = 1 + QMUX_SIZE;

const CTL_HEADER_SIZE: usize = 6;
const SERVICE_HEADER_SIZE: usize = 7;

/// TLV carrying the result of an operation in every response.
pub const TLV_RESULT: u8 = 0x02;

/// Message id of the per-service abort request; TLV 0x01 holds the
/// transaction id being aborted.
pub const MESSAGE_ABORT: u16 = 0x0002;

/// Requests that the modem documents as abortable, per (service, message).
const ABORTABLE: &[(Service, u16)] = &[
    // WDS "Start Network"
    (Service::Wds, 0x0020),
    // NAS "Network Scan"
    (Service::Nas, 0x0021),
];

/// An owned, framed QMI message.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    data: BytesMut,
}

impl Message {
    /// Creates an empty request. For the control service the transaction id
    /// must fit in 8 bits.
    pub fn new(
        service: u8,
        client_id: u8,
        transaction_id: u16,
        message_id: u16,
    ) -> Result<Message, Error> {
        let is_ctl = service == u8::from(Service::Ctl);
        if is_ctl && transaction_id > u16::from(u8::MAX) {
            return Err(Error::InvalidArgs("control transaction ids are 8-bit"));
        }

        let header_size = if is_ctl { CTL_HEADER_SIZE } else { SERVICE_HEADER_SIZE };
        let total = HEADER_OFFSET + header_size;
        let mut data = BytesMut::with_capacity(total);
        data.put_u8(QMUX_MARKER);
        data.put_u16_le((total - 1) as u16);
        data.put_u8(0); // qmux flags
        data.put_u8(service);
        data.put_u8(client_id);
        data.put_u8(0); // header flags
        if is_ctl {
            data.put_u8(transaction_id as u8);
        } else {
            data.put_u16_le(transaction_id);
        }
        data.put_u16_le(message_id);
        data.put_u16_le(0); // tlv length

        let message = Message { data };
        debug_assert!(message.check().is_ok());
        Ok(message)
    }

    /// Parses one message out of `raw`, which accumulates bytes from the
    /// transport. Returns `Ok(None)` and leaves `raw` untouched while the
    /// frame is still incomplete; on success consumes exactly the frame.
    pub fn from_raw(raw: &mut BytesMut) -> Result<Option<Message>, Error> {
        if raw.len() < HEADER_OFFSET {
            return Ok(None);
        }
        let message_len = usize::from(u16::from_le_bytes([raw[1], raw[2]]));
        if raw.len() < message_len + 1 {
            return Ok(None);
        }

        let message = Message { data: raw.split_to(message_len + 1) };
        message.check()?;
        Ok(Some(message))
    }

    /// Builds a message from a headerless QMI payload (QMI header plus
    /// TLVs) by synthesising the QMUX envelope, consuming the payload from
    /// `qmi_data`. This is the framing used on QRTR transports, which do
    /// not carry QMUX.
    pub fn from_data(service: u8, client_id: u8, qmi_data: &mut BytesMut) -> Result<Message, Error> {
        let is_ctl = service == u8::from(Service::Ctl);
        let header_size = if is_ctl { CTL_HEADER_SIZE } else { SERVICE_HEADER_SIZE };
        if qmi_data.len() < header_size {
            return Err(Error::InvalidMessage("QMI data too short for header".to_string()));
        }

        let tlv_len_offset = header_size - 2;
        let tlv_len =
            usize::from(u16::from_le_bytes([qmi_data[tlv_len_offset], qmi_data[tlv_len_offset + 1]]));
        let message_len = header_size + tlv_len;
        if qmi_data.len() < message_len {
            return Err(Error::InvalidMessage("QMI data shorter than declared".to_string()));
        }

        let total = HEADER_OFFSET + message_len;
        let mut data = BytesMut::with_capacity(total);
        data.put_u8(QMUX_MARKER);
        data.put_u16_le((total - 1) as u16);
        data.put_u8(0);
        data.put_u8(service);
        data.put_u8(client_id);
        data.put_slice(&qmi_data.split_to(message_len));

        let message = Message { data };
        message.check()?;
        Ok(message)
    }

    /// Builds the response to `request`: same service, client, transaction
    /// and message ids, direction flipped, with a result TLV appended.
    /// `ProtocolError::None` means the operation succeeded.
    pub fn response(request: &Message, error: ProtocolError) -> Message {
        let mut response = Message::new(
            request.service_id(),
            request.client_id(),
            request.transaction_id(),
            request.message_id(),
        )
        .expect("request carried a valid transaction id");

        response.data[3] = QMUX_FLAG_FROM_MODEM;
        let flags_offset = HEADER_OFFSET;
        if response.is_control() {
            response.data[flags_offset] |= CTL_FLAG_RESPONSE;
        } else {
            response.data[flags_offset] |= SERVICE_FLAG_RESPONSE;
        }

        let tlv = response.tlv_write_init(TLV_RESULT).expect("result TLV always fits");
        response
            .tlv_write_u16(Endian::Little, u16::from(error != ProtocolError::None))
            .expect("result TLV always fits");
        response.tlv_write_u16(Endian::Little, error.code()).expect("result TLV always fits");
        response.tlv_write_complete(tlv).expect("result TLV always fits");
        response
    }

    fn is_control(&self) -> bool {
        self.service_id() == u8::from(Service::Ctl)
    }

    fn header_size(&self) -> usize {
        if self.is_control() {
            CTL_HEADER_SIZE
        } else {
            SERVICE_HEADER_SIZE
        }
    }

    /// Offset of the first TLV.
    fn tlv_start(&self) -> usize {
        HEADER_OFFSET + self.header_size()
    }

    fn qmux_length(&self) -> u16 {
        u16::from_le_bytes([self.data[1], self.data[2]])
    }

    fn set_qmux_length(&mut self, length: u16) {
        self.data[1..3].copy_from_slice(&length.to_le_bytes());
    }

    fn qmux_flags(&self) -> u8 {
        self.data[3]
    }

    fn header_flags(&self) -> u8 {
        self.data[HEADER_OFFSET]
    }

    fn tlv_length_offset(&self) -> usize {
        self.tlv_start() - 2
    }

    fn tlv_length(&self) -> u16 {
        let offset = self.tlv_length_offset();
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    fn set_tlv_length(&mut self, length: u16) {
        let offset = self.tlv_length_offset();
        self.data[offset..offset + 2].copy_from_slice(&length.to_le_bytes());
    }

    pub fn service_id(&self) -> u8 {
        self.data[4]
    }

    pub fn client_id(&self) -> u8 {
        self.data[5]
    }

    /// Restamps the QMUX client id. The proxy uses this to rewrite client
    /// traffic onto the id the device actually issued.
    pub fn set_client_id(&mut self, client_id: u8) {
        self.data[5] = client_id;
    }

    pub fn transaction_id(&self) -> u16 {
        if self.is_control() {
            u16::from(self.data[HEADER_OFFSET + 1])
        } else {
            u16::from_le_bytes([self.data[HEADER_OFFSET + 1], self.data[HEADER_OFFSET + 2]])
        }
    }

    pub fn set_transaction_id(&mut self, transaction_id: u16) {
        if self.is_control() {
            self.data[HEADER_OFFSET + 1] = transaction_id as u8;
        } else {
            self.data[HEADER_OFFSET + 1..HEADER_OFFSET + 3]
                .copy_from_slice(&transaction_id.to_le_bytes());
        }
    }

    pub fn message_id(&self) -> u16 {
        let offset = self.tlv_start() - 4;
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    pub fn is_response(&self) -> bool {
        if self.is_control() {
            self.header_flags() & CTL_FLAG_RESPONSE != 0
        } else {
            self.header_flags() & SERVICE_FLAG_RESPONSE != 0
        }
    }

    pub fn is_indication(&self) -> bool {
        if self.is_control() {
            self.header_flags() & CTL_FLAG_INDICATION != 0
        } else {
            self.header_flags() & SERVICE_FLAG_INDICATION != 0
        }
    }

    pub fn is_request(&self) -> bool {
        !self.is_response() && !self.is_indication()
    }

    /// Compound batching only exists on service messages.
    pub fn is_compound(&self) -> bool {
        !self.is_control() && self.header_flags() & SERVICE_FLAG_COMPOUND != 0
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// The full frame, marker and QMUX header included.
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    /// The headerless view: QMI header plus TLVs, no marker or QMUX. This
    /// is what flows on QRTR transports.
    pub fn data(&self) -> &[u8] {
        &self.data[HEADER_OFFSET..]
    }

    /// Re-checks every framing invariant. Runs on construction and after
    /// each mutation; exposed for callers holding buffers of dubious
    /// provenance.
    pub fn validate(&self) -> Result<(), Error> {
        self.check()
    }

    fn check(&self) -> Result<(), Error> {
        if self.data.len() < HEADER_OFFSET {
            return Err(Error::InvalidMessage(format!(
                "buffer too short for QMUX header ({} bytes)",
                self.data.len()
            )));
        }

        if self.data[0] != QMUX_MARKER {
            return Err(Error::InvalidMessage(format!(
                "marker is incorrect (0x{:02x} != 0x{:02x})",
                self.data[0], QMUX_MARKER
            )));
        }

        let qmux_length = usize::from(self.qmux_length());
        if qmux_length < QMUX_SIZE {
            return Err(Error::InvalidMessage(format!(
                "QMUX length too short for QMUX header ({} < {})",
                qmux_length, QMUX_SIZE
            )));
        }

        // The length field counts every byte after the one-byte marker.
        if qmux_length != self.data.len() - 1 {
            return Err(Error::InvalidMessage(format!(
                "QMUX length and buffer length don't match ({} != {})",
                qmux_length,
                self.data.len() - 1
            )));
        }

        let header_length = QMUX_SIZE + self.header_size();
        if qmux_length < header_length {
            return Err(Error::InvalidMessage(format!(
                "QMUX length too short for QMI header ({} < {})",
                qmux_length, header_length
            )));
        }

        if qmux_length - header_length != usize::from(self.tlv_length()) {
            return Err(Error::InvalidMessage(format!(
                "QMUX length and QMI TLV lengths don't match ({} - {} != {})",
                qmux_length,
                header_length,
                self.tlv_length()
            )));
        }

        let end = self.data.len();
        let mut cursor = self.tlv_start();
        while cursor < end {
            if cursor + 3 > end {
                return Err(Error::InvalidMessage("TLV header runs over buffer".to_string()));
            }
            let value_len = usize::from(u16::from_le_bytes([self.data[cursor + 1], self.data[cursor + 2]]));
            if cursor + 3 + value_len > end {
                return Err(Error::InvalidMessage(format!(
                    "TLV value runs over buffer ({} + {} > {})",
                    cursor + 3,
                    value_len,
                    end
                )));
            }
            cursor += 3 + value_len;
        }
        Ok(())
    }

    fn write_would_overflow(&self, additional: usize) -> Result<(), Error> {
        if self.data.len() + additional > usize::from(u16::MAX) {
            return Err(Error::TlvTooLong);
        }
        Ok(())
    }

    /// Starts a TLV, reserving its header with length zero. Returns the
    /// offset to pass to [`Message::tlv_write_complete`] or
    /// [`Message::tlv_write_reset`].
    pub fn tlv_write_init(&mut self, tlv_type: u8) -> Result<usize, Error> {
        // A useful TLV has at least one byte of value.
        self.write_would_overflow(3 + 1)?;
        let init_offset = self.data.len();
        self.data.put_u8(tlv_type);
        self.data.put_u16_le(0);
        Ok(init_offset)
    }

    /// Discards a half-built TLV, truncating back to its start offset.
    pub fn tlv_write_reset(&mut self, tlv_offset: usize) {
        self.data.truncate(tlv_offset);
    }

    /// Back-patches the TLV length, the total TLV length and the QMUX
    /// length, then re-validates the whole frame.
    pub fn tlv_write_complete(&mut self, tlv_offset: usize) -> Result<(), Error> {
        if self.data.len() < tlv_offset + 3 {
            return Err(Error::InvalidArgs("TLV offset past end of message"));
        }
        let tlv_total = self.data.len() - tlv_offset;
        let value_len = (tlv_total - 3) as u16;
        self.data[tlv_offset + 1..tlv_offset + 3].copy_from_slice(&value_len.to_le_bytes());
        self.set_qmux_length(self.qmux_length() + tlv_total as u16);
        self.set_tlv_length(self.tlv_length() + tlv_total as u16);
        self.check()
    }

    pub fn tlv_write_u8(&mut self, value: u8) -> Result<(), Error> {
        self.write_would_overflow(1)?;
        codec::put_u8(&mut self.data, value);
        Ok(())
    }

    pub fn tlv_write_i8(&mut self, value: i8) -> Result<(), Error> {
        self.write_would_overflow(1)?;
        codec::put_i8(&mut self.data, value);
        Ok(())
    }

    pub fn tlv_write_u16(&mut self, endian: Endian, value: u16) -> Result<(), Error> {
        self.write_would_overflow(2)?;
        codec::put_u16(&mut self.data, endian, value);
        Ok(())
    }

    pub fn tlv_write_i16(&mut self, endian: Endian, value: i16) -> Result<(), Error> {
        self.write_would_overflow(2)?;
        codec::put_i16(&mut self.data, endian, value);
        Ok(())
    }

    pub fn tlv_write_u32(&mut self, endian: Endian, value: u32) -> Result<(), Error> {
        self.write_would_overflow(4)?;
        codec::put_u32(&mut self.data, endian, value);
        Ok(())
    }

    pub fn tlv_write_i32(&mut self, endian: Endian, value: i32) -> Result<(), Error> {
        self.write_would_overflow(4)?;
        codec::put_i32(&mut self.data, endian, value);
        Ok(())
    }

    pub fn tlv_write_u64(&mut self, endian: Endian, value: u64) -> Result<(), Error> {
        self.write_would_overflow(8)?;
        codec::put_u64(&mut self.data, endian, value);
        Ok(())
    }

    pub fn tlv_write_i64(&mut self, endian: Endian, value: i64) -> Result<(), Error> {
        self.write_would_overflow(8)?;
        codec::put_i64(&mut self.data, endian, value);
        Ok(())
    }

    pub fn tlv_write_sized_u64(
        &mut self,
        n_bytes: usize,
        endian: Endian,
        value: u64,
    ) -> Result<(), Error> {
        if n_bytes == 0 || n_bytes > 8 {
            return Err(Error::InvalidArgs("sized write must be 1..=8 bytes"));
        }
        self.write_would_overflow(n_bytes)?;
        codec::put_sized_u64(&mut self.data, n_bytes, endian, value)
    }

    pub fn tlv_write_string(&mut self, prefix_size: u8, value: &str) -> Result<(), Error> {
        if prefix_size > 2 {
            return Err(Error::InvalidArgs("string size prefix must be 0..=2 bytes"));
        }
        self.write_would_overflow(usize::from(prefix_size) + value.len())?;
        codec::put_string(&mut self.data, prefix_size, value)
    }

    pub fn tlv_write_bytes(&mut self, value: &[u8]) -> Result<(), Error> {
        self.write_would_overflow(value.len())?;
        self.data.put_slice(value);
        Ok(())
    }

    /// Appends a complete TLV in one go.
    pub fn add_raw_tlv(&mut self, tlv_type: u8, value: &[u8]) -> Result<(), Error> {
        if value.is_empty() {
            return Err(Error::InvalidArgs("raw TLV value must not be empty"));
        }
        self.write_would_overflow(3 + value.len())?;
        self.data.put_u8(tlv_type);
        self.data.put_u16_le(value.len() as u16);
        self.data.put_slice(value);
        self.set_qmux_length(self.qmux_length() + (3 + value.len()) as u16);
        self.set_tlv_length(self.tlv_length() + (3 + value.len()) as u16);
        self.check()
    }

    /// Iterates TLVs in wire order as `(type, value)` pairs.
    pub fn tlvs(&self) -> TlvIter<'_> {
        TlvIter { data: &self.data, cursor: self.tlv_start() }
    }

    /// Borrows the value of the first TLV of `tlv_type`.
    pub fn raw_tlv(&self, tlv_type: u8) -> Option<&[u8]> {
        self.tlvs().find(|(t, _)| *t == tlv_type).map(|(_, v)| v)
    }

    /// Opens a bounded read cursor over the first TLV of `tlv_type`,
    /// returning it together with the TLV's value length.
    pub fn tlv_read_init(&self, tlv_type: u8) -> Result<(Reader<'_>, u16), Error> {
        let value = self.raw_tlv(tlv_type).ok_or(Error::TlvNotFound(tlv_type))?;
        Ok((Reader::new(value), value.len() as u16))
    }

    /// Reads the mandatory result TLV of a response.
    /// `ProtocolError::None` means the operation succeeded.
    pub fn result_code(&self) -> Result<ProtocolError, Error> {
        let (mut reader, _) = self.tlv_read_init(TLV_RESULT)?;
        let status = reader.read_u16(Endian::Little)?;
        let code = reader.read_u16(Endian::Little)?;
        if status == 0 {
            Ok(ProtocolError::None)
        } else {
            Ok(ProtocolError::from_code(code))
        }
    }

    /// Whether the multiplexer may abort this request after it has been
    /// sent. Consulted only for requests; everything not in the
    /// per-service table is not abortable.
    pub fn is_abortable(&self) -> bool {
        if !self.is_request() {
            return false;
        }
        match Service::from_id(self.service_id()) {
            Some(service) => {
                ABORTABLE.iter().any(|(s, m)| *s == service && *m == self.message_id())
            }
            None => false,
        }
    }

    fn header_flags_string(&self) -> String {
        let flags = self.header_flags();
        let mut parts = Vec::new();
        if self.is_control() {
            if flags & CTL_FLAG_RESPONSE != 0 {
                parts.push("response");
            }
            if flags & CTL_FLAG_INDICATION != 0 {
                parts.push("indication");
            }
        } else {
            if flags & SERVICE_FLAG_COMPOUND != 0 {
                parts.push("compound");
            }
            if flags & SERVICE_FLAG_RESPONSE != 0 {
                parts.push("response");
            }
            if flags & SERVICE_FLAG_INDICATION != 0 {
                parts.push("indication");
            }
        }
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join("|")
        }
    }

    /// Renders the message for traces. TLV payloads of non-control
    /// services are elided unless `trace.personal_info` allows them, since
    /// identifiers such as the IMSI travel in plain TLVs.
    pub fn printable(&self, line_prefix: &str, trace: &TraceOptions) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{p}QMUX:\n{p}  length  = {}\n{p}  flags   = 0x{:02x}\n{p}  service = \"{}\"\n{p}  client  = {}\n",
            self.qmux_length(),
            self.qmux_flags(),
            Service::name(self.service_id()),
            self.client_id(),
            p = line_prefix,
        ));
        out.push_str(&format!(
            "{p}QMI:\n{p}  flags       = \"{}\"\n{p}  transaction = {}\n{p}  tlv_length  = {}\n{p}  message     = (0x{:04x})\n",
            self.header_flags_string(),
            self.transaction_id(),
            self.tlv_length(),
            self.message_id(),
            p = line_prefix,
        ));

        let show_values = self.is_control() || trace.personal_info;
        for (tlv_type, value) in self.tlvs() {
            out.push_str(&format!(
                "{p}TLV:\n{p}  type   = 0x{:02x}\n{p}  length = {}\n{p}  value  = {}\n",
                tlv_type,
                value.len(),
                if show_values { codec::str_hex(value, ':') } else { "(hidden)".to_string() },
                p = line_prefix,
            ));
        }
        out
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("service", &self.service_id())
            .field("client", &self.client_id())
            .field("transaction", &self.transaction_id())
            .field("message", &format_args!("0x{:04x}", self.message_id()))
            .field("len", &self.data.len())
            .finish()
    }
}

pub struct TlvIter<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor + 3 > self.data.len() {
            return None;
        }
        let tlv_type = self.data[self.cursor];
        let len = usize::from(u16::from_le_bytes([
            self.data[self.cursor + 1],
            self.data[self.cursor + 2],
        ]));
        let start = self.cursor + 3;
        if start + len > self.data.len() {
            return None;
        }
        self.cursor = start + len;
        Some((tlv_type, &self.data[start..start + len]))
    }
}
