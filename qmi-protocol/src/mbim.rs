// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MBIMEx v3 information-element TLVs.
//!
//! Unlike QMI TLVs these live outside any QMUX frame:
//!
//! ```text
//! offset  size      field
//! 0       2         type (LE)
//! 2       1         reserved
//! 3       1         padding length
//! 4       4         data length (LE)
//! 8       data_len  data
//! ...     padding   zero bytes up to a 4-byte boundary
//! ```

use bytes::{BufMut, BytesMut};

use crate::codec;
use crate::errors::Error;

const HEADER_SIZE: usize = 8;

/// Well-known MBIM TLV types. Everything else round-trips as raw data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbimTlvType {
    Invalid,
    UePolicies,
    SingleNssai,
    AllowedNssai,
    CfgNssai,
    DfltCfgNssai,
    PrecfgDfltCfgNssai,
    RejNssai,
    Ladn,
    Tai,
    WcharStr,
    Uint16Tbl,
    EapPacket,
    Pco,
    RouteSelectionDescriptors,
    TrafficParameters,
    WakeCommand,
    WakePacket,
    Other(u16),
}

impl MbimTlvType {
    pub fn from_id(id: u16) -> Self {
        match id {
            0 => MbimTlvType::Invalid,
            1 => MbimTlvType::UePolicies,
            2 => MbimTlvType::SingleNssai,
            3 => MbimTlvType::AllowedNssai,
            4 => MbimTlvType::CfgNssai,
            5 => MbimTlvType::DfltCfgNssai,
            6 => MbimTlvType::PrecfgDfltCfgNssai,
            7 => MbimTlvType::RejNssai,
            8 => MbimTlvType::Ladn,
            9 => MbimTlvType::Tai,
            10 => MbimTlvType::WcharStr,
            11 => MbimTlvType::Uint16Tbl,
            12 => MbimTlvType::EapPacket,
            13 => MbimTlvType::Pco,
            14 => MbimTlvType::RouteSelectionDescriptors,
            15 => MbimTlvType::TrafficParameters,
            16 => MbimTlvType::WakeCommand,
            17 => MbimTlvType::WakePacket,
            other => MbimTlvType::Other(other),
        }
    }

    pub fn id(&self) -> u16 {
        match self {
            MbimTlvType::Invalid => 0,
            MbimTlvType::UePolicies => 1,
            MbimTlvType::SingleNssai => 2,
            MbimTlvType::AllowedNssai => 3,
            MbimTlvType::CfgNssai => 4,
            MbimTlvType::DfltCfgNssai => 5,
            MbimTlvType::PrecfgDfltCfgNssai => 6,
            MbimTlvType::RejNssai => 7,
            MbimTlvType::Ladn => 8,
            MbimTlvType::Tai => 9,
            MbimTlvType::WcharStr => 10,
            MbimTlvType::Uint16Tbl => 11,
            MbimTlvType::EapPacket => 12,
            MbimTlvType::Pco => 13,
            MbimTlvType::RouteSelectionDescriptors => 14,
            MbimTlvType::TrafficParameters => 15,
            MbimTlvType::WakeCommand => 16,
            MbimTlvType::WakePacket => 17,
            MbimTlvType::Other(id) => *id,
        }
    }
}

/// The payload of a wake command TLV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeCommand {
    pub service_uuid: [u8; 16],
    pub cid: u32,
    pub payload: Vec<u8>,
}

/// The payload of a wake packet TLV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakePacket {
    pub filter_id: u32,
    pub original_size: u32,
    pub packet: Vec<u8>,
}

/// One MBIM TLV, owning its raw bytes, header and padding included. Total
/// size is always a multiple of four; padding bytes are zero on
/// construction and ignored on parse.
#[derive(Clone, PartialEq, Eq)]
pub struct MbimTlv {
    data: BytesMut,
}

impl MbimTlv {
    pub fn new(tlv_type: MbimTlvType, tlv_data: &[u8]) -> Result<MbimTlv, Error> {
        if tlv_type == MbimTlvType::Invalid {
            return Err(Error::InvalidArgs("invalid MBIM TLV type"));
        }
        let padding = (4 - tlv_data.len() % 4) % 4;
        let mut data = BytesMut::with_capacity(HEADER_SIZE + tlv_data.len() + padding);
        data.put_u16_le(tlv_type.id());
        data.put_u8(0); // reserved
        data.put_u8(padding as u8);
        data.put_u32_le(tlv_data.len() as u32);
        data.put_slice(tlv_data);
        data.put_bytes(0, padding);
        Ok(MbimTlv { data })
    }

    /// Parses one TLV from the head of `raw`, returning it and the number
    /// of bytes consumed.
    pub fn from_raw(raw: &[u8]) -> Result<(MbimTlv, usize), Error> {
        if raw.len() < HEADER_SIZE {
            return Err(Error::InvalidMessage("MBIM TLV shorter than its header".to_string()));
        }
        let data_len = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
        let padding = usize::from(raw[3]);
        let total = HEADER_SIZE + data_len + padding;
        if raw.len() < total {
            return Err(Error::InvalidMessage(format!(
                "MBIM TLV shorter than declared ({} < {})",
                raw.len(),
                total
            )));
        }
        Ok((MbimTlv { data: BytesMut::from(&raw[..total]) }, total))
    }

    pub fn dup(&self) -> MbimTlv {
        MbimTlv { data: self.data.clone() }
    }

    pub fn tlv_type(&self) -> MbimTlvType {
        MbimTlvType::from_id(u16::from_le_bytes([self.data[0], self.data[1]]))
    }

    fn data_length(&self) -> usize {
        u32::from_le_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]) as usize
    }

    /// The TLV data, padding excluded.
    pub fn tlv_data(&self) -> &[u8] {
        &self.data[HEADER_SIZE..HEADER_SIZE + self.data_length()]
    }

    /// The whole TLV as it appears on the wire.
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    /// Decodes a `WcharStr` TLV (UTF-16LE) into UTF-8.
    pub fn string_get(&self) -> Result<String, Error> {
        if self.tlv_type() != MbimTlvType::WcharStr {
            return Err(Error::InvalidArgs("TLV is not a WCHAR string"));
        }
        codec::utf8_from_ucs2le(self.tlv_data())
            .ok_or(Error::InvalidMessage("invalid UTF-16 in WCHAR string TLV".to_string()))
    }

    /// Builds a `WcharStr` TLV from UTF-8.
    pub fn string_new(value: &str) -> Result<MbimTlv, Error> {
        let mut encoded = Vec::with_capacity(value.len() * 2);
        for unit in value.encode_utf16() {
            encoded.extend_from_slice(&unit.to_le_bytes());
        }
        MbimTlv::new(MbimTlvType::WcharStr, &encoded)
    }

    /// Decodes a `Uint16Tbl` TLV into a host-endian vector.
    pub fn u16_array_get(&self) -> Result<Vec<u16>, Error> {
        if self.tlv_type() != MbimTlvType::Uint16Tbl {
            return Err(Error::InvalidArgs("TLV is not a UINT16 array"));
        }
        let data = self.tlv_data();
        if data.len() % 2 != 0 {
            return Err(Error::InvalidMessage(format!(
                "invalid TLV data length, must be multiple of 2: {}",
                data.len()
            )));
        }
        Ok(data.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect())
    }

    /// Decodes a wake command: service UUID, CID and an optional payload at
    /// a fixed offset of 28.
    pub fn wake_command_get(&self) -> Result<WakeCommand, Error> {
        if self.tlv_type() != MbimTlvType::WakeCommand {
            return Err(Error::InvalidArgs("TLV is not a wake command"));
        }
        let data = self.tlv_data();
        if data.len() < 28 {
            return Err(Error::InvalidMessage(format!(
                "cannot read wake command TLV ({} < 28)",
                data.len()
            )));
        }

        let mut service_uuid = [0u8; 16];
        service_uuid.copy_from_slice(&data[..16]);
        let cid = u32::from_le_bytes([data[16], data[17], data[18], data[19]]);
        let payload_offset = u32::from_le_bytes([data[20], data[21], data[22], data[23]]);
        let payload_size = u32::from_le_bytes([data[24], data[25], data[26], data[27]]) as usize;

        let payload = if payload_size > 0 {
            if payload_offset != 28 {
                return Err(Error::InvalidMessage(format!(
                    "cannot read wake command TLV: invalid payload offset ({})",
                    payload_offset
                )));
            }
            if data.len() < 28 + payload_size {
                return Err(Error::InvalidMessage(format!(
                    "cannot read wake command TLV payload ({} bytes) ({} < {})",
                    payload_size,
                    data.len(),
                    28 + payload_size
                )));
            }
            data[28..28 + payload_size].to_vec()
        } else {
            Vec::new()
        };

        Ok(WakeCommand { service_uuid, cid, payload })
    }

    /// Decodes a wake packet: filter id, the original packet size and the
    /// saved bytes at a fixed offset of 16.
    pub fn wake_packet_get(&self) -> Result<WakePacket, Error> {
        if self.tlv_type() != MbimTlvType::WakePacket {
            return Err(Error::InvalidArgs("TLV is not a wake packet"));
        }
        let data = self.tlv_data();
        if data.len() < 16 {
            return Err(Error::InvalidMessage(format!(
                "cannot read wake packet TLV ({} < 16)",
                data.len()
            )));
        }

        let filter_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let original_size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let offset = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        let size = u32::from_le_bytes([data[12], data[13], data[14], data[15]]) as usize;

        let packet = if size > 0 {
            if offset != 16 {
                return Err(Error::InvalidMessage(format!(
                    "cannot read wake packet TLV: invalid saved packet offset ({})",
                    offset
                )));
            }
            if data.len() < 16 + size {
                return Err(Error::InvalidMessage(format!(
                    "cannot read wake packet TLV payload ({} bytes) ({} < {})",
                    size,
                    data.len(),
                    16 + size
                )));
            }
            data[16..16 + size].to_vec()
        } else {
            Vec::new()
        };

        Ok(WakePacket { filter_id, original_size, packet })
    }

    /// Renders the TLV for traces, decoding the structured subtypes inline.
    pub fn printable(&self, line_prefix: &str) -> String {
        let mut out = String::new();
        out.push_str("{\n");
        out.push_str(&format!(
            "{p}  tlv type   = {:?} (0x{:04x})\n{p}  tlv data   = {}\n",
            self.tlv_type(),
            self.tlv_type().id(),
            codec::str_hex(self.tlv_data(), ':'),
            p = line_prefix,
        ));
        match self.tlv_type() {
            MbimTlvType::WcharStr => {
                let value = self
                    .string_get()
                    .unwrap_or_else(|e| format!("*** error: {}", e));
                out.push_str(&format!("{}  tlv string = {}\n", line_prefix, value));
            }
            MbimTlvType::Uint16Tbl => {
                let value = match self.u16_array_get() {
                    Ok(array) => format!(
                        "[{}]",
                        array.iter().map(u16::to_string).collect::<Vec<_>>().join(",")
                    ),
                    Err(e) => format!("*** error: {}", e),
                };
                out.push_str(&format!("{}  tlv uint16 array = {}\n", line_prefix, value));
            }
            _ => {}
        }
        out.push_str(&format!("{}}}", line_prefix));
        out
    }
}

impl std::fmt::Debug for MbimTlv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MbimTlv")
            .field("type", &self.tlv_type())
            .field("data_len", &self.data_length())
            .finish()
    }
}
