// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Control-plane datagrams exchanged with the router's name service.
//!
//! Every packet is 20 bytes of little-endian `u32`s: a command followed by
//! a server record `{service, instance, node, port}`. The `instance` word
//! packs the service version in its low 8 bits and an instance counter in
//! the high 24.

/// The name service listens on this well-known port.
pub const QRTR_PORT_CTRL: u32 = 0xffff_fffe;

pub const QRTR_TYPE_NEW_LOOKUP: u32 = 3;
pub const QRTR_TYPE_NEW_SERVER: u32 = 4;
pub const QRTR_TYPE_DEL_SERVER: u32 = 5;

pub const CTRL_PACKET_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerRecord {
    pub service: u32,
    pub version: u32,
    pub instance: u32,
    pub node: u32,
    pub port: u32,
}

impl ServerRecord {
    /// The all-zero NEW_SERVER record marks the end of the initial lookup.
    pub fn is_lookup_done(&self) -> bool {
        self.service == 0 && self.version == 0 && self.instance == 0 && self.node == 0 && self.port == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPacket {
    NewServer(ServerRecord),
    DelServer(ServerRecord),
    Other(u32),
}

impl ControlPacket {
    /// Parses a control datagram; `None` for short packets, which the bus
    /// ignores.
    pub fn parse(data: &[u8]) -> Option<ControlPacket> {
        if data.len() < CTRL_PACKET_SIZE {
            return None;
        }
        let word = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let cmd = word(0);
        let instance_word = word(8);
        let record = ServerRecord {
            service: word(4),
            version: instance_word & 0xff,
            instance: instance_word >> 8,
            node: word(12),
            port: word(16),
        };
        Some(match cmd {
            QRTR_TYPE_NEW_SERVER => ControlPacket::NewServer(record),
            QRTR_TYPE_DEL_SERVER => ControlPacket::DelServer(record),
            other => ControlPacket::Other(other),
        })
    }

    /// Encodes the lookup request that subscribes the socket to the name
    /// service's directory.
    pub fn new_lookup() -> [u8; CTRL_PACKET_SIZE] {
        let mut packet = [0u8; CTRL_PACKET_SIZE];
        packet[..4].copy_from_slice(&QRTR_TYPE_NEW_LOOKUP.to_le_bytes());
        packet
    }

    #[cfg(test)]
    pub fn encode(cmd: u32, record: &ServerRecord) -> [u8; CTRL_PACKET_SIZE] {
        let mut packet = [0u8; CTRL_PACKET_SIZE];
        packet[..4].copy_from_slice(&cmd.to_le_bytes());
        packet[4..8].copy_from_slice(&record.service.to_le_bytes());
        let instance_word = (record.instance << 8) | (record.version & 0xff);
        packet[8..12].copy_from_slice(&instance_word.to_le_bytes());
        packet[12..16].copy_from_slice(&record.node.to_le_bytes());
        packet[16..20].copy_from_slice(&record.port.to_le_bytes());
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_new_server() {
        let record =
            ServerRecord { service: 34, version: 1, instance: 2, node: 5, port: 7 };
        let bytes = ControlPacket::encode(QRTR_TYPE_NEW_SERVER, &record);
        assert_eq!(ControlPacket::parse(&bytes), Some(ControlPacket::NewServer(record)));
    }

    #[test]
    fn test_parse_del_server() {
        let record =
            ServerRecord { service: 34, version: 1, instance: 0, node: 5, port: 7 };
        let bytes = ControlPacket::encode(QRTR_TYPE_DEL_SERVER, &record);
        assert_eq!(ControlPacket::parse(&bytes), Some(ControlPacket::DelServer(record)));
    }

    #[test]
    fn test_parse_short_packet() {
        assert_eq!(ControlPacket::parse(&[0u8; 19]), None);
    }

    #[test]
    fn test_parse_unknown_command() {
        let record = ServerRecord { service: 0, version: 0, instance: 0, node: 0, port: 0 };
        let bytes = ControlPacket::encode(9, &record);
        assert_eq!(ControlPacket::parse(&bytes), Some(ControlPacket::Other(9)));
    }

    #[test]
    fn test_instance_word_split() {
        let record =
            ServerRecord { service: 1, version: 0x05, instance: 0x123456, node: 1, port: 1 };
        let bytes = ControlPacket::encode(QRTR_TYPE_NEW_SERVER, &record);
        match ControlPacket::parse(&bytes) {
            Some(ControlPacket::NewServer(parsed)) => {
                assert_eq!(parsed.version, 0x05);
                assert_eq!(parsed.instance, 0x123456);
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn test_lookup_done_sentinel() {
        let zero = ServerRecord { service: 0, version: 0, instance: 0, node: 0, port: 0 };
        assert!(zero.is_lookup_done());
        let nonzero = ServerRecord { service: 1, ..zero };
        assert!(!nonzero.is_lookup_done());
    }

    #[test]
    fn test_new_lookup_layout() {
        let packet = ControlPacket::new_lookup();
        assert_eq!(&packet[..4], &[3, 0, 0, 0]);
        assert_eq!(&packet[4..], &[0u8; 16]);
    }
}
