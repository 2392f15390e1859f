// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Builders and parsers for the handful of control-service messages the
//! stack itself speaks: client-id allocation and release, the per-service
//! abort, and the proxy's open handshake.

use qmi_protocol::message::MESSAGE_ABORT;
use qmi_protocol::{ctl, Endian, Message, ProtocolError, Service};

use crate::Error;

const CTL: u8 = Service::Ctl as u8;

/// Builds an "allocate client id" request for `service`. The transaction
/// id is stamped by the multiplexer on send.
pub fn allocate_cid_request(service: u8) -> Result<Message, Error> {
    let mut message = Message::new(CTL, 0, 0, ctl::MESSAGE_ALLOCATE_CID)?;
    let tlv = message.tlv_write_init(ctl::TLV_VALUE)?;
    message.tlv_write_u8(service)?;
    message.tlv_write_complete(tlv)?;
    Ok(message)
}

/// Builds a "release client id" request for the `(service, client id)`
/// pair.
pub fn release_cid_request(service: u8, client_id: u8) -> Result<Message, Error> {
    let mut message = Message::new(CTL, 0, 0, ctl::MESSAGE_RELEASE_CID)?;
    let tlv = message.tlv_write_init(ctl::TLV_VALUE)?;
    message.tlv_write_u8(service)?;
    message.tlv_write_u8(client_id)?;
    message.tlv_write_complete(tlv)?;
    Ok(message)
}

/// Reads the `(service, client id)` pair out of an allocate or release
/// response, surfacing the device's result TLV as an error.
pub fn parse_cid_response(response: &Message) -> Result<(u8, u8), Error> {
    match response.result_code()? {
        ProtocolError::None => {}
        error => return Err(Error::Protocol(error)),
    }
    let (mut reader, _) = response.tlv_read_init(ctl::TLV_VALUE)?;
    let service = reader.read_u8()?;
    let client_id = reader.read_u8()?;
    Ok((service, client_id))
}

/// Builds the abort for a previously sent request. Unlike the other
/// builders this one is stamped by the caller, because it is emitted from
/// the cancellation path which already owns an id.
pub fn abort_request(
    service: u8,
    client_id: u8,
    transaction_id: u16,
    aborted_transaction_id: u16,
) -> Result<Message, Error> {
    let mut message = Message::new(service, client_id, transaction_id, MESSAGE_ABORT)?;
    let tlv = message.tlv_write_init(ctl::TLV_VALUE)?;
    message.tlv_write_u16(Endian::Little, aborted_transaction_id)?;
    message.tlv_write_complete(tlv)?;
    Ok(message)
}

/// Builds the proxy open handshake naming the device the client wants to
/// share.
pub fn proxy_open_request(device_path: &str) -> Result<Message, Error> {
    let mut message = Message::new(CTL, 0, 0, ctl::MESSAGE_INTERNAL_PROXY_OPEN)?;
    let tlv = message.tlv_write_init(ctl::TLV_VALUE)?;
    message.tlv_write_string(0, device_path)?;
    message.tlv_write_complete(tlv)?;
    Ok(message)
}

/// Reads the device path from a proxy open request.
pub fn parse_proxy_open_request(request: &Message) -> Result<String, Error> {
    let (mut reader, _) = request.tlv_read_init(ctl::TLV_VALUE)?;
    Ok(reader.read_string(0, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_allocate_cid_round_trip() {
        let request = allocate_cid_request(Service::Wds as u8).unwrap();
        assert_eq!(request.service_id(), CTL);
        assert_eq!(request.message_id(), ctl::MESSAGE_ALLOCATE_CID);
        assert_eq!(request.raw_tlv(ctl::TLV_VALUE).unwrap(), &[Service::Wds as u8]);

        let mut response = Message::response(&request, ProtocolError::None);
        response.add_raw_tlv(ctl::TLV_VALUE, &[Service::Wds as u8, 0x07]).unwrap();
        assert_eq!(parse_cid_response(&response).unwrap(), (Service::Wds as u8, 0x07));
    }

    #[test]
    fn test_cid_response_surfaces_device_error() {
        let request = allocate_cid_request(Service::Wds as u8).unwrap();
        let response = Message::response(&request, ProtocolError::ClientIdsExhausted);
        assert_matches!(
            parse_cid_response(&response),
            Err(Error::Protocol(ProtocolError::ClientIdsExhausted))
        );
    }

    #[test]
    fn test_release_cid_layout() {
        let request = release_cid_request(Service::Nas as u8, 0x0b).unwrap();
        assert_eq!(request.message_id(), ctl::MESSAGE_RELEASE_CID);
        assert_eq!(request.raw_tlv(ctl::TLV_VALUE).unwrap(), &[Service::Nas as u8, 0x0b]);
    }

    #[test]
    fn test_abort_layout() {
        let abort = abort_request(Service::Wds as u8, 3, 9, 0x1234).unwrap();
        assert_eq!(abort.message_id(), MESSAGE_ABORT);
        assert_eq!(abort.transaction_id(), 9);
        assert_eq!(abort.raw_tlv(ctl::TLV_VALUE).unwrap(), &[0x34, 0x12]);
    }

    #[test]
    fn test_proxy_open_round_trip() {
        let request = proxy_open_request("/dev/cdc-wdm0").unwrap();
        assert_eq!(request.message_id(), ctl::MESSAGE_INTERNAL_PROXY_OPEN);
        assert_eq!(parse_proxy_open_request(&request).unwrap(), "/dev/cdc-wdm0");
    }
}
