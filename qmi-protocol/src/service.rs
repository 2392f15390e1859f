// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

/// QMI service identifiers. The control service (0x00) governs client-id
/// allocation; every other service has its own message-id and client-id
/// namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Service {
    Ctl = 0x00,
    Wds = 0x01,
    Dms = 0x02,
    Nas = 0x03,
    Qos = 0x04,
    Wms = 0x05,
    Pds = 0x06,
    Auth = 0x07,
    At = 0x08,
    Voice = 0x09,
    Cat2 = 0x0a,
    Uim = 0x0b,
    Pbm = 0x0c,
    Loc = 0x10,
    Sar = 0x11,
    Rmtfs = 0x14,
    Cat = 0xe0,
    Rms = 0xe1,
    Oma = 0xe2,
}

impl Service {
    pub fn from_id(id: u8) -> Option<Service> {
        Some(match id {
            0x00 => Service::Ctl,
            0x01 => Service::Wds,
            0x02 => Service::Dms,
            0x03 => Service::Nas,
            0x04 => Service::Qos,
            0x05 => Service::Wms,
            0x06 => Service::Pds,
            0x07 => Service::Auth,
            0x08 => Service::At,
            0x09 => Service::Voice,
            0x0a => Service::Cat2,
            0x0b => Service::Uim,
            0x0c => Service::Pbm,
            0x10 => Service::Loc,
            0x11 => Service::Sar,
            0x14 => Service::Rmtfs,
            0xe0 => Service::Cat,
            0xe1 => Service::Rms,
            0xe2 => Service::Oma,
            _ => return None,
        })
    }

    pub fn name(id: u8) -> &'static str {
        match Service::from_id(id) {
            Some(Service::Ctl) => "ctl",
            Some(Service::Wds) => "wds",
            Some(Service::Dms) => "dms",
            Some(Service::Nas) => "nas",
            Some(Service::Qos) => "qos",
            Some(Service::Wms) => "wms",
            Some(Service::Pds) => "pds",
            Some(Service::Auth) => "auth",
            Some(Service::At) => "at",
            Some(Service::Voice) => "voice",
            Some(Service::Cat2) => "cat2",
            Some(Service::Uim) => "uim",
            Some(Service::Pbm) => "pbm",
            Some(Service::Loc) => "loc",
            Some(Service::Sar) => "sar",
            Some(Service::Rmtfs) => "rmtfs",
            Some(Service::Cat) => "cat",
            Some(Service::Rms) => "rms",
            Some(Service::Oma) => "oma",
            None => "unknown",
        }
    }
}

impl From<Service> for u8 {
    fn from(service: Service) -> u8 {
        service as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_ids() {
        assert_eq!(u8::from(Service::Ctl), 0x00);
        assert_eq!(u8::from(Service::Wds), 0x01);
        assert_eq!(Service::from_id(0x03), Some(Service::Nas));
        assert_eq!(Service::from_id(0x42), None);
        assert_eq!(Service::name(0x02), "dms");
        assert_eq!(Service::name(0x42), "unknown");
    }
}
