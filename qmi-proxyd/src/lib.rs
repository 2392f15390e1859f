// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Library half of the QMI proxy daemon; the binary in `main.rs` wires it
//! to the CLI, the logger and the signal handlers.

pub mod proxy;
