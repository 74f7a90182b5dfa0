// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 and MVC decoding front end.
//!
//! [`codec::h264`] holds the bitstream side: NAL unit extraction, parameter set and slice
//! header parsing, picture order count derivation and the decoded picture buffer.
//! [`decoder::h264::H264Decoder`] drives them, hands one slice descriptor at a time to an
//! [`decoder::h264::H264DecoderBackend`] and returns decoded pictures in output order.

pub mod codec;
pub mod decoder;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}
