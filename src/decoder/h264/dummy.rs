// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation.

use std::sync::Arc;

use crate::codec::h264::parser::Sps;
use crate::codec::h264::picture::PictureData;
use crate::decoder::h264::H264DecoderBackend;
use crate::decoder::h264::SliceDescriptor;
use crate::decoder::pipeline::Task;
use crate::decoder::BackendResult;

/// Records everything it is handed. Handles are sequential picture numbers starting at 1.
#[derive(Default)]
pub struct Backend {
    pub sequences: Vec<Arc<Sps>>,
    pub slices: Vec<SliceDescriptor<u32>>,
    pub submitted: Vec<u32>,
    /// The last slice is only released when the next one arrives or the picture is
    /// submitted, like a hardware queue one entry deep would do.
    pending: Option<Task<SliceDescriptor<u32>>>,
    next_handle: u32,
}

impl H264DecoderBackend for Backend {
    type Handle = u32;

    fn new_sequence(&mut self, sps: &Arc<Sps>) -> BackendResult<()> {
        self.sequences.push(Arc::clone(sps));
        Ok(())
    }

    fn new_picture(&mut self, _: &PictureData, _: u64) -> BackendResult<Self::Handle> {
        self.next_handle += 1;
        Ok(self.next_handle)
    }

    fn new_field_picture(
        &mut self,
        _: &PictureData,
        _: u64,
        first_field: &Self::Handle,
    ) -> BackendResult<Self::Handle> {
        Ok(*first_field)
    }

    fn decode_slice(&mut self, task: Task<SliceDescriptor<u32>>) -> BackendResult<()> {
        self.slices.push(task.payload().clone());
        self.pending = Some(task);
        Ok(())
    }

    fn submit_picture(&mut self, picture: &Self::Handle) -> BackendResult<()> {
        self.pending = None;
        self.submitted.push(*picture);
        Ok(())
    }
}
