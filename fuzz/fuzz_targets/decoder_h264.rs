#![no_main]

use std::sync::Arc;

use h264_mvc_frontend::codec::h264::parser::Sps;
use h264_mvc_frontend::codec::h264::picture::PictureData;
use h264_mvc_frontend::decoder::h264::H264Decoder;
use h264_mvc_frontend::decoder::h264::H264DecoderBackend;
use h264_mvc_frontend::decoder::h264::SliceDescriptor;
use h264_mvc_frontend::decoder::pipeline::Task;
use h264_mvc_frontend::decoder::BackendResult;
use libfuzzer_sys::fuzz_target;

/// Backend that releases every slice as soon as it receives it.
#[derive(Default)]
struct Backend {
    next_handle: u32,
}

impl H264DecoderBackend for Backend {
    type Handle = u32;

    fn new_sequence(&mut self, _: &Arc<Sps>) -> BackendResult<()> {
        Ok(())
    }

    fn new_picture(&mut self, _: &PictureData, _: u64) -> BackendResult<u32> {
        self.next_handle = self.next_handle.wrapping_add(1);
        Ok(self.next_handle)
    }

    fn new_field_picture(&mut self, _: &PictureData, _: u64, first: &u32) -> BackendResult<u32> {
        Ok(*first)
    }

    fn decode_slice(&mut self, task: Task<SliceDescriptor<u32>>) -> BackendResult<()> {
        task.complete();
        Ok(())
    }

    fn submit_picture(&mut self, _: &u32) -> BackendResult<()> {
        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    let mut decoder = H264Decoder::new(Backend::default(), Default::default());

    // Feed the input in uneven chunks to exercise NAL unit reassembly.
    let (head, tail) = data.split_at(data.len() / 3);
    if decoder.decode(0, head).is_err() || decoder.decode(1, tail).is_err() {
        return;
    }
    let _ = decoder.flush();
    while decoder.next_event().is_some() {}
});
