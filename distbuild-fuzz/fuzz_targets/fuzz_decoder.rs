#![no_main]

use bytes::Bytes;
use distbuild_core::buffer::SegmentedBuffer;
use distbuild_core::framing::FrameDecoder;
use libfuzzer_sys::fuzz_target;

/// Feeds arbitrary bytes through `FrameDecoder` in two pushes (to exercise
/// both the single-segment fast path and the multi-segment staging path),
/// decoding until no more frames are available. A malformed length prefix
/// or truncated body must error, never panic.
fuzz_target!(|data: &[u8]| {
    const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

    let mut decoder = FrameDecoder::new(MAX_FRAME_BYTES);
    let mut buf = SegmentedBuffer::new();

    let split = data.len() / 2;
    buf.push(Bytes::copy_from_slice(&data[..split]));
    let _ = decoder.decode(&mut buf);

    buf.push(Bytes::copy_from_slice(&data[split..]));
    loop {
        match decoder.decode(&mut buf) {
            Ok(Some(_frame)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
});
