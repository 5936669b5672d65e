#![no_main]

use distbuild_proto::message::Message;
use libfuzzer_sys::fuzz_target;

/// `Message::decode` sees exactly one already-length-delimited frame body
/// (the decoder above is what handles the length prefix); this target
/// checks that arbitrary frame bodies never panic the JSON decode path,
/// independent of whether `FrameDecoder` would ever hand them over.
fuzz_target!(|data: &[u8]| {
    let _ = Message::decode(data);
});
