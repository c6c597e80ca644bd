#![no_main]

use fontresolve::server::protocol::{decode_request, read_frame};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    // Bodies straight from the wire: must be rejected or accepted, never panic
    let _ = decode_request(data);

    // Framed input with a small cap so huge prefixes are refused early
    let mut cursor = Cursor::new(data);
    while let Ok(body) = read_frame(&mut cursor, 64 * 1024) {
        let _ = decode_request(&body);
    }
});
