//! Fuzz target for the backend response parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_response_parser
//!
//! Any line the reader might see goes through `Response::parse()`. Parsed
//! responses are re-rendered and parsed again; the result must match, and
//! typed extraction must never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use stowage_core::Response;

fuzz_target!(|data: &[u8]| {
    let line = String::from_utf8_lossy(data);
    let Ok(response) = Response::parse(line.trim()) else {
        return;
    };

    let again = Response::parse(&response.to_line()).expect("rendered response must parse");
    assert_eq!(again.body(), response.body());

    let _ = response.try_as_type::<serde_json::Value>();
    let _ = response.try_as_type::<i64>();
    let _ = response.try_as_type::<String>();
});
