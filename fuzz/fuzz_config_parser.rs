//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! Feeds arbitrary text to `AppConfig::parse()`. A config that parses must
//! also yield a socket path without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = stowage_config::AppConfig::parse(s) {
            let _ = config.ipc.resolve_socket_path_with(|_| None);
            let _ = config.reconnect.max_interval();
        }
    }
});
