#![no_main]

use calltrace::filter::FilterEngine;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Parsing and deciding must not panic regardless of input
        let filter = FilterEngine::parse(input);
        let _ = filter.decide(Some("libc.so.6"), "malloc");
        let _ = filter.decide(None, "");
        let _ = filter.module_allowed(Some(input));
    }
});
