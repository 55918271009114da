#![no_main]

use calltrace::replay::EventScript;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        let _ = EventScript::parse(input);
    }
});
