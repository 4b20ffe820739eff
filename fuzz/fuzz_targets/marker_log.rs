#![no_main]

use libfuzzer_sys::fuzz_target;
use publisher_release::{decode_log, encode_log};

fuzz_target!(|data: &[u8]| {
    // Sub-second precision is dropped on encode, so only the second pass
    // must be stable.
    if let Ok(marks) = decode_log(data) {
        let once = encode_log(&marks).expect("encode");
        let reread = decode_log(&once).expect("re-decode");
        assert_eq!(encode_log(&reread).expect("encode"), once);
    }
});
