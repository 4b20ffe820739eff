#![no_main]

use libfuzzer_sys::fuzz_target;
use publisher_lock::Lease;

fuzz_target!(|data: &[u8]| {
    if let Ok(lease) = Lease::decode(data) {
        let encoded = lease.encode().expect("decoded lease encodes");
        assert_eq!(Lease::decode(&encoded).expect("re-decode"), lease);
    }
});
