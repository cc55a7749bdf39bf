#![no_main]

use libfuzzer_sys::fuzz_target;
use swarm_dl::bencode::Value;

fuzz_target!(|data: &[u8]| {
    if let Ok((value, consumed)) = Value::decode(data) {
        assert!(consumed <= data.len());
        // Canonical output must re-decode to the same value.
        let encoded = value.encode();
        let reparsed = Value::decode_exact(&encoded).expect("canonical encoding must re-decode");
        assert_eq!(reparsed.encode(), encoded);
    }
});
