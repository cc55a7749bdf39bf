#![no_main]

use libfuzzer_sys::fuzz_target;
use swarm_dl::MagnetLink;

fuzz_target!(|data: &[u8]| {
    if let Ok(uri) = std::str::from_utf8(data) {
        let _ = MagnetLink::parse(uri);
    }
});
