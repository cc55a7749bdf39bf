#![no_main]

use libfuzzer_sys::fuzz_target;
use swarm_dl::TorrentFile;

fuzz_target!(|data: &[u8]| {
    let _ = TorrentFile::parse(data);
});
