#![no_main]

use libfuzzer_sys::fuzz_target;
use libtrie::format::{HEADER_LEN, MAGIC, VERSION};
use libtrie::Trie;

const PROBES: [&str; 6] = ["", "a", "ab", "cat", "car", "Dvořák"];

// Raw input rarely gets past the magic and checksums, so also try it with a
// valid magic, version and both CRCs stamped over the fuzzed bytes.
fn stamped(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let mut buf = data.to_vec();
    buf[..8].copy_from_slice(MAGIC);
    buf[8..12].copy_from_slice(&VERSION.to_le_bytes());
    let body = crc32fast::hash(&buf[HEADER_LEN..]);
    buf[28..32].copy_from_slice(&body.to_le_bytes());
    let header = crc32fast::hash(&buf[..68]);
    buf[68..72].copy_from_slice(&header.to_le_bytes());
    Some(buf)
}

fn exercise(bytes: Vec<u8>) {
    let Ok(trie) = Trie::from_vec(bytes) else {
        return;
    };
    let mut out = [0u8; 64];
    for key in PROBES {
        let _ = trie.contains(key);
        let _ = trie.get(key);
        let _ = trie.lookup(key);
        let _ = trie.lookup_into(key, &mut out);
    }
    trie.close();
}

fuzz_target!(|data: &[u8]| {
    exercise(data.to_vec());
    if let Some(buf) = stamped(data) {
        exercise(buf);
    }
});
