//! Fuzz target for repository path resolution.
//!
//! A resolved path never leaves the repository root.

#![no_main]

use libfuzzer_sys::fuzz_target;
use stowage_storage::EntryPath;

fuzz_target!(|data: &[u8]| {
    let Ok(name) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(path) = EntryPath::resolve(name) {
        for segment in path.segments() {
            assert!(!segment.is_empty());
            assert_ne!(segment, ".");
            assert_ne!(segment, "..");
            assert!(!segment.contains('/') && !segment.contains('\\'));
        }
    }
});
