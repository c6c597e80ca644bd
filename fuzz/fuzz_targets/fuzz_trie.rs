#![no_main]

use arbitrary::Arbitrary;
use fontresolve::index::{DuplicatePolicy, FaceId, FaceTrie};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    keep_first: bool,
    keys: Vec<String>,
    lookups: Vec<String>,
}

fuzz_target!(|input: Input| {
    let policy = if input.keep_first {
        DuplicatePolicy::KeepFirst
    } else {
        DuplicatePolicy::Append
    };
    let mut trie = FaceTrie::new(policy);
    for (i, key) in input.keys.iter().enumerate() {
        trie.add_entry(key, FaceId(i as u32));
    }

    // Every inserted key must be found again, exactly and as a prefix
    for (i, key) in input.keys.iter().enumerate() {
        if key.is_empty() {
            continue;
        }
        let exact = trie.query_entry(key, false);
        assert!(!exact.is_empty());
        if policy == DuplicatePolicy::Append {
            assert!(exact.contains(&FaceId(i as u32)));
        }
        assert!(trie.query_entry(key, true).len() >= exact.len());
    }

    for key in &input.lookups {
        let _ = trie.query_entry(key, false);
        let _ = trie.query_entry(key, true);
    }
});
