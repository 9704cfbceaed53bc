//! Fingerprint → instrumented-binary memo.

use std::hash::{BuildHasher, Hash, Hasher};

use ahash::AHashMap;

///32-bit fingerprint over a SPIR-V word stream.
///
/// Process-local only; collisions degrade to re-instrumenting (or, worst
/// case, serving the first writer's binary), never to corruption.
pub fn shader_fingerprint(words: &[u32]) -> u32 {
    // Fixed seeds keep the fingerprint stable for the lifetime of the device
    // regardless of which thread computes it.
    let mut hasher = ahash::RandomState::with_seeds(
        0x736c_6179,
        0x6572_5f67,
        0x7075_6176,
        0x5f69_6e73,
    )
    .build_hasher();
    words.hash(&mut hasher);
    hasher.finish() as u32
}

///Insertion-only store of instrumented shaders, keyed by fingerprint.
///
/// First writer wins: a duplicate `add` (same fingerprint, whatever the
/// contents) leaves the existing entry untouched.
#[derive(Default)]
pub struct SpirvCache {
    spirv_shaders: AHashMap<u32, Vec<u32>>,
}

impl SpirvCache {
    pub fn add(&mut self, fingerprint: u32, words: Vec<u32>) {
        self.spirv_shaders.entry(fingerprint).or_insert(words);
    }

    pub fn get(&self, fingerprint: u32) -> Option<&[u32]> {
        self.spirv_shaders.get(&fingerprint).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.spirv_shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spirv_shaders.is_empty()
    }
}
