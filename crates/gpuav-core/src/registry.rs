//! Maps a unique shader id to the identity tuple the diagnostics side reads
//! after a GPU fault.

use std::sync::Arc;

use ahash::AHashMap;
use ash::vk;
use parking_lot::RwLock;

///What the formatter needs to name a faulting shader. Exactly one of
/// `pipeline`/`shader_object` is non-null; `shader_module` may carry the
/// inlined-stage sentinel.
#[derive(Debug)]
pub struct InstrumentedShader {
    pub pipeline: vk::Pipeline,
    pub shader_module: vk::ShaderModule,
    pub shader_object: vk::ShaderEXT,
    ///The application's words as submitted, kept verbatim so instruction
    /// indices resolve to source even after the app destroys its module.
    pub original_words: Vec<u32>,
}

///Concurrent id → record map. Internally locked; deliberately not covered
/// by the core-wide lock so diagnostics never contend with creation calls.
#[derive(Default)]
pub struct InstrumentedShaderRegistry {
    map: RwLock<AHashMap<u32, Arc<InstrumentedShader>>>,
}

impl InstrumentedShaderRegistry {
    pub fn insert_or_assign(&self, unique_shader_id: u32, record: InstrumentedShader) {
        self.map.write().insert(unique_shader_id, Arc::new(record));
    }

    pub fn erase(&self, unique_shader_id: u32) {
        self.map.write().remove(&unique_shader_id);
    }

    pub fn get(&self, unique_shader_id: u32) -> Option<Arc<InstrumentedShader>> {
        self.map.read().get(&unique_shader_id).cloned()
    }

    ///Point-in-time view of every record the predicate accepts. Inserts
    /// racing with the snapshot may be missed; that is fine for the destroy
    /// sweeps this backs.
    pub fn snapshot(
        &self,
        predicate: impl Fn(&InstrumentedShader) -> bool,
    ) -> Vec<(u32, Arc<InstrumentedShader>)> {
        self.map
            .read()
            .iter()
            .filter(|(_, record)| predicate(record))
            .map(|(id, record)| (*id, record.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
