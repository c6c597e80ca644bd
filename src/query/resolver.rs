use crate::index::store::{Generation, IndexStore};
use crate::index::types::{FaceDescriptor, FaceId, NameClass};
use crate::server::RequestHandler;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::trace;

/// Length, in UTF-16 code units, at which a queried name may have been cut off.
///
/// GDI carries face names in `LOGFONTW::lfFaceName`, a 32-unit buffer that
/// includes the terminating NUL. A name of exactly 31 units may be the prefix
/// of a longer real name, so such queries are matched as prefixes.
pub const TRUNCATED_QUERY_LEN: usize = 31;

/// Whether `query` must be treated as a possibly truncated name
pub fn is_truncated_query(query: &str) -> bool {
    query.encode_utf16().count() == TRUNCATED_QUERY_LEN
}

/// Resolves font names against the active generation
#[derive(Debug, Clone)]
pub struct QueryResolver {
    store: Arc<IndexStore>,
}

impl QueryResolver {
    pub fn new(store: Arc<IndexStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    /// Resolve a name to the faces it may refer to.
    ///
    /// A family-name match wins outright. Otherwise PostScript-name matches
    /// on PostScript-outline faces come first, then full-name matches on
    /// TrueType-outline faces. Each (path, face index) appears once.
    pub fn resolve(&self, query: &str) -> Vec<FaceDescriptor> {
        if query.is_empty() {
            return Vec::new();
        }

        let generation = self.store.active();
        let faces = resolve_in(&generation, query);

        trace!(
            query,
            version = generation.version(),
            results = faces.len(),
            "resolved query"
        );
        faces
    }
}

/// Apply the lookup policy to one pinned generation
fn resolve_in(generation: &Generation, query: &str) -> Vec<FaceDescriptor> {
    let truncated = is_truncated_query(query);
    let mut seen = FxHashSet::default();
    let mut result = Vec::new();

    let family = generation.trie(NameClass::Family).query_entry(query, truncated);
    if !family.is_empty() {
        append_faces(generation, &family, &mut seen, &mut result);
        return result;
    }

    let mut postscript = generation
        .trie(NameClass::PostScriptName)
        .query_entry(query, truncated);
    postscript.retain(|&id| generation.face(id).ps_outline);

    let mut full_name = generation.trie(NameClass::FullName).query_entry(query, truncated);
    full_name.retain(|&id| !generation.face(id).ps_outline);

    append_faces(generation, &postscript, &mut seen, &mut result);
    append_faces(generation, &full_name, &mut seen, &mut result);
    result
}

fn append_faces<'g>(
    generation: &'g Generation,
    ids: &[FaceId],
    seen: &mut FxHashSet<(&'g str, u32)>,
    out: &mut Vec<FaceDescriptor>,
) {
    for &id in ids {
        let face = generation.face(id);
        if seen.insert(face.key()) {
            out.push(face.to_descriptor());
        }
    }
}

impl RequestHandler for QueryResolver {
    fn handle_query(&self, query: &str) -> Vec<FaceDescriptor> {
        self.resolve(query)
    }
}
