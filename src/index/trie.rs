//! Compressed trie mapping face names to face handles
//!
//! Nodes live in an arena and are addressed by [`NodeId`]; edges carry
//! multi-character labels. Every node keeps its outgoing edges sorted, and no
//! two edges of a node share a first character, so edge lookup is a binary
//! search on the leading `char` of the remaining key.
//!
//! Two lookups are supported:
//! - exact: payloads stored under exactly `key`
//! - truncated: payloads of every key that starts with `key`, used when the
//!   client-side name may have been cut off by a fixed-size field

use crate::index::types::FaceId;

/// What to do when a key is inserted that already carries payloads
///
/// Chosen when the trie is built; lookups always return every stored payload.
/// The face index always appends (see `NAME_DUPLICATE_POLICY` in
/// [`crate::index::store`]); `KeepFirst` is there for callers that want one
/// face per name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Append the new face to the key's payload list
    #[default]
    Append,
    /// Keep the payloads already stored and drop the new one
    KeepFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeId(u32);

impl NodeId {
    const ROOT: NodeId = NodeId(0);

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct Edge {
    label: String,
    child: NodeId,
}

#[derive(Debug, Default)]
struct Node {
    /// Sorted by label; labels never empty, first chars distinct
    edges: Vec<Edge>,
    /// Faces whose key ends exactly at this node
    faces: Vec<FaceId>,
}

impl Node {
    fn leaf(face: FaceId) -> Self {
        Self {
            edges: Vec::new(),
            faces: vec![face],
        }
    }
}

/// Compressed trie keyed by face name
#[derive(Debug)]
pub struct FaceTrie {
    nodes: Vec<Node>,
    policy: DuplicatePolicy,
    entries: usize,
}

impl Default for FaceTrie {
    fn default() -> Self {
        Self::new(DuplicatePolicy::default())
    }
}

impl FaceTrie {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            nodes: vec![Node::default()],
            policy,
            entries: 0,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Number of stored (key, face) references
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Insert `face` under `key`. Empty keys are ignored.
    pub fn add_entry(&mut self, key: &str, face: FaceId) {
        let mut node = NodeId::ROOT;
        let mut rest = key;

        loop {
            let Some(leading) = rest.chars().next() else {
                return;
            };

            let pos = match self.find_edge(node, leading) {
                Ok(pos) => pos,
                Err(pos) => {
                    // No edge starts with this character: hang a new leaf here
                    let child = self.alloc(Node::leaf(face));
                    self.nodes[node.index()].edges.insert(
                        pos,
                        Edge {
                            label: rest.to_owned(),
                            child,
                        },
                    );
                    self.entries += 1;
                    return;
                }
            };

            let edge = &self.nodes[node.index()].edges[pos];
            let child = edge.child;
            let label_len = edge.label.len();
            let common = common_prefix_len(&edge.label, rest);

            if common == label_len && common == rest.len() {
                self.attach(child, face);
                return;
            }

            if common == label_len {
                // Edge label is a prefix of the key
                node = child;
                rest = &rest[common..];
                continue;
            }

            let old_tail = self.nodes[node.index()].edges[pos].label[common..].to_owned();

            let intermediate = if common == rest.len() {
                // Key is a prefix of the edge label: split, payload on the split node
                self.entries += 1;
                Node {
                    edges: vec![Edge {
                        label: old_tail,
                        child,
                    }],
                    faces: vec![face],
                }
            } else {
                // Key and label diverge after a shared prefix
                let leaf = self.alloc(Node::leaf(face));
                self.entries += 1;
                let mut edges = vec![
                    Edge {
                        label: old_tail,
                        child,
                    },
                    Edge {
                        label: rest[common..].to_owned(),
                        child: leaf,
                    },
                ];
                edges.sort_by(|a, b| a.label.cmp(&b.label));
                Node {
                    edges,
                    faces: Vec::new(),
                }
            };

            let intermediate = self.alloc(intermediate);
            // The first character is unchanged, so the parent's edge order holds
            let edge = &mut self.nodes[node.index()].edges[pos];
            edge.label.truncate(common);
            edge.child = intermediate;
            return;
        }
    }

    /// Look up `key`.
    ///
    /// With `truncated` set, every face stored under a key that starts with
    /// `key` is returned in pre-order. Returns an empty list when nothing
    /// matches.
    pub fn query_entry(&self, key: &str, truncated: bool) -> Vec<FaceId> {
        let mut result = Vec::new();
        let mut node = NodeId::ROOT;
        let mut rest = key;

        loop {
            let Some(leading) = rest.chars().next() else {
                return result;
            };
            let Ok(pos) = self.find_edge(node, leading) else {
                return result;
            };

            let edge = &self.nodes[node.index()].edges[pos];
            let common = common_prefix_len(&edge.label, rest);

            if common == rest.len() {
                // Key exhausted, either on a node or in the middle of an edge
                if truncated {
                    self.collect_subtree(edge.child, &mut result);
                } else if common == edge.label.len() {
                    result.extend_from_slice(&self.nodes[edge.child.index()].faces);
                }
                return result;
            }

            if common < edge.label.len() {
                return result;
            }

            node = edge.child;
            rest = &rest[common..];
        }
    }

    fn find_edge(&self, node: NodeId, leading: char) -> Result<usize, usize> {
        self.nodes[node.index()]
            .edges
            .binary_search_by(|edge| first_char(&edge.label).cmp(&leading))
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn attach(&mut self, node: NodeId, face: FaceId) {
        let faces = &mut self.nodes[node.index()].faces;
        if faces.contains(&face) {
            return;
        }
        if !faces.is_empty() && self.policy == DuplicatePolicy::KeepFirst {
            return;
        }
        faces.push(face);
        self.entries += 1;
    }

    fn collect_subtree(&self, start: NodeId, out: &mut Vec<FaceId>) {
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.index()];
            out.extend_from_slice(&node.faces);
            // Reverse so the smallest label is visited first
            stack.extend(node.edges.iter().rev().map(|e| e.child));
        }
    }
}

#[inline]
fn first_char(label: &str) -> char {
    label.chars().next().unwrap_or('\0')
}

/// Length in bytes of the longest common prefix, on a char boundary
fn common_prefix_len(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()))
}
