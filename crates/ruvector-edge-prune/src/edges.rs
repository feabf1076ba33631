//! Edge table.
//!
//! Every prunable edge of the transformer gets one fixed slot in a flat
//! table of length `N`. Slots are grouped by edge kind and destination
//! layer; each [`MaskGroup`] records its offset and logical shape so a
//! `(batch, N)` gate tensor can be viewed per destination without any
//! dictionary lookups on the hot path.
//!
//! ## Causal structure
//!
//! With `L` layers and `H` heads, the sources visible to a destination are:
//!
//! | destination        | mlp-like sources (embed + MLPs) | attention sources |
//! |--------------------|---------------------------------|-------------------|
//! | attn `i`, q/k/v, h | embed, mlp `0..i`  (`i + 1`)    | attn `0..i` x `H` |
//! | mlp `i`            | embed, mlp `0..i`  (`i + 1`)    | attn `0..=i` x `H`|
//! | final              | embed, mlp `0..L`  (`L + 1`)    | attn `0..L` x `H` |
//!
//! The final destination is stored as the mlp-kind groups at layer `L`.

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Model depth and width, the only inputs the edge table depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelGeometry {
    /// Number of transformer blocks (L)
    pub n_layers: usize,
    /// Attention heads per block (H)
    pub n_heads: usize,
}

impl ModelGeometry {
    /// Create a geometry
    pub const fn new(n_layers: usize, n_heads: usize) -> Self {
        Self { n_layers, n_heads }
    }

    /// Total attention heads across all layers
    #[inline]
    pub fn total_heads(&self) -> usize {
        self.n_layers * self.n_heads
    }

    /// Closed-form edge count implied by the causal structure.
    pub fn expected_edges(&self) -> usize {
        let (l, h) = (self.n_layers, self.n_heads);
        let per_layer: usize = (0..l)
            .map(|i| 3 * h * (i + 1) + 3 * h * i * h + (i + 1) + (i + 1) * h)
            .sum();
        per_layer + (l + 1) + l * h
    }
}

/// Input stream of an attention block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttnStream {
    /// Query input
    Query,
    /// Key input
    Key,
    /// Value input
    Value,
}

impl AttnStream {
    /// All streams in table order
    pub const ALL: [AttnStream; 3] = [AttnStream::Query, AttnStream::Key, AttnStream::Value];

    /// Position of the stream in the mask table
    #[inline]
    pub fn index(self) -> usize {
        match self {
            AttnStream::Query => 0,
            AttnStream::Key => 1,
            AttnStream::Value => 2,
        }
    }

    /// Short name used in diagnostics
    pub fn as_str(self) -> &'static str {
        match self {
            AttnStream::Query => "q",
            AttnStream::Key => "k",
            AttnStream::Value => "v",
        }
    }
}

/// Storage kind of a mask group: (source kind, destination kind).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Embedding / MLP output into an attention input
    MlpToAttn,
    /// Attention head output into an attention input
    AttnToAttn,
    /// Embedding / MLP output into an MLP (or final) input
    MlpToMlp,
    /// Attention head output into an MLP (or final) input
    AttnToMlp,
}

impl EdgeKind {
    /// All kinds in table order
    pub const ALL: [EdgeKind; 4] = [
        EdgeKind::AttnToAttn,
        EdgeKind::MlpToAttn,
        EdgeKind::AttnToMlp,
        EdgeKind::MlpToMlp,
    ];

    fn slot(self) -> usize {
        match self {
            EdgeKind::AttnToAttn => 0,
            EdgeKind::MlpToAttn => 1,
            EdgeKind::AttnToMlp => 2,
            EdgeKind::MlpToMlp => 3,
        }
    }
}

/// Reported edge type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    /// mlp → attn
    MlpAttn,
    /// attn → attn
    AttnAttn,
    /// mlp → mlp
    MlpMlp,
    /// attn → mlp
    AttnMlp,
    /// anything → unembedding input
    Final,
}

/// Upstream component of an edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    /// Token + position embedding
    Embed,
    /// One attention head's output
    Attn {
        /// Source layer
        layer: usize,
        /// Source head
        head: usize,
    },
    /// One MLP's output
    Mlp {
        /// Source layer
        layer: usize,
    },
}

/// Downstream component of an edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// One attention head's q/k/v input
    Attn {
        /// Destination layer
        layer: usize,
        /// Input stream
        stream: AttnStream,
        /// Destination head
        head: usize,
    },
    /// One MLP's input
    Mlp {
        /// Destination layer
        layer: usize,
    },
    /// The unembedding input
    Final,
}

/// A single prunable edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Reported edge type
    pub edge_type: EdgeType,
    /// Upstream component
    pub source: Source,
    /// Downstream component
    pub destination: Destination,
}

/// A contiguous run of slots sharing an edge kind and destination layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskGroup {
    /// Storage kind
    pub kind: EdgeKind,
    /// Destination layer (`n_layers` for the final destination)
    pub layer: usize,
    /// Logical shape of the group (without the batch dimension)
    pub dims: Vec<usize>,
    /// First slot in the flat table
    pub offset: usize,
}

impl MaskGroup {
    /// Number of edges in the group
    #[inline]
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    /// True when the group has no edges
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed indexed table of all prunable edges.
#[derive(Clone, Debug)]
pub struct EdgeLayout {
    geometry: ModelGeometry,
    groups: Vec<MaskGroup>,
    /// `index[layer][kind.slot()]` → position in `groups`
    index: Vec<[Option<usize>; 4]>,
    n_edges: usize,
}

impl EdgeLayout {
    /// Build the table for a model geometry.
    pub fn new(geometry: ModelGeometry) -> Self {
        let (l, h) = (geometry.n_layers, geometry.n_heads);
        let mut groups = Vec::new();
        let mut index = vec![[None; 4]; l + 1];
        let mut offset = 0;

        for kind in EdgeKind::ALL {
            for layer in 0..=l {
                let dims = match kind {
                    EdgeKind::AttnToAttn if layer > 0 && layer < l => vec![3, h, layer, h],
                    EdgeKind::MlpToAttn if layer < l => vec![3, h, layer + 1],
                    EdgeKind::AttnToMlp => vec![(layer + 1).min(l), h],
                    EdgeKind::MlpToMlp => vec![layer + 1],
                    _ => continue,
                };
                let group = MaskGroup {
                    kind,
                    layer,
                    dims,
                    offset,
                };
                offset += group.len();
                index[layer][kind.slot()] = Some(groups.len());
                groups.push(group);
            }
        }

        Self {
            geometry,
            groups,
            index,
            n_edges: offset,
        }
    }

    /// Geometry the table was built from
    #[inline]
    pub fn geometry(&self) -> ModelGeometry {
        self.geometry
    }

    /// Total number of edges (N)
    #[inline]
    pub fn n_edges(&self) -> usize {
        self.n_edges
    }

    /// All groups in table order
    pub fn groups(&self) -> &[MaskGroup] {
        &self.groups
    }

    /// Group for a kind and destination layer, if that destination has such edges.
    #[inline]
    pub fn group(&self, kind: EdgeKind, layer: usize) -> Option<&MaskGroup> {
        self.index
            .get(layer)
            .and_then(|slots| slots[kind.slot()])
            .map(|i| &self.groups[i])
    }

    /// View the `(batch, N)` gate tensor as `(batch, ..group dims)` for one group.
    pub fn view(&self, gates: &Tensor, kind: EdgeKind, layer: usize) -> Result<Option<Tensor>> {
        let Some(group) = self.group(kind, layer) else {
            return Ok(None);
        };
        let n = gates.dim(D::Minus1)?;
        if n != self.n_edges {
            return Err(Error::BadInput(format!(
                "gate tensor has {n} edges, table has {}",
                self.n_edges
            )));
        }
        let batch = gates.dim(0)?;
        let mut shape = Vec::with_capacity(group.dims.len() + 1);
        shape.push(batch);
        shape.extend_from_slice(&group.dims);
        let view = gates.narrow(1, group.offset, group.len())?.reshape(shape)?;
        Ok(Some(view))
    }

    /// Enumerate every edge in flat table order.
    pub fn edges(&self) -> Vec<Edge> {
        let l = self.geometry.n_layers;
        let mlp_source = |j: usize| {
            if j == 0 {
                Source::Embed
            } else {
                Source::Mlp { layer: j - 1 }
            }
        };
        let mlp_dest = |layer: usize| {
            if layer == l {
                Destination::Final
            } else {
                Destination::Mlp { layer }
            }
        };

        let mut edges = Vec::with_capacity(self.n_edges);
        for g in &self.groups {
            match g.kind {
                EdgeKind::AttnToAttn => {
                    for s in 0..3 {
                        for hd in 0..g.dims[1] {
                            for sl in 0..g.dims[2] {
                                for hs in 0..g.dims[3] {
                                    edges.push(Edge {
                                        edge_type: EdgeType::AttnAttn,
                                        source: Source::Attn { layer: sl, head: hs },
                                        destination: Destination::Attn {
                                            layer: g.layer,
                                            stream: AttnStream::ALL[s],
                                            head: hd,
                                        },
                                    });
                                }
                            }
                        }
                    }
                }
                EdgeKind::MlpToAttn => {
                    for s in 0..3 {
                        for hd in 0..g.dims[1] {
                            for j in 0..g.dims[2] {
                                edges.push(Edge {
                                    edge_type: EdgeType::MlpAttn,
                                    source: mlp_source(j),
                                    destination: Destination::Attn {
                                        layer: g.layer,
                                        stream: AttnStream::ALL[s],
                                        head: hd,
                                    },
                                });
                            }
                        }
                    }
                }
                EdgeKind::AttnToMlp => {
                    let edge_type = if g.layer == l {
                        EdgeType::Final
                    } else {
                        EdgeType::AttnMlp
                    };
                    for sl in 0..g.dims[0] {
                        for hs in 0..g.dims[1] {
                            edges.push(Edge {
                                edge_type,
                                source: Source::Attn { layer: sl, head: hs },
                                destination: mlp_dest(g.layer),
                            });
                        }
                    }
                }
                EdgeKind::MlpToMlp => {
                    let edge_type = if g.layer == l {
                        EdgeType::Final
                    } else {
                        EdgeType::MlpMlp
                    };
                    for j in 0..g.dims[0] {
                        edges.push(Edge {
                            edge_type,
                            source: mlp_source(j),
                            destination: mlp_dest(g.layer),
                        });
                    }
                }
            }
        }
        edges
    }

    /// Source component of every slot: `layer * H + head` for attention
    /// sources, `total_heads` for embedding / MLP sources.
    pub fn source_component_map(&self) -> Vec<u32> {
        let h = self.geometry.n_heads;
        let none = self.geometry.total_heads() as u32;
        self.edges()
            .iter()
            .map(|e| match e.source {
                Source::Attn { layer, head } => (layer * h + head) as u32,
                _ => none,
            })
            .collect()
    }

    /// Lift per-head gates `(batch, L * H)` to per-edge gates `(batch, N)`.
    ///
    /// Every edge leaving attention head `k` takes column `k`; edges leaving
    /// the embedding or an MLP get a gate of one.
    pub fn lift_component_gates(&self, heads: &Tensor) -> Result<Tensor> {
        let batch = heads.dim(0)?;
        let ones = Tensor::ones((batch, 1), heads.dtype(), heads.device())?;
        let padded = Tensor::cat(&[heads, &ones], 1)?;
        let map = Tensor::new(self.source_component_map(), heads.device())?;
        Ok(padded.index_select(&map, 1)?)
    }
}
