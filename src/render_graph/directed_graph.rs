//! Minimal directed graph container used for pass dependencies

/// Index of a vertex in a [`DirectedGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexIndex(pub(crate) usize);

impl VertexIndex {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Outgoing edge of a vertex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge<E> {
    pub target: VertexIndex,
    pub data: E,
}

#[derive(Debug, Clone)]
struct Vertex<T, E> {
    data: T,
    edges: Vec<Edge<E>>,
}

/// Append-only directed graph with vertex and edge payloads
///
/// Vertices are indexed in insertion order. At most one edge exists per
/// ordered vertex pair; adding it again is a no-op.
#[derive(Debug, Clone)]
pub struct DirectedGraph<T, E> {
    vertices: Vec<Vertex<T, E>>,
}

impl<T, E> DirectedGraph<T, E> {
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            vertices: Vec::with_capacity(capacity),
        }
    }

    /// Add a vertex with no edges
    pub fn add_vertex(&mut self, data: T) -> VertexIndex {
        self.vertices.push(Vertex {
            data,
            edges: Vec::new(),
        });
        VertexIndex(self.vertices.len() - 1)
    }

    /// Add an edge `from -> to`.
    ///
    /// Returns `false` if the edge already existed or either vertex is unknown.
    pub fn add_edge(&mut self, from: VertexIndex, to: VertexIndex, data: E) -> bool {
        if to.0 >= self.vertices.len() {
            return false;
        }
        let Some(vertex) = self.vertices.get_mut(from.0) else {
            return false;
        };
        // Fan-out per vertex is small, a linear scan is enough
        if vertex.edges.iter().any(|edge| edge.target == to) {
            return false;
        }
        vertex.edges.push(Edge { target: to, data });
        true
    }

    pub fn vertex(&self, index: VertexIndex) -> Option<&T> {
        self.vertices.get(index.0).map(|v| &v.data)
    }

    /// Outgoing edges of a vertex, in insertion order
    pub fn edges(&self, index: VertexIndex) -> &[Edge<E>] {
        self.vertices
            .get(index.0)
            .map(|v| v.edges.as_slice())
            .unwrap_or(&[])
    }

    pub fn vertices(&self) -> impl Iterator<Item = (VertexIndex, &T)> {
        self.vertices
            .iter()
            .enumerate()
            .map(|(i, v)| (VertexIndex(i), &v.data))
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.vertices.iter().map(|v| v.edges.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
    }
}

impl<T, E> Default for DirectedGraph<T, E> {
    fn default() -> Self {
        Self::new()
    }
}
