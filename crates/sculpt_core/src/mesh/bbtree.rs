//! Axis-aligned bounding box tree over the cells of a mesh, used to find the
//! cells whose closure contains a point.

use nalgebra::DVector;

use crate::mesh::{edge_matrix_of, Mesh};

/// Relative tolerance of the barycentric containment test.
pub const CONTAINMENT_EPS: f64 = 1e-10;

const LEAF_SIZE: usize = 4;

#[derive(Debug, Clone, Copy)]
struct Aabb {
    min: [f64; 3],
    max: [f64; 3],
}

impl Aabb {
    fn empty() -> Self {
        Self {
            min: [f64::MAX; 3],
            max: [f64::MIN; 3],
        }
    }

    fn expand_point(&mut self, point: &[f64]) {
        for (axis, &x) in point.iter().enumerate() {
            self.min[axis] = self.min[axis].min(x);
            self.max[axis] = self.max[axis].max(x);
        }
    }

    fn expand(&mut self, other: &Self) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(other.min[axis]);
            self.max[axis] = self.max[axis].max(other.max[axis]);
        }
    }

    fn contains(&self, point: &[f64], padding: f64) -> bool {
        point
            .iter()
            .enumerate()
            .all(|(axis, &x)| x >= self.min[axis] - padding && x <= self.max[axis] + padding)
    }

    fn longest_axis(&self, dim: usize) -> usize {
        (0..dim)
            .max_by(|&a, &b| {
                (self.max[a] - self.min[a]).total_cmp(&(self.max[b] - self.min[b]))
            })
            .unwrap_or(0)
    }

    fn diameter(&self, dim: usize) -> f64 {
        (0..dim)
            .map(|a| (self.max[a] - self.min[a]).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf { bbox: Aabb, cells: Vec<usize> },
    Internal { bbox: Aabb, left: usize, right: usize },
}

impl Node {
    fn bbox(&self) -> &Aabb {
        match self {
            Node::Leaf { bbox, .. } | Node::Internal { bbox, .. } => bbox,
        }
    }
}

/// Bounding box tree built from the current coordinates of a mesh.
///
/// The tree has to be rebuilt whenever the coordinates change.
#[derive(Debug, Clone)]
pub struct BoundingBoxTree {
    nodes: Vec<Node>,
    root: Option<usize>,
    padding: f64,
}

impl BoundingBoxTree {
    pub fn build(mesh: &Mesh) -> Self {
        let mut boxes = Vec::with_capacity(mesh.num_cells());
        let mut global = Aabb::empty();
        for c in 0..mesh.num_cells() {
            let mut bbox = Aabb::empty();
            for &v in mesh.cell(c) {
                bbox.expand_point(mesh.vertex(v));
            }
            global.expand(&bbox);
            boxes.push(bbox);
        }

        let mut tree = Self {
            nodes: Vec::new(),
            root: None,
            padding: CONTAINMENT_EPS * global.diameter(mesh.dim()).max(1.0),
        };
        if !boxes.is_empty() {
            let mut indices: Vec<usize> = (0..boxes.len()).collect();
            tree.root = Some(tree.build_node(&boxes, &mut indices, mesh.dim()));
        }
        tree
    }

    fn build_node(&mut self, boxes: &[Aabb], indices: &mut [usize], dim: usize) -> usize {
        let mut bbox = Aabb::empty();
        for &i in indices.iter() {
            bbox.expand(&boxes[i]);
        }

        if indices.len() <= LEAF_SIZE {
            self.nodes.push(Node::Leaf {
                bbox,
                cells: indices.to_vec(),
            });
            return self.nodes.len() - 1;
        }

        let axis = bbox.longest_axis(dim);
        let center = |i: usize| 0.5 * (boxes[i].min[axis] + boxes[i].max[axis]);
        indices.sort_by(|&a, &b| center(a).total_cmp(&center(b)));
        let mid = indices.len() / 2;
        let (lower, upper) = indices.split_at_mut(mid);
        let left = self.build_node(boxes, lower, dim);
        let right = self.build_node(boxes, upper, dim);
        self.nodes.push(Node::Internal { bbox, left, right });
        self.nodes.len() - 1
    }

    /// Cells whose closure contains `point`, in increasing order.
    pub fn compute_entity_collisions(&self, mesh: &Mesh, point: &[f64]) -> Vec<usize> {
        let mut hits = Vec::new();
        let Some(root) = self.root else {
            return hits;
        };
        let mut stack = vec![root];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            if !node.bbox().contains(point, self.padding) {
                continue;
            }
            match node {
                Node::Leaf { cells, .. } => {
                    hits.extend(
                        cells
                            .iter()
                            .copied()
                            .filter(|&c| cell_contains(mesh, c, point)),
                    );
                }
                Node::Internal { left, right, .. } => {
                    stack.push(*left);
                    stack.push(*right);
                }
            }
        }
        hits.sort_unstable();
        hits
    }
}

/// Barycentric containment test with tolerance. Degenerate cells contain nothing.
pub fn cell_contains(mesh: &Mesh, cell: usize, point: &[f64]) -> bool {
    let dim = mesh.dim();
    let vertices = mesh.cell(cell);
    let edges = edge_matrix_of(dim, mesh.coordinates(), vertices);
    let origin = mesh.vertex(vertices[0]);
    let rhs = DVector::from_fn(dim, |i, _| point[i] - origin[i]);
    let Some(lambda) = edges.lu().solve(&rhs) else {
        return false;
    };
    if lambda.iter().any(|l| !l.is_finite()) {
        return false;
    }
    lambda.iter().all(|&l| l >= -CONTAINMENT_EPS) && lambda.sum() <= 1.0 + CONTAINMENT_EPS
}
