//! Approximate nearest-neighbor index: a forest of randomized
//! projection-split trees. Each split picks two random pivot points and
//! sends every point to the side of the closer pivot; queries walk the
//! forest best-first using the margin to the splitting hyperplane as
//! the priority.
//!
//! Every tree is grown from its own seeded xorshift stream, so the
//! forest is identical regardless of how many threads build it. Ties in
//! candidate distances are broken by the lower row index, which makes
//! query results fully deterministic.

use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct XorShift {
    state: u64,
}

impl XorShift {
    fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }
    #[inline(always)]
    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
    #[inline(always)]
    fn next_choice(&mut self, max: usize) -> usize {
        (self.next_u64() % (max as u64)) as usize
    }
}

#[derive(Clone)]
enum Node {
    Split {
        p1: u32,
        p2: u32,
        dist_p1_p2: f64,
        left: u32,
        right: u32,
    },
    Leaf {
        start: u32,
        end: u32,
    },
}

/// Read-only search structure over the rows of a dense matrix. The
/// matrix is borrowed for the lifetime of the forest; nothing here is
/// mutated after `build` returns.
pub struct NeighborForest<'a> {
    data: &'a [f64],
    n_features: usize,
    nodes: Vec<Node>,
    indices: Vec<u32>,
    roots: Vec<u32>,
}

#[inline(always)]
fn dist_sq(a: &[f64], b: &[f64]) -> f64 {
    let mut sum = 0.0f64;
    for i in 0..a.len() {
        let diff = a[i] - b[i];
        sum += diff * diff;
    }
    sum
}

fn build_tree_recursive(
    indices: &mut [u32],
    data: &[f64],
    n_features: usize,
    leaf_size: usize,
    rng: &mut XorShift,
    nodes: &mut Vec<Node>,
    leaf_indices: &mut Vec<u32>,
) -> u32 {
    if indices.len() <= leaf_size {
        let start = leaf_indices.len() as u32;
        leaf_indices.extend_from_slice(indices);
        let end = leaf_indices.len() as u32;
        let node_idx = nodes.len() as u32;
        nodes.push(Node::Leaf { start, end });
        return node_idx;
    }

    let p1_local = rng.next_choice(indices.len());
    let mut p2_local = rng.next_choice(indices.len());
    let mut attempts = 0;
    while p1_local == p2_local && attempts < 5 {
        p2_local = rng.next_choice(indices.len());
        attempts += 1;
    }

    let p1 = indices[p1_local];
    let p2 = indices[p2_local];

    let p1_vec = &data[p1 as usize * n_features..(p1 as usize + 1) * n_features];
    let p2_vec = &data[p2 as usize * n_features..(p2 as usize + 1) * n_features];

    let dist_p1_p2_sq = dist_sq(p1_vec, p2_vec);
    if dist_p1_p2_sq == 0.0 {
        // Coincident pivots cannot separate anything; stop splitting.
        let start = leaf_indices.len() as u32;
        leaf_indices.extend_from_slice(indices);
        let end = leaf_indices.len() as u32;
        let node_idx = nodes.len() as u32;
        nodes.push(Node::Leaf { start, end });
        return node_idx;
    }

    let mut flip = false;
    let mut i = 0;
    let mut j = indices.len();
    while i < j {
        let x_idx = indices[i];
        let x_vec = &data[x_idx as usize * n_features..(x_idx as usize + 1) * n_features];
        let d1 = dist_sq(x_vec, p1_vec);
        let d2 = dist_sq(x_vec, p2_vec);

        let go_left = if d1 < d2 {
            true
        } else if d1 > d2 {
            false
        } else {
            flip = !flip;
            flip
        };

        if go_left {
            i += 1;
        } else {
            j -= 1;
            indices.swap(i, j);
        }
    }

    if i == 0 || i == indices.len() {
        i = indices.len() / 2;
    }

    let (left_indices, right_indices) = indices.split_at_mut(i);

    let node_idx = nodes.len() as u32;
    nodes.push(Node::Leaf { start: 0, end: 0 });

    let left_child =
        build_tree_recursive(left_indices, data, n_features, leaf_size, rng, nodes, leaf_indices);
    let right_child =
        build_tree_recursive(right_indices, data, n_features, leaf_size, rng, nodes, leaf_indices);

    nodes[node_idx as usize] = Node::Split {
        p1,
        p2,
        dist_p1_p2: dist_p1_p2_sq.sqrt(),
        left: left_child,
        right: right_child,
    };

    node_idx
}

#[derive(PartialEq)]
struct PrioritizedBranch {
    priority: f64,
    node_idx: u32,
}
impl Eq for PrioritizedBranch {}
impl PartialOrd for PrioritizedBranch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PrioritizedBranch {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-priority first: BinaryHeap is a max-heap, so reverse.
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.node_idx.cmp(&self.node_idx))
    }
}

impl<'a> NeighborForest<'a> {
    /// Grow `n_trees` trees over `n_samples` rows of `data`. Trees are
    /// independent and built in parallel; tree `t` draws from a stream
    /// seeded with `seed + t`, so the result does not depend on the
    /// number of worker threads.
    pub fn build(
        data: &'a [f64],
        n_samples: usize,
        n_features: usize,
        n_trees: usize,
        leaf_size: usize,
        seed: u64,
    ) -> Self {
        let trees: Vec<(Vec<Node>, Vec<u32>, u32)> = (0..n_trees)
            .into_par_iter()
            .map(|t| {
                let mut rng = XorShift::new(seed + t as u64);
                let mut point_indices: Vec<u32> = (0..n_samples as u32).collect();
                let mut local_nodes = Vec::new();
                let mut local_indices = Vec::new();
                let root = build_tree_recursive(
                    &mut point_indices,
                    data,
                    n_features,
                    leaf_size,
                    &mut rng,
                    &mut local_nodes,
                    &mut local_indices,
                );
                (local_nodes, local_indices, root)
            })
            .collect();

        let mut forest = NeighborForest {
            data,
            n_features,
            nodes: Vec::new(),
            indices: Vec::new(),
            roots: Vec::with_capacity(n_trees),
        };

        for (local_nodes, local_indices, root) in trees {
            let node_offset = forest.nodes.len() as u32;
            let indices_offset = forest.indices.len() as u32;

            for mut node in local_nodes {
                match &mut node {
                    Node::Split { left, right, .. } => {
                        *left += node_offset;
                        *right += node_offset;
                    }
                    Node::Leaf { start, end } => {
                        *start += indices_offset;
                        *end += indices_offset;
                    }
                }
                forest.nodes.push(node);
            }
            forest.indices.extend(local_indices);
            forest.roots.push(root + node_offset);
        }

        forest
    }

    /// Return up to `k` approximate nearest neighbors of `query`,
    /// excluding row `exclude`, as `(row, distance)` pairs in ascending
    /// `(distance, row)` order. Distances are Euclidean.
    pub fn query(&self, query: &[f64], exclude: u32, k: usize, search_k: usize) -> Vec<(u32, f64)> {
        let mut heap = BinaryHeap::new();
        for &root in &self.roots {
            heap.push(PrioritizedBranch {
                priority: 0.0,
                node_idx: root,
            });
        }

        let mut candidates = Vec::new();
        let mut visited_nodes = 0;

        while let Some(branch) = heap.pop() {
            if visited_nodes >= search_k {
                break;
            }

            let mut curr = branch.node_idx;
            loop {
                visited_nodes += 1;
                match &self.nodes[curr as usize] {
                    Node::Leaf { start, end } => {
                        for i in *start..*end {
                            candidates.push(self.indices[i as usize]);
                        }
                        break;
                    }
                    Node::Split {
                        p1,
                        p2,
                        dist_p1_p2,
                        left,
                        right,
                    } => {
                        let p1_vec = &self.data
                            [*p1 as usize * self.n_features..(*p1 as usize + 1) * self.n_features];
                        let p2_vec = &self.data
                            [*p2 as usize * self.n_features..(*p2 as usize + 1) * self.n_features];
                        let d1 = dist_sq(query, p1_vec);
                        let d2 = dist_sq(query, p2_vec);

                        let margin = (d2 - d1).abs() / (2.0 * *dist_p1_p2);

                        if d1 < d2 {
                            heap.push(PrioritizedBranch {
                                priority: branch.priority.max(margin),
                                node_idx: *right,
                            });
                            curr = *left;
                        } else {
                            heap.push(PrioritizedBranch {
                                priority: branch.priority.max(margin),
                                node_idx: *left,
                            });
                            curr = *right;
                        }
                    }
                }
            }
        }

        candidates.sort_unstable();
        candidates.dedup();

        let mut scored: Vec<(u32, f64)> = candidates
            .into_iter()
            .filter(|&idx| idx != exclude)
            .map(|idx| {
                let x = &self.data
                    [idx as usize * self.n_features..(idx as usize + 1) * self.n_features];
                (idx, dist_sq(query, x))
            })
            .collect();

        // Equal distances resolve to the lower row index.
        let by_dist_then_idx =
            |a: &(u32, f64), b: &(u32, f64)| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0));
        if scored.len() > k {
            scored.select_nth_unstable_by(k - 1, by_dist_then_idx);
            scored.truncate(k);
        }
        scored.sort_unstable_by(by_dist_then_idx);

        for s in &mut scored {
            s.1 = s.1.sqrt();
        }
        scored
    }
}
