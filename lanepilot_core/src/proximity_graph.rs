//! Proximity graph over the current vehicle batch.
//!
//! Nodes are row indices of the batch. A directed edge `(a, b)` exists when
//!
//! ```text
//!   |lane_a - lane_b| <= lane_tolerance  AND  |depth_a - depth_b| <= max_distance
//! ```
//!
//! with self-loops excluded. The allocator cannot consume an empty edge set,
//! so when nothing qualifies the graph carries the single fallback edge
//! `(0, 0)` with weight 1.
//!
//! The graph has no identity beyond one pipeline cycle. `ProximityGraphBuilder`
//! remembers the last result and returns it again while the batch (ids, lanes
//! and depths, in order) is unchanged.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::trace;

/// Feature column holding the lane id.
pub const LANE_COLUMN: usize = 0;

/// Feature column holding the depth in cm.
pub const DEPTH_COLUMN: usize = 3;

/// How an edge's weight follows from the positional distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeWeighting {
    /// `1 / (d + 1e-6)`
    Inverse,
    /// `max_distance - d`
    Linear,
    /// Every edge weighs 1
    #[serde(alias = "none")]
    Unit,
}

impl EdgeWeighting {
    pub fn weight(&self, distance: f64, max_distance: f64) -> f64 {
        match self {
            Self::Inverse => 1.0 / (distance + 1e-6),
            Self::Linear => max_distance - distance,
            Self::Unit => 1.0,
        }
    }
}

/// Edge predicate parameters.
///
/// `weighting` has no default: a configuration must choose one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Maximum lane difference for two vehicles to be connected
    #[serde(default = "default_lane_tolerance")]
    pub lane_tolerance: i64,

    /// Maximum depth difference in cm
    #[serde(default = "default_max_distance", alias = "max_distance")]
    pub max_distance_cm: f64,

    /// Emit both `(a, b)` and `(b, a)`
    #[serde(default = "default_bidirectional")]
    pub bidirectional: bool,

    pub weighting: EdgeWeighting,
}

fn default_lane_tolerance() -> i64 {
    1
}

fn default_max_distance() -> f64 {
    10.0
}

fn default_bidirectional() -> bool {
    true
}

impl GraphConfig {
    /// Graph parameters with the usual tolerance/distance and an explicit weighting.
    pub fn with_weighting(weighting: EdgeWeighting) -> Self {
        Self {
            lane_tolerance: default_lane_tolerance(),
            max_distance_cm: default_max_distance(),
            bidirectional: default_bidirectional(),
            weighting,
        }
    }
}

/// Directed edge list with one weight per edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityGraph {
    pub edges: Vec<(usize, usize)>,
    pub weights: Vec<f64>,
}

impl ProximityGraph {
    /// The single synthetic self-edge `(0, 0)`, weight 1.
    pub fn fallback() -> Self {
        Self {
            edges: vec![(0, 0)],
            weights: vec![1.0],
        }
    }

    /// True when only the synthetic `(0, 0)` edge is present.
    pub fn is_fallback(&self) -> bool {
        self.edges == [(0, 0)]
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Never true: a graph always has at least the fallback edge.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Builds the proximity graph for raw feature rows (rows = vehicles).
///
/// Deterministic: edges come out in row-major `(i, j)` order, followed by
/// the reversed edges when `bidirectional` is set.
pub fn build_proximity_graph(features: &DMatrix<f64>, config: &GraphConfig) -> ProximityGraph {
    let n = features.nrows();
    if n == 0 || features.ncols() <= DEPTH_COLUMN {
        return ProximityGraph::fallback();
    }

    let mut edges = Vec::new();
    let mut weights = Vec::new();

    for i in 0..n {
        for j in (i + 1)..n {
            let lane_diff = (features[(i, LANE_COLUMN)] - features[(j, LANE_COLUMN)]).abs();
            let distance = (features[(i, DEPTH_COLUMN)] - features[(j, DEPTH_COLUMN)]).abs();

            // NaN and infinite distances fail the comparison
            if lane_diff <= config.lane_tolerance as f64 && distance <= config.max_distance_cm {
                edges.push((i, j));
                weights.push(config.weighting.weight(distance, config.max_distance_cm));
            }
        }
    }

    if config.bidirectional {
        let reversed: Vec<(usize, usize)> = edges.iter().map(|&(a, b)| (b, a)).collect();
        edges.extend(reversed);
        weights.extend_from_within(..);
    }

    if edges.is_empty() {
        return ProximityGraph::fallback();
    }
    ProximityGraph { edges, weights }
}

/// Key for the single-entry cache: ordered ids plus the lane/depth bits.
fn batch_key(ids: &[i64], features: &DMatrix<f64>) -> u64 {
    let mut hasher = DefaultHasher::new();
    ids.hash(&mut hasher);
    if features.ncols() > DEPTH_COLUMN {
        for row in 0..features.nrows() {
            features[(row, LANE_COLUMN)].to_bits().hash(&mut hasher);
            features[(row, DEPTH_COLUMN)].to_bits().hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Graph builder with a one-entry result cache.
pub struct ProximityGraphBuilder {
    config: GraphConfig,
    cached: Option<(u64, ProximityGraph)>,
    hits: u64,
}

impl ProximityGraphBuilder {
    pub fn new(config: GraphConfig) -> Self {
        Self {
            config,
            cached: None,
            hits: 0,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Returns the graph for the batch, reusing the previous result when the
    /// batch is unchanged.
    pub fn build(&mut self, ids: &[i64], features: &DMatrix<f64>) -> ProximityGraph {
        let key = batch_key(ids, features);

        if let Some((cached_key, graph)) = &self.cached {
            if *cached_key == key {
                self.hits += 1;
                trace!(vehicles = ids.len(), "proximity graph cache hit");
                return graph.clone();
            }
        }

        let graph = build_proximity_graph(features, &self.config);
        self.cached = Some((key, graph.clone()));
        graph
    }

    /// Number of builds answered from the cache.
    pub fn cache_hits(&self) -> u64 {
        self.hits
    }
}
