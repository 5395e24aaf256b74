use crate::flow_order::Nucleotide;

/// Fixed-size pool of candidate partial solutions that back the beam search
/// in `solver`. Exactly `NUM_PATHS` slots, preallocated from the flow
/// order's length; the pool never grows during a solve.
pub const NUM_PATHS: usize = 8;

/// Longest homopolymer run the solver will emit.
pub const MAX_HP: usize = 11;

/// Live polymerase mass below this is treated as zero and excluded from the
/// state window.
pub const STATE_WINDOW_CUTOFF: f32 = 1e-6;

/// A candidate partial solution explored by the beam search.
///
/// `state`, `prediction` are full-length `[0, F)` buffers, but only the
/// `[window_start, window_end)` slice of `state` is meaningful: flows
/// outside that range are implicitly zero and are never read or cleared.
#[derive(Debug, Clone)]
pub struct TreephaserPath {
    /// Current in-phase flow: the next flow where the last-incorporated
    /// nucleotide sits.
    pub flow: usize,
    pub state: Vec<f32>,
    pub window_start: usize,
    pub window_end: usize,
    pub prediction: Vec<f32>,
    pub sequence: Vec<Nucleotide>,
    /// Length of the current trailing homopolymer run.
    pub last_hp: usize,
    /// Cumulative residual cost accrued so far along this path.
    pub path_metric: f32,
    /// Frozen residual for flows before `window_start`.
    pub residual_left_of_window: f32,
    /// `path_metric` averaged per flow; used to pick eviction candidates.
    pub per_flow_metric: f32,
    /// Count of consecutive "weak-signal" incorporations.
    pub dot_counter: u32,
    /// Occupancy flag in the fixed-size path pool.
    pub in_use: bool,
}

impl TreephaserPath {
    pub(crate) fn new(num_flows: usize) -> Self {
        Self {
            flow: 0,
            state: vec![0.0; num_flows],
            window_start: 0,
            window_end: 0,
            prediction: vec![0.0; num_flows],
            sequence: Vec::with_capacity(2 * num_flows),
            last_hp: 0,
            path_metric: 0.0,
            residual_left_of_window: 0.0,
            per_flow_metric: 0.0,
            dot_counter: 0,
            in_use: false,
        }
    }

    /// Resets to the root of the search tree: flow 0, unit mass at flow 0,
    /// window `[0, 1)`, empty sequence.
    pub fn initialize(&mut self, num_flows: usize) {
        self.flow = 0;
        self.state[0] = 1.0;
        self.window_start = 0;
        self.window_end = 1;
        self.prediction.iter_mut().for_each(|v| *v = 0.0);
        self.sequence.clear();
        self.last_hp = 0;
        self.path_metric = 0.0;
        self.residual_left_of_window = 0.0;
        self.per_flow_metric = 0.0;
        self.dot_counter = 0;
        debug_assert_eq!(self.state.len(), num_flows);
        debug_assert_eq!(self.prediction.len(), num_flows);
    }
}

/// Fixed-size, preallocated pool of [`NUM_PATHS`] [`TreephaserPath`] slots.
///
/// Construction cost is just the pool plus the `[4][F]` coefficient
/// matrices of the [`crate::phasing_model::PhasingModel`] it is paired
/// with in [`crate::solver::Treephaser`]; processing many reads is cheap
/// by either constructing a fresh `Treephaser` per read or resetting and
/// reusing a single one.
#[derive(Debug, Clone)]
pub struct PathPool {
    paths: [TreephaserPath; NUM_PATHS],
    num_flows: usize,
}

impl PathPool {
    pub fn new(num_flows: usize) -> Self {
        Self {
            paths: std::array::from_fn(|_| TreephaserPath::new(num_flows)),
            num_flows,
        }
    }

    pub fn num_flows(&self) -> usize {
        self.num_flows
    }

    pub fn get(&self, index: usize) -> &TreephaserPath {
        &self.paths[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut TreephaserPath {
        &mut self.paths[index]
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TreephaserPath> {
        self.paths.iter()
    }

    /// Borrows two distinct slots simultaneously: an immutable `parent` and
    /// a mutable `child`. Panics if the indices coincide — `advance`'s
    /// out-of-place contract requires `parent != child`.
    pub fn parent_child_mut(
        &mut self,
        parent_index: usize,
        child_index: usize,
    ) -> (&TreephaserPath, &mut TreephaserPath) {
        assert_ne!(
            parent_index, child_index,
            "advance requires distinct parent and child slots"
        );
        if parent_index < child_index {
            let (left, right) = self.paths.split_at_mut(child_index);
            (&left[parent_index], &mut right[0])
        } else {
            let (left, right) = self.paths.split_at_mut(parent_index);
            (&right[0], &mut left[child_index])
        }
    }
}
