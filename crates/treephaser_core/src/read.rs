use serde::{Deserialize, Serialize};

use crate::flow_order::Nucleotide;

/// The mutable per-well record exchanged between the solver and its
/// external collaborators (image/background/IO layers — out of scope here).
///
/// All vectors are length `F` (the flow count) except `sequence`,
/// `penalty_mismatch` and `penalty_residual`, which are length
/// `|sequence|`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BasecallerRead {
    pub raw_measurements: Vec<f32>,
    pub normalized_measurements: Vec<f32>,
    pub additive_correction: Vec<f32>,
    pub multiplicative_correction: Vec<f32>,
    pub prediction: Vec<f32>,
    pub sequence: Vec<Nucleotide>,
    pub state_inphase: Vec<f32>,
    pub state_total: Vec<f32>,
    pub penalty_mismatch: Vec<f32>,
    pub penalty_residual: Vec<f32>,
    /// Multiplicative scaling that made the one-mer key flows equal 1.0.
    pub key_normalizer: f32,
}

impl BasecallerRead {
    /// Allocates all per-flow buffers at the given length, zeroed
    /// (multiplicative correction defaults to 1.0, matching the original's
    /// `multiplicative_correction.assign(num_flows, 1.0)`).
    pub fn new(num_flows: usize) -> Self {
        Self {
            raw_measurements: vec![0.0; num_flows],
            normalized_measurements: vec![0.0; num_flows],
            additive_correction: vec![0.0; num_flows],
            multiplicative_correction: vec![1.0; num_flows],
            prediction: vec![0.0; num_flows],
            sequence: Vec::with_capacity(2 * num_flows),
            state_inphase: vec![1.0; num_flows],
            state_total: vec![1.0; num_flows],
            penalty_mismatch: Vec::new(),
            penalty_residual: Vec::new(),
            key_normalizer: 1.0,
        }
    }

    /// Key-normalizes `measurements` against `key_flows` (the expected
    /// incorporation count at each key flow) and fills `raw_measurements` /
    /// `normalized_measurements`.
    ///
    /// `key_normalizer := count_of_one_mers / sum_of_one_mer_measurements`,
    /// or `1.0` if either is zero (spec §4.4, original
    /// `SetDataAndKeyNormalize`).
    pub fn set_data_and_key_normalize(measurements: &[f32], key_flows: &[u32]) -> Self {
        let num_flows = measurements.len();
        let mut read = Self::new(num_flows);

        let mut onemer_sum = 0.0f32;
        let mut onemer_count = 0.0f32;
        for (flow, &expected) in key_flows.iter().enumerate() {
            if expected == 1 {
                onemer_sum += measurements[flow];
                onemer_count += 1.0;
            }
        }

        read.key_normalizer = if onemer_sum != 0.0 && onemer_count != 0.0 {
            onemer_count / onemer_sum
        } else {
            1.0
        };

        for flow in 0..num_flows {
            read.raw_measurements[flow] = measurements[flow] * read.key_normalizer;
            read.normalized_measurements[flow] = read.raw_measurements[flow];
        }

        read
    }
}
