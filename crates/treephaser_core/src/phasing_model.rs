use anyhow::{ensure, Result};

use crate::flow_order::{FlowOrder, Nucleotide};

/// Precomputed per-flow, per-nucleotide transition coefficients derived from
/// the three scalar error rates (carry-forward, incomplete-extension, droop).
///
/// `base[n][f]` is the probability mass that contributes to incorporation
/// when the current nucleotide of flow `f` matches `n`; `flow[n][f]` is the
/// mass that survives to the next flow without incorporating. Both are
/// dense `[4][F]` matrices with `base[n][f] + flow[n][f] <= 1` everywhere.
#[derive(Debug, Clone)]
pub struct PhasingModel {
    num_flows: usize,
    base: [Vec<f32>; 4],
    flow: [Vec<f32>; 4],
}

impl PhasingModel {
    /// Builds a model with all-zero rates (no carry-forward, no incomplete
    /// extension, no droop); `set_model_parameters` fills in real rates.
    pub fn new(flow_order: &FlowOrder) -> Result<Self> {
        ensure!(
            flow_order.num_flows() > 0,
            "flow order must contain at least one flow, got 0"
        );
        let num_flows = flow_order.num_flows();
        let mut model = Self {
            num_flows,
            base: Default::default(),
            flow: Default::default(),
        };
        for nuc in 0..4 {
            model.base[nuc] = vec![0.0; num_flows];
            model.flow[nuc] = vec![0.0; num_flows];
        }
        model.set_model_parameters(flow_order, 0.0, 0.0, 0.0)?;
        Ok(model)
    }

    pub fn num_flows(&self) -> usize {
        self.num_flows
    }

    /// Recomputes the coefficient matrices for rates `(cf, ie, dr)`.
    ///
    /// Maintains a per-nucleotide "availability" that is reset to 1 on the
    /// flow where that nucleotide cycles and decays by `cf` on every flow
    /// until its next turn. See spec §4.1.
    pub fn set_model_parameters(
        &mut self,
        flow_order: &FlowOrder,
        cf: f64,
        ie: f64,
        dr: f64,
    ) -> Result<()> {
        ensure!(
            (0.0..1.0).contains(&cf),
            "carry-forward rate {cf} is outside [0, 1)"
        );
        ensure!(
            (0.0..1.0).contains(&ie),
            "incomplete-extension rate {ie} is outside [0, 1)"
        );
        ensure!(
            (0.0..1.0).contains(&dr),
            "droop rate {dr} is outside [0, 1)"
        );
        ensure!(
            flow_order.num_flows() == self.num_flows,
            "flow order length {} does not match model length {}",
            flow_order.num_flows(),
            self.num_flows
        );

        let (cf, ie, dr) = (cf as f32, ie as f32, dr as f32);
        let mut availability = [0.0f32; 4];

        for flow in 0..self.num_flows {
            let current = flow_order.symbol(flow).index();
            availability[current] = 1.0;

            for nuc in 0..4 {
                self.base[nuc][flow] = availability[nuc] * (1.0 - dr) * (1.0 - ie);
                self.flow[nuc][flow] =
                    (1.0 - availability[nuc]) + availability[nuc] * (1.0 - dr) * ie;
                availability[nuc] *= cf;
            }
        }

        Ok(())
    }

    /// Mass contributing to incorporation at flow `f` when `nuc` is current.
    pub fn base(&self, nuc: Nucleotide, flow: usize) -> f32 {
        self.base[nuc.index()][flow]
    }

    /// Mass surviving to the next flow without incorporating.
    pub fn flow_carry(&self, nuc: Nucleotide, flow: usize) -> f32 {
        self.flow[nuc.index()][flow]
    }
}
