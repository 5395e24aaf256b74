//! The deterministic forward model: advancing a candidate path by one base.
//!
//! Two entry points mirror the two call sites in the solver: `advance`
//! writes into a distinct `child` slot (tree expansion, four children per
//! parent), `advance_in_place` mutates a single path (straight-line
//! simulation, restart replay, key-flow seeding). Window bookkeeping keeps
//! per-call work at O(window width) rather than O(F).

use crate::flow_order::{FlowOrder, Nucleotide};
use crate::path::{TreephaserPath, STATE_WINDOW_CUTOFF};
use crate::phasing_model::PhasingModel;

/// Extends `parent` by one incorporation of `nuc`, writing the result into
/// `child`. `child` must be a different path than `parent` — the pool
/// enforces this via [`crate::path::PathPool::parent_child_mut`].
pub fn advance(
    model: &PhasingModel,
    flow_order: &FlowOrder,
    parent: &TreephaserPath,
    child: &mut TreephaserPath,
    nuc: Nucleotide,
    max_flow: usize,
) {
    child.flow = parent.flow;
    while child.flow < max_flow && flow_order.symbol(child.flow) != nuc {
        child.flow += 1;
    }
    child.last_hp = if child.flow == parent.flow {
        parent.last_hp + 1
    } else {
        1
    };

    child.window_start = parent.window_start;
    child.window_end = parent.window_end;

    if parent.flow != child.flow || parent.flow == 0 {
        let mut alive = 0.0f32;
        let mut flow = parent.window_start;
        while flow < child.window_end {
            if flow < parent.window_end {
                alive += parent.state[flow];
            }
            child.state[flow] = alive * model.base(nuc, flow);
            alive *= model.flow_carry(nuc, flow);

            if flow == child.window_start && child.state[flow] < STATE_WINDOW_CUTOFF {
                child.window_start += 1;
            }
            if flow == child.window_end - 1
                && child.window_end < max_flow
                && alive > STATE_WINDOW_CUTOFF
            {
                child.window_end += 1;
            }
            flow += 1;
        }
    } else {
        // Pure homopolymer extension: state carries over unchanged.
        child.state[child.window_start..child.window_end]
            .copy_from_slice(&parent.state[child.window_start..child.window_end]);
    }

    for flow in parent.window_start..parent.window_end {
        child.prediction[flow] = parent.prediction[flow] + child.state[flow];
    }
    for flow in parent.window_end..child.window_end {
        child.prediction[flow] = child.state[flow];
    }
}

/// Extends `state` in place by one incorporation of `nuc`. Used for
/// straight-line simulation and restart replay, where no branching (and so
/// no parent/child aliasing) is needed.
pub fn advance_in_place(
    model: &PhasingModel,
    flow_order: &FlowOrder,
    state: &mut TreephaserPath,
    nuc: Nucleotide,
    max_flow: usize,
) {
    let old_flow = state.flow;
    let old_window_start = state.window_start;
    let old_window_end = state.window_end;

    while state.flow < max_flow && flow_order.symbol(state.flow) != nuc {
        state.flow += 1;
    }
    state.last_hp = if old_flow == state.flow {
        state.last_hp + 1
    } else {
        1
    };

    if old_flow != state.flow || old_flow == 0 {
        let mut alive = 0.0f32;
        let mut flow = old_window_start;
        while flow < state.window_end {
            if flow < old_window_end {
                alive += state.state[flow];
            }
            state.state[flow] = alive * model.base(nuc, flow);
            alive *= model.flow_carry(nuc, flow);

            if flow == state.window_start && state.state[flow] < STATE_WINDOW_CUTOFF {
                state.window_start += 1;
            }
            if flow == state.window_end - 1
                && state.window_end < max_flow
                && alive > STATE_WINDOW_CUTOFF
            {
                state.window_end += 1;
            }
            flow += 1;
        }
    }

    for flow in state.window_start..state.window_end {
        state.prediction[flow] += state.state[flow];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_order::FlowOrder;
    use crate::phasing_model::PhasingModel;

    fn noiseless_model(order: &FlowOrder) -> PhasingModel {
        PhasingModel::new(order).unwrap()
    }

    #[test]
    fn noise_free_simulation_is_a_clean_impulse_train() {
        // F=32, TACG repeated, (cf,ie,dr)=(0,0,0), sequence "TACG".
        let order = FlowOrder::new("TACGTACGTACGTACGTACGTACGTACGTACG").unwrap();
        let model = noiseless_model(&order);
        let mut path = TreephaserPath::new(order.num_flows());
        path.initialize(order.num_flows());

        for nuc in [Nucleotide::T, Nucleotide::A, Nucleotide::C, Nucleotide::G] {
            advance_in_place(&model, &order, &mut path, nuc, order.num_flows());
        }

        for flow in 0..4 {
            assert!((path.prediction[flow] - 1.0).abs() < 1e-6, "flow {flow}");
        }
        for flow in 4..order.num_flows() {
            assert!(path.prediction[flow].abs() < 1e-6, "flow {flow}");
        }
    }

    #[test]
    fn homopolymer_incorporates_within_a_single_flow() {
        // "AA" is a homopolymer of 2, entirely within flow 1.
        let order = FlowOrder::new("TACGTACGTACGTACGTACGTACGTACGTACG").unwrap();
        let model = noiseless_model(&order);

        let mut path = TreephaserPath::new(order.num_flows());
        path.initialize(order.num_flows());
        advance_in_place(&model, &order, &mut path, Nucleotide::A, order.num_flows());
        advance_in_place(&model, &order, &mut path, Nucleotide::A, order.num_flows());

        assert!((path.prediction[1] - 2.0).abs() < 1e-4);
        assert_eq!(path.last_hp, 2);
    }

    #[test]
    fn carry_forward_leaks_into_the_next_flow_for_a_different_nuc() {
        // (cf, ie, dr) = (0.01, 0, 0), sequence "AT": incorporating A at flow
        // 1 leaves a small residual "alive" mass that the *following*
        // incorporation (T, whose own flow is 4) partially absorbs at flow 1
        // itself and leaks through flows 2-3 before mostly landing at flow 4.
        let order = FlowOrder::new("TACGTACGTACGTACGTACGTACGTACGTACG").unwrap();
        let mut model = noiseless_model(&order);
        model.set_model_parameters(&order, 0.01, 0.0, 0.0).unwrap();

        let mut path = TreephaserPath::new(order.num_flows());
        path.initialize(order.num_flows());
        advance_in_place(&model, &order, &mut path, Nucleotide::A, order.num_flows());
        advance_in_place(&model, &order, &mut path, Nucleotide::T, order.num_flows());

        // child.state[1] = 1.0 (parent alive) * base[T][1] = 1.0 * cf = 0.01.
        assert!((path.prediction[1] - 1.01).abs() < 1e-3);
        // Mostly-complete incorporation at T's own flow, minus the leaked sliver.
        let expected_flow4 = (1.0 - 0.01) * (1.0 - 0.01 * 0.01) * (1.0 - 0.01 * 0.01 * 0.01);
        assert!((path.prediction[4] - expected_flow4).abs() < 1e-3);
        assert!(path.prediction[2] > 0.0 && path.prediction[2] < 0.01);
    }

    #[test]
    fn window_bounds_stay_monotone_and_in_range() {
        let order = FlowOrder::new("TACGTACGTACGTACGTACGTACGTACGTACG").unwrap();
        let mut model = noiseless_model(&order);
        model.set_model_parameters(&order, 0.02, 0.05, 0.01).unwrap();

        let mut path = TreephaserPath::new(order.num_flows());
        path.initialize(order.num_flows());
        let mut last_window_start = path.window_start;

        for &nuc in b"TACGTACG" {
            let nuc = match nuc {
                b'T' => Nucleotide::T,
                b'A' => Nucleotide::A,
                b'C' => Nucleotide::C,
                b'G' => Nucleotide::G,
                _ => unreachable!(),
            };
            advance_in_place(&model, &order, &mut path, nuc, order.num_flows());
            assert!(path.window_start <= path.window_end);
            assert!(path.window_end <= order.num_flows());
            assert!(path.window_start >= last_window_start);
            last_window_start = path.window_start;
        }
    }
}
