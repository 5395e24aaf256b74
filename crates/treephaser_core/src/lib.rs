//! Dephasing basecaller core: a deterministic forward model of
//! Ion-Torrent-style flow phasing (`phasing_model`, `advancer`) and a bounded
//! tree-search solver (`solver`) that inverts it, recovering a called base
//! sequence and per-flow quality metrics from a noisy flowgram.
//!
//! The module dependency order is strict and acyclic: `flow_order` and
//! `median` have no internal dependencies; `phasing_model` depends on
//! `flow_order`; `path` depends on `flow_order`; `advancer` depends on
//! `flow_order`, `phasing_model` and `path`; `read` depends on `flow_order`;
//! `solver` sits on top of all of them.

pub mod advancer;
pub mod flow_order;
pub mod median;
pub mod path;
pub mod phasing_model;
pub mod read;
pub mod solver;

pub use flow_order::{FlowOrder, Nucleotide};
pub use path::{PathPool, TreephaserPath, MAX_HP, NUM_PATHS};
pub use phasing_model::PhasingModel;
pub use read::BasecallerRead;
pub use solver::Treephaser;
