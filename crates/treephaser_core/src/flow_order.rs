use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// One of the four nucleotide reagents cycled across the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Nucleotide {
    A,
    C,
    G,
    T,
}

impl Nucleotide {
    /// Index into the 4-wide per-nucleotide arrays (`base`/`flow` matrices,
    /// `penalty[nuc]`, ...).
    pub fn index(self) -> usize {
        match self {
            Nucleotide::A => 0,
            Nucleotide::C => 1,
            Nucleotide::G => 2,
            Nucleotide::T => 3,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index {
            0 => Nucleotide::A,
            1 => Nucleotide::C,
            2 => Nucleotide::G,
            3 => Nucleotide::T,
            other => panic!("nucleotide index out of range: {other}"),
        }
    }

    pub fn symbol(self) -> char {
        match self {
            Nucleotide::A => 'A',
            Nucleotide::C => 'C',
            Nucleotide::G => 'G',
            Nucleotide::T => 'T',
        }
    }

    fn from_symbol(symbol: char) -> Option<Self> {
        match symbol {
            'A' => Some(Nucleotide::A),
            'C' => Some(Nucleotide::C),
            'G' => Some(Nucleotide::G),
            'T' => Some(Nucleotide::T),
            _ => None,
        }
    }

    /// All four nucleotides in fixed `A, C, G, T` order, matching the
    /// `nuc_int_to_char` table the forward model and solver iterate over.
    pub const ALL: [Nucleotide; 4] = [
        Nucleotide::A,
        Nucleotide::C,
        Nucleotide::G,
        Nucleotide::T,
    ];
}

/// Immutable cyclic schedule of which nucleotide is presented at each flow.
///
/// Constructed once per run and shared read-only by the phasing model and
/// solver; length is fixed and never changes after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowOrder {
    symbols: Vec<Nucleotide>,
}

impl FlowOrder {
    /// Parses a flow order string (e.g. `"TACGTACG..."`) into a `FlowOrder`.
    pub fn new(order: &str) -> Result<Self> {
        if order.is_empty() {
            bail!("flow order must contain at least one flow, got 0");
        }
        let mut symbols = Vec::with_capacity(order.len());
        for (index, symbol) in order.chars().enumerate() {
            match Nucleotide::from_symbol(symbol) {
                Some(nuc) => symbols.push(nuc),
                None => bail!(
                    "flow order symbol at index {index} is not one of A/C/G/T: {symbol:?}"
                ),
            }
        }
        Ok(Self { symbols })
    }

    /// Number of flows, `F`.
    pub fn num_flows(&self) -> usize {
        self.symbols.len()
    }

    /// Nucleotide presented at `flow`.
    pub fn symbol(&self, flow: usize) -> Nucleotide {
        self.symbols[flow]
    }

    pub fn as_slice(&self) -> &[Nucleotide] {
        &self.symbols
    }
}
