use crate::disassembly::symbol::{DecisionNode, DecisionPair};

use itertools::Itertools;

/// Widest window a single node switches on.
const MAX_WINDOW_BITS: usize = 8;

/// Builds a subtable's dispatch tree from its `(constructor, pattern)` pairs,
/// given in table order.
///
/// Each interior node switches on the window that spreads the patterns
/// most evenly; a pattern that leaves part of the window unconstrained is
/// copied into every child it is consistent with, so a leaf lists exactly
/// the pairs a linear scan would still consider, in the same order.
pub(crate) fn build(pairs: Vec<DecisionPair>) -> DecisionNode {
    split(pairs)
}

fn split(pairs: Vec<DecisionPair>) -> DecisionNode {
    if pairs.iter().map(DecisionPair::id).unique().count() <= 1 {
        return DecisionNode::leaf(pairs)
    }

    let window = match optimal_window(&pairs) {
        Some(window) => window,
        None => return DecisionNode::leaf(pairs),
    };

    log::trace!(
        "splitting {} patterns on {} bits {}..{}",
        pairs.len(),
        if window.context { "context" } else { "instruction" },
        window.start,
        window.start + window.size
    );

    let children = (0..1u32 << window.size)
        .map(|value| {
            let subset = pairs
                .iter()
                .filter(|pair| window.consistent(pair, value))
                .cloned()
                .collect();
            split(subset)
        })
        .collect();

    DecisionNode::branch(window.context, window.start, window.size, children)
}

#[derive(Debug, Copy, Clone)]
struct Window {
    context: bool,
    start: usize,
    size: usize,
}

impl Window {
    /// The mask and value `pair` requires over this window, most
    /// significant bit first.
    fn constraint(&self, pair: &DecisionPair) -> (u32, u32) {
        let mut mask = 0;
        let mut value = 0;
        for i in 0..self.size {
            let bit = self.size - 1 - i;
            if let Some(set) = pair.pattern().bit(self.context, self.start + i) {
                mask |= 1 << bit;
                if set {
                    value |= 1 << bit;
                }
            }
        }
        (mask, value)
    }

    fn consistent(&self, pair: &DecisionPair, value: u32) -> bool {
        let (mask, required) = self.constraint(pair);
        (value ^ required) & mask == 0
    }

    /// Entropy in bits of how the fully constrained patterns spread over
    /// the window's values; `None` when the window does not separate them.
    fn score(&self, pairs: &[DecisionPair]) -> Option<f64> {
        let full = (1u32 << self.size) - 1;
        let mut counts = vec![0usize; 1 << self.size];
        let mut total = 0usize;

        for pair in pairs {
            let (mask, value) = self.constraint(pair);
            if mask == full {
                counts[value as usize] += 1;
                total += 1;
            }
        }

        if total == 0 {
            return None
        }

        let mut score = 0.0;
        for count in counts.into_iter().filter(|count| *count > 0) {
            if count >= pairs.len() {
                return None
            }
            let p = count as f64 / total as f64;
            score -= p * p.log2();
        }
        Some(score)
    }
}

fn optimal_window(pairs: &[DecisionPair]) -> Option<Window> {
    let mut best: Option<(f64, Window)> = None;

    for context in [false, true] {
        let bits = pairs
            .iter()
            .map(|pair| {
                let block = if context {
                    pair.pattern().context_block()
                } else {
                    pair.pattern().instruction_block()
                };
                block.map(|block| block.length() * 8).unwrap_or(0)
            })
            .max()
            .unwrap_or(0);

        for start in 0..bits {
            for size in 1..=MAX_WINDOW_BITS.min(bits - start) {
                let window = Window { context, start, size };
                if let Some(score) = window.score(pairs) {
                    if score > best.map(|(s, _)| s).unwrap_or(0.0) {
                        best = Some((score, window));
                    }
                }
            }
        }
    }

    best.map(|(_, window)| window)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disassembly::pattern::{DisjointPattern, PatternBlock};

    fn insn(mask: u8, value: u8) -> DisjointPattern {
        DisjointPattern::new(PatternBlock::new(true), PatternBlock::from_bytes(0, &[mask], &[value]))
    }

    fn leaf_ids(node: &DecisionNode, out: &mut Vec<Vec<usize>>) {
        if node.is_leaf() {
            out.push(node.patterns().iter().map(DecisionPair::id).collect());
        } else {
            for child in node.children() {
                leaf_ids(child, out);
            }
        }
    }

    #[test]
    fn leaves_preserve_table_order() {
        let pairs = vec![
            DecisionPair::new(0, insn(0xff, 0x10)),
            DecisionPair::new(1, insn(0xf0, 0x10)),
            DecisionPair::new(2, insn(0xf0, 0x20)),
            DecisionPair::new(3, insn(0x00, 0x00)),
        ];

        let tree = build(pairs);
        assert!(!tree.is_leaf());

        let mut leaves = Vec::new();
        leaf_ids(&tree, &mut leaves);
        for leaf in leaves.iter() {
            assert!(leaf.windows(2).all(|w| w[0] < w[1]), "{:?}", leaf);
            assert!(leaf.contains(&3));
        }
        assert!(leaves.iter().any(|leaf| leaf == &vec![0, 1, 3]));
        assert!(leaves.iter().any(|leaf| leaf == &vec![2, 3]));
    }

    #[test]
    fn single_constructor_is_a_leaf() {
        let tree = build(vec![
            DecisionPair::new(4, insn(0xf0, 0x10)),
            DecisionPair::new(4, insn(0xf0, 0x30)),
        ]);
        assert!(tree.is_leaf());
        assert_eq!(tree.patterns().len(), 2);
    }

    #[test]
    fn context_windows() {
        let ctx = |value: u8| {
            DisjointPattern::new(PatternBlock::from_bytes(0, &[0x80], &[value]), PatternBlock::new(true))
        };
        let tree = build(vec![DecisionPair::new(0, ctx(0x80)), DecisionPair::new(1, ctx(0x00))]);
        assert!(!tree.is_leaf());
        assert_eq!(tree.children().len(), 2);
        assert_eq!(tree.children()[0].patterns()[0].id(), 1);
        assert_eq!(tree.children()[1].patterns()[0].id(), 0);
    }
}
