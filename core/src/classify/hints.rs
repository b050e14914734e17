//! Per-flow classification evidence.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::classify::metadata::ClassificationMetadata;

/// A unit of evidence: the block it was defined in and the signature id
/// within that block.
pub type Hint = (u32, u32);

/// Hints registered on a flow, with occurrence counts. Hints are monotone:
/// they are only ever added, never removed.
#[derive(Debug, Default, Clone)]
pub struct HintSet {
    hints: BTreeMap<Hint, u32>,
}

impl HintSet {
    /// Registers one occurrence; returns true on the first occurrence of the
    /// hint.
    pub fn set(&mut self, block_id: u32, sig_id: u32) -> bool {
        let count = self.hints.entry((block_id, sig_id)).or_insert(0);
        *count += 1;
        *count == 1
    }

    pub fn contains(&self, block_id: u32, sig_id: u32) -> bool {
        self.hints.contains_key(&(block_id, sig_id))
    }

    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Hint, &u32)> {
        self.hints.iter()
    }

    /// `|hints={(block_name,sig,count),…}` section of the flow log; empty
    /// string when no hints were registered.
    pub fn render(&self, metadata: &ClassificationMetadata) -> String {
        if self.hints.is_empty() {
            return String::new();
        }
        let mut out = String::from("|hints={");
        for (i, ((block, sig), count)) in self.hints.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "({},{},{})", metadata.blocks().name(*block), sig, count);
        }
        out.push('}');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_occurrences_and_reports_first() {
        let mut hints = HintSet::default();
        assert!(hints.set(1, 2));
        assert!(!hints.set(1, 2));
        assert!(hints.set(1, 3));
        assert_eq!(hints.iter().count(), 2);
        assert_eq!(hints.iter().next().unwrap().1, &2);
    }
}
