//! Facet tagging.
//!
//! A facet is an orthogonal classification axis; its value is a focus id.
//! [`TagContainer`] is the plain value vector used both in the metadata
//! (tags a block or rule applies) and inside flows; [`FacetTags`] adds the
//! per-facet finality bits and the memoised overall-final state.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::classify::bitset::BitSet;
use crate::classify::metadata::ClassificationMetadata;

/// Focus value per facet, indexed 1..=F (index 0 unused).
#[derive(Debug, Default, Clone)]
pub struct TagContainer {
    tags: Vec<u32>,
    defined: BitSet,
}

impl TagContainer {
    pub fn new(facet_count: usize) -> Self {
        TagContainer {
            tags: vec![0; facet_count + 1],
            defined: BitSet::new(facet_count + 1),
        }
    }

    /// Total number of facets (not vector length).
    pub fn size(&self) -> usize {
        self.tags.len().saturating_sub(1)
    }

    pub fn set_tag(&mut self, facet_id: u32, focus_id: u32) {
        let i = facet_id as usize;
        self.defined.set_to(i, focus_id > 0);
        self.tags[i] = focus_id;
    }

    /// Focus assigned to `facet_id`, or 0 when undefined.
    pub fn get_tag(&self, facet_id: u32) -> u32 {
        self.tags.get(facet_id as usize).copied().unwrap_or(0)
    }

    /// Bit i set iff facet i holds a value.
    pub fn defined_facets(&self) -> &BitSet {
        &self.defined
    }

    pub fn is_empty(&self) -> bool {
        self.defined.none()
    }

    /// List-style accumulating hash over the focus vector.
    pub fn hash_code(&self) -> u64 {
        let mut hash = 0u64;
        for value in self.tags.iter().skip(1) {
            hash = hash.wrapping_mul(31).wrapping_add(*value as u64);
        }
        hash
    }
}

impl PartialEq for TagContainer {
    fn eq(&self, other: &Self) -> bool {
        self.tags == other.tags
    }
}

impl Eq for TagContainer {}

impl Hash for TagContainer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_code());
    }
}

/// A flow's classification verdict: tags plus finality.
#[derive(Debug, Clone)]
pub struct FacetTags {
    tags: TagContainer,
    final_flags: BitSet,
    final_blocks: BTreeSet<u32>,
    metadata: Arc<ClassificationMetadata>,
    cached_final: Cell<Option<bool>>,
}

impl FacetTags {
    pub fn new(metadata: Arc<ClassificationMetadata>) -> Self {
        let facets = metadata.facets().len();
        FacetTags {
            tags: TagContainer::new(facets),
            final_flags: BitSet::new(facets + 1),
            final_blocks: BTreeSet::new(),
            metadata,
            cached_final: Cell::new(None),
        }
    }

    /// Sets facet `facet_id` to `focus_id`. A facet already marked final is
    /// never modified; a differing write is logged and dropped.
    pub fn set_tag(&mut self, facet_id: u32, focus_id: u32, is_final: bool) {
        let previous = self.tags.get_tag(facet_id);

        if self.final_flags.test(facet_id as usize) {
            if previous != focus_id {
                log::warn!(
                    "attempt to modify final tag; facet: {}, previous (final) value: {}, new value: {}",
                    self.metadata.facets().name(facet_id),
                    self.metadata.focuses().name(previous),
                    self.metadata.focuses().name(focus_id),
                );
            }
            return;
        }

        if previous > 0 {
            if focus_id == 0 {
                log::info!(
                    "resetting tag; facet: {}, previous value: {}",
                    self.metadata.facets().name(facet_id),
                    self.metadata.focuses().name(previous),
                );
            } else if previous != focus_id {
                log::info!(
                    "conflicting tag; facet: {}, previous value: {}, new value: {}",
                    self.metadata.facets().name(facet_id),
                    self.metadata.focuses().name(previous),
                    self.metadata.focuses().name(focus_id),
                );
            }
        }

        self.tags.set_tag(facet_id, focus_id);
        self.final_flags.set_to(facet_id as usize, is_final);
        self.cached_final.set(None);
    }

    /// Applies every defined tag of `new_tags` on behalf of `block_id`.
    pub fn set_tags(&mut self, new_tags: &TagContainer, block_id: u32, is_final: bool) {
        for facet_id in 1..=self.tags.size() as u32 {
            let focus_id = new_tags.get_tag(facet_id);
            if focus_id > 0 {
                self.set_tag(facet_id, focus_id, is_final);
            }
        }
        if is_final {
            self.final_blocks.insert(block_id);
        }
        self.cached_final.set(None);
    }

    pub fn get_tag(&self, facet_id: u32) -> u32 {
        self.tags.get_tag(facet_id)
    }

    pub fn tags(&self) -> &TagContainer {
        &self.tags
    }

    pub fn defined_facets(&self) -> &BitSet {
        self.tags.defined_facets()
    }

    pub fn is_final_facet(&self, facet_id: u32) -> bool {
        self.final_flags.test(facet_id as usize)
    }

    pub fn final_blocks(&self) -> &BTreeSet<u32> {
        &self.final_blocks
    }

    /// True when every facet of the metadata's final mask is final here.
    /// Memoised; any tag write invalidates.
    pub fn is_final(&self) -> bool {
        if let Some(cached) = self.cached_final.get() {
            return cached;
        }
        let result = self.final_flags.contains_all(self.metadata.final_mask());
        self.cached_final.set(Some(result));
        result
    }

    /// `tags={facet=focus,…}` section of the flow log.
    pub fn render(&self) -> String {
        let mut out = String::from("tags={");
        let mut first = true;
        for facet_id in 1..=self.tags.size() as u32 {
            let focus_id = self.tags.get_tag(facet_id);
            if focus_id > 0 {
                if !first {
                    out.push(',');
                }
                first = false;
                let _ = write!(
                    out,
                    "{}={}",
                    self.metadata.facets().name(facet_id),
                    self.metadata.focuses().name(focus_id),
                );
            }
        }
        out.push('}');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::metadata::tests::test_metadata;

    #[test]
    fn hash_matches_iff_vectors_match() {
        let mut a = TagContainer::new(3);
        let mut b = TagContainer::new(3);
        a.set_tag(1, 2);
        b.set_tag(1, 2);
        assert_eq!(a, b);
        assert_eq!(a.hash_code(), b.hash_code());

        b.set_tag(3, 1);
        assert_ne!(a, b);
        assert_ne!(a.hash_code(), b.hash_code());

        // Same multiset in different facets must differ too.
        let mut c = TagContainer::new(3);
        c.set_tag(2, 2);
        assert_ne!(a.hash_code(), c.hash_code());
    }

    #[test]
    fn final_tag_is_immutable() {
        let metadata = Arc::new(test_metadata());
        let mut tags = FacetTags::new(metadata);
        tags.set_tag(1, 2, true);
        tags.set_tag(1, 3, false);
        assert_eq!(tags.get_tag(1), 2);
        tags.set_tag(1, 3, true);
        assert_eq!(tags.get_tag(1), 2);
    }

    #[test]
    fn overall_final_follows_final_mask() {
        // test_metadata marks facet 1 (application) as required.
        let metadata = Arc::new(test_metadata());
        let mut tags = FacetTags::new(metadata);
        assert!(!tags.is_final());

        tags.set_tag(2, 1, true);
        assert!(!tags.is_final(), "only a non-required facet is final");

        tags.set_tag(1, 1, false);
        assert!(!tags.is_final(), "required facet tagged but not final");

        tags.set_tag(1, 1, true);
        assert!(tags.is_final());
    }

    #[test]
    fn non_final_tag_can_be_cleared() {
        let metadata = Arc::new(test_metadata());
        let mut tags = FacetTags::new(metadata);
        tags.set_tag(2, 4, false);
        assert_eq!(tags.get_tag(2), 4);
        tags.set_tag(2, 0, false);
        assert_eq!(tags.get_tag(2), 0);
        assert!(!tags.defined_facets().test(2));
    }
}
