//! The rule evaluator stage.
//!
//! At initialisation every (block, signature) pair receives a dense bit in
//! a global hint bitmap; block masks, facet masks and the compiled
//! precondition/rule masks are derived once from the metadata. Per packet,
//! flows with fresh hints are re-evaluated: standalone hints and matching
//! rules apply their tags, and facets that lost support are cleared again
//! (unless already final).

use crate::classify::bitset::BitSet;
use crate::classify::constraints::Constraint;
use crate::classify::hints::Hint;
use crate::classify::metadata::{ClassificationMetadata, ExcludeRef, PreconditionDef, RuleDef};
use crate::classify::tags::TagContainer;
use crate::flow::Flow;
use crate::packet::PacketDescriptor;
use crate::stage::{EngineState, Ports, Stage, Verdict};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Result};

struct CompiledPrecondition {
    excluded_hints: BitSet,
    constraints: Vec<Constraint>,
}

struct CompiledRule {
    included_hints: BitSet,
    excluded_hints: BitSet,
    constraints: Vec<Constraint>,
    tags: TagContainer,
    is_final: bool,
}

pub struct ClassAssignerStage {
    name: String,
    ports: Ports,
    metadata: Arc<ClassificationMetadata>,
    number_of_hints: usize,
    hint_positions: HashMap<Hint, usize>,
    standalone_hints: BitSet,
    final_hints: BitSet,
    /// Signatures carrying their own tags, by bit position.
    hint_tags: HashMap<usize, TagContainer>,
    tagged_hints: BitSet,
    block_masks: HashMap<u32, BitSet>,
    facet_masks: HashMap<u32, BitSet>,
    preconditions: HashMap<u32, CompiledPrecondition>,
    rules: HashMap<u32, Vec<CompiledRule>>,
    evaluations: u64,
}

impl ClassAssignerStage {
    pub fn new(name: &str, ports: Ports, metadata: &Arc<ClassificationMetadata>) -> Result<Self> {
        if metadata.blocks().is_empty() {
            return Err(anyhow!(
                "{}: classification metadata not loaded, unable to assign classes",
                name
            ));
        }

        let blocks = metadata.blocks().len() as u32;
        let number_of_hints =
            metadata.number_of_signatures() + metadata.classifiers().len() * blocks as usize;

        let mut stage = ClassAssignerStage {
            name: name.to_string(),
            ports,
            metadata: Arc::clone(metadata),
            number_of_hints,
            hint_positions: HashMap::new(),
            standalone_hints: BitSet::new(number_of_hints),
            final_hints: BitSet::new(number_of_hints),
            hint_tags: HashMap::new(),
            tagged_hints: BitSet::new(number_of_hints),
            block_masks: HashMap::new(),
            facet_masks: HashMap::new(),
            preconditions: HashMap::new(),
            rules: HashMap::new(),
            evaluations: 0,
        };

        let metadata = Arc::clone(&stage.metadata);
        for block_id in 1..=blocks {
            // Classifier signature ids are valid within every block.
            for classifier in metadata.classifiers().values() {
                stage.register_signature(
                    block_id,
                    classifier.sig_id,
                    classifier.standalone,
                    classifier.is_final,
                    &TagContainer::default(),
                );
            }
            for sig in &metadata.block(block_id).signatures {
                stage.register_signature(block_id, sig.id, sig.standalone, sig.is_final, &sig.tags);
            }
        }

        stage.build_facet_masks()?;

        for block_id in 1..=blocks {
            let block = metadata.block(block_id);
            if let Some(precondition) = &block.precondition {
                let compiled = stage.compile_precondition(block_id, precondition)?;
                stage.preconditions.insert(block_id, compiled);
            }
            for rule in &block.rules {
                let compiled = stage.compile_rule(block_id, rule)?;
                stage.rules.entry(block_id).or_default().push(compiled);
            }
        }

        Ok(stage)
    }

    fn register_signature(
        &mut self,
        block_id: u32,
        sig_id: u32,
        standalone: bool,
        is_final: bool,
        tags: &TagContainer,
    ) {
        let position = self.hint_positions.len();
        self.hint_positions.insert((block_id, sig_id), position);
        if standalone {
            self.standalone_hints.set(position);
        }
        if is_final {
            self.final_hints.set(position);
        }
        if !tags.is_empty() {
            self.tagged_hints.set(position);
            self.hint_tags.insert(position, tags.clone());
        }
        self.block_masks
            .entry(block_id)
            .or_insert_with(|| BitSet::new(self.number_of_hints))
            .set(position);
    }

    /// A facet's mask is the union of everything that can feed it: block
    /// masks of blocks tagging it, include masks of rules tagging it, and
    /// the bits of signatures carrying their own tags for it.
    fn build_facet_masks(&mut self) -> Result<()> {
        for facet_id in 1..=self.metadata.facets().len() as u32 {
            self.facet_masks
                .insert(facet_id, BitSet::new(self.number_of_hints));
        }

        let metadata = Arc::clone(&self.metadata);
        for block_id in 1..=metadata.blocks().len() as u32 {
            let block = metadata.block(block_id);
            let block_mask = self.block_masks[&block_id].clone();
            self.union_facet_masks(&block_mask, &block.tags);

            for rule in &block.rules {
                if rule.tags.is_empty() {
                    continue;
                }
                let include_mask = self.include_mask(&rule.includes)?;
                self.union_facet_masks(&include_mask, &rule.tags);
            }
        }

        let tagged: Vec<(usize, TagContainer)> = self
            .hint_tags
            .iter()
            .map(|(pos, tags)| (*pos, tags.clone()))
            .collect();
        for (position, tags) in tagged {
            let mut mask = BitSet::new(self.number_of_hints);
            mask.set(position);
            self.union_facet_masks(&mask, &tags);
        }
        Ok(())
    }

    fn union_facet_masks(&mut self, mask: &BitSet, tags: &TagContainer) {
        for facet_id in 1..=self.metadata.facets().len() as u32 {
            if tags.get_tag(facet_id) > 0 {
                self.facet_masks
                    .get_mut(&facet_id)
                    .expect("facet masks pre-filled")
                    .union_with(mask);
            }
        }
    }

    fn include_mask(&self, includes: &[Hint]) -> Result<BitSet> {
        let mut mask = BitSet::new(self.number_of_hints);
        for hint in includes {
            let position = self.hint_positions.get(hint).ok_or_else(|| {
                anyhow!(
                    "position of hint {},{} not found in the hint position map",
                    self.metadata.blocks().name(hint.0),
                    hint.1
                )
            })?;
            mask.set(*position);
        }
        Ok(mask)
    }

    /// The exclude mask: referenced block/facet masks, allow-filtered, and
    /// always cleared of the block's own hints.
    fn exclude_mask(
        &self,
        block_id: u32,
        excludes: &[ExcludeRef],
        allows: &[u32],
    ) -> Result<BitSet> {
        let mut mask = BitSet::new(self.number_of_hints);
        for exclude in excludes {
            match exclude {
                ExcludeRef::All => {
                    mask.set_all();
                    break;
                }
                ExcludeRef::Facet(facet_id) => {
                    let facet_mask = self.facet_masks.get(facet_id).ok_or_else(|| {
                        anyhow!("facet hint mask not found for facet {}", facet_id)
                    })?;
                    mask.union_with(facet_mask);
                }
                ExcludeRef::Block(excluded) => {
                    let block_mask = self.block_masks.get(excluded).ok_or_else(|| {
                        anyhow!(
                            "block hint mask not found for excluded block {}",
                            self.metadata.blocks().name(*excluded)
                        )
                    })?;
                    mask.union_with(block_mask);
                }
            }
        }
        for allowed in allows {
            let block_mask = self.block_masks.get(allowed).ok_or_else(|| {
                anyhow!(
                    "block hint mask not found for allowed block {}",
                    self.metadata.blocks().name(*allowed)
                )
            })?;
            mask.subtract(block_mask);
        }
        mask.subtract(&self.block_masks[&block_id]);
        Ok(mask)
    }

    fn compile_precondition(
        &self,
        block_id: u32,
        precondition: &PreconditionDef,
    ) -> Result<CompiledPrecondition> {
        Ok(CompiledPrecondition {
            excluded_hints: self.exclude_mask(block_id, &precondition.excludes, &precondition.allows)?,
            constraints: precondition.constraints.clone(),
        })
    }

    fn compile_rule(&self, block_id: u32, rule: &RuleDef) -> Result<CompiledRule> {
        let included_hints = self.include_mask(&rule.includes)?;
        let mut excluded_hints = self.exclude_mask(block_id, &rule.excludes, &rule.allows)?;
        if included_hints.intersects(&excluded_hints) {
            log::warn!(
                "{}: conflicting include and exclude masks within block {}, removing conflicting bits from the exclude mask",
                self.name,
                self.metadata.blocks().name(block_id)
            );
            excluded_hints.subtract(&included_hints);
        }
        Ok(CompiledRule {
            included_hints,
            excluded_hints,
            constraints: rule.constraints.clone(),
            tags: rule.tags.clone(),
            is_final: rule.is_final,
        })
    }

    fn constraints_hold(
        constraints: &[Constraint],
        packet: &PacketDescriptor,
        flow: &Flow,
    ) -> bool {
        constraints.iter().all(|c| c.evaluate(packet, flow))
    }

    fn evaluate(&mut self, packet: &PacketDescriptor, flow: &mut Flow) {
        self.evaluations += 1;
        let previous_facets = flow.tags().defined_facets().clone();
        let mut new_facets = BitSet::new(previous_facets.len());

        // Bitmap of the flow's hints and the set of hinted blocks.
        let mut hint_mask = BitSet::new(self.number_of_hints);
        let mut hinted_blocks: BTreeSet<u32> = BTreeSet::new();
        for (hint, _) in flow.hints().iter() {
            match self.hint_positions.get(hint) {
                Some(position) => {
                    hint_mask.set(*position);
                    hinted_blocks.insert(hint.0);
                }
                None => log::warn!(
                    "{}: hint {},{} not found in the hint position map",
                    self.name,
                    self.metadata.blocks().name(hint.0),
                    hint.1
                ),
            }
        }

        for block_id in hinted_blocks {
            if let Some(precondition) = self.preconditions.get(&block_id) {
                if hint_mask.intersects(&precondition.excluded_hints) {
                    continue;
                }
                if !Self::constraints_hold(&precondition.constraints, packet, flow) {
                    continue;
                }
            }

            let block_tags = self.metadata.block(block_id).tags.clone();

            // Standalone hints act as implied rules.
            let standalone = hint_mask
                .intersection(&self.block_masks[&block_id])
                .intersection(&self.standalone_hints);
            if standalone.any() {
                let is_final = standalone.intersects(&self.final_hints);
                flow.set_tags(&block_tags, block_id, is_final);
                new_facets.union_with(block_tags.defined_facets());

                // Signature-specific tags ride along with their own finality.
                for position in standalone.intersection(&self.tagged_hints).ones() {
                    let tags = self
                        .hint_tags
                        .get(&position)
                        .expect("tagged bit without tags")
                        .clone();
                    flow.set_tags(&tags, block_id, self.final_hints.test(position));
                    new_facets.union_with(tags.defined_facets());
                }
            }

            if let Some(rules) = self.rules.get(&block_id) {
                for rule in rules {
                    if hint_mask.intersects(&rule.excluded_hints) {
                        continue;
                    }
                    if !hint_mask.contains_all(&rule.included_hints) {
                        continue;
                    }
                    if !Self::constraints_hold(&rule.constraints, packet, flow) {
                        continue;
                    }
                    flow.set_tags(&block_tags, block_id, rule.is_final);
                    new_facets.union_with(block_tags.defined_facets());
                    if !rule.tags.is_empty() {
                        flow.set_tags(&rule.tags, block_id, rule.is_final);
                        new_facets.union_with(rule.tags.defined_facets());
                    }
                }
            }
        }

        // Clear facets that lost their support; final facets stay.
        let invalidated = previous_facets
            .symmetric_difference(&new_facets)
            .intersection(&previous_facets);
        for facet_id in invalidated.ones() {
            if !flow.tags().is_final_facet(facet_id as u32) {
                flow.set_tag(facet_id as u32, 0, false);
            }
        }
    }
}

impl Stage for ClassAssignerStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_packet(&mut self, packet: &mut PacketDescriptor, _: &mut EngineState) -> Verdict {
        let Some(flow) = packet.flow().cloned() else {
            log::warn!(
                "{}: no flow associated with packet (no. {})",
                self.name,
                packet.packet_number()
            );
            return self.ports.forward_default();
        };
        let mut flow = flow.borrow_mut();

        // Without fresh hints the previous verdict still stands.
        if flow.last_hinted_packet() < flow.packets_number() {
            return self.ports.forward_default();
        }

        self.evaluate(packet, &mut flow);
        self.ports.forward_default()
    }

    fn get_status(&mut self, _: &EngineState, _: u64, _: u64) -> String {
        format!("{} evaluations", self.evaluations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowId, FlowRef, TCP_PROTOCOL};
    use crate::packet::CaptureHeader;
    use crate::stage::tests_support;
    use crate::time::TimeVal;
    use std::cell::RefCell;
    use std::net::Ipv4Addr;
    use std::rc::Rc;

    const XML: &str = r#"
<classification>
  <facets>
    <facet name="application" required="true"/>
    <facet name="category"/>
  </facets>
  <block name="A">
    <tag facet="application" focus="app-a"/>
    <signature id="1" type="dpi" regexp="a1"/>
    <signature id="2" type="dpi" regexp="a2"/>
    <signature id="3" type="dpi" regexp="a3" standalone="true" final="true">
      <tag facet="category" focus="cat-a"/>
    </signature>
    <rule>
      <include sigId="1"/>
      <exclude block="B"/>
      <tag facet="category" focus="cat-rule"/>
    </rule>
  </block>
  <block name="B">
    <tag facet="application" focus="app-b"/>
    <signature id="1" type="dpi" regexp="b1" standalone="true"/>
  </block>
  <block name="C">
    <tag facet="application" focus="app-c"/>
    <signature id="1" type="dpi" regexp="c1" standalone="true"/>
    <preconditions>
      <constraint name="symmetric-flow"/>
    </preconditions>
  </block>
</classification>
"#;

    fn setup() -> (ClassAssignerStage, Arc<ClassificationMetadata>) {
        let metadata = Arc::new(ClassificationMetadata::from_str(XML).unwrap());
        let stage =
            ClassAssignerStage::new("assigner", Ports::new(None, vec![]), &metadata).unwrap();
        (stage, metadata)
    }

    fn flow_with_packets(metadata: &Arc<ClassificationMetadata>, ul: u64, dl: u64) -> FlowRef {
        let mut id = FlowId::default();
        id.set_ip(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2), TCP_PROTOCOL);
        id.set_transport(1, 2);
        let flow = Rc::new(RefCell::new(Flow::new(id, Arc::clone(metadata))));
        for n in 0..ul {
            flow.borrow_mut().packet(TimeVal::new(n as i64, 0), true, 100);
        }
        for n in 0..dl {
            flow.borrow_mut().packet(TimeVal::new(n as i64, 1), false, 100);
        }
        flow
    }

    fn packet_for(flow: &FlowRef) -> PacketDescriptor {
        let mut packet = PacketDescriptor::new();
        packet.load(
            CaptureHeader {
                ts: TimeVal::new(100, 0),
                caplen: 0,
                origlen: 0,
            },
            &[],
            1,
        );
        packet.set_flow(Rc::clone(flow));
        packet
    }

    fn evaluate(stage: &mut ClassAssignerStage, flow: &FlowRef) {
        let packet = packet_for(flow);
        stage.evaluate(&packet, &mut flow.borrow_mut());
    }

    #[test]
    fn rule_with_exclude_tags_then_clears() {
        let (mut stage, metadata) = setup();
        let flow = flow_with_packets(&metadata, 2, 2);
        let app = metadata.facets().get_id("application").unwrap();
        let focus_a = metadata.focuses().get_id("app-a").unwrap();

        // First evaluation: include hint present, exclude absent.
        flow.borrow_mut().set_hint(1, 1);
        evaluate(&mut stage, &flow);
        assert_eq!(flow.borrow().tags().get_tag(app), focus_a);

        // The excluded block's hint appears: the rule no longer matches and
        // the non-final tag is cleared... but block B's standalone hint now
        // tags the facet instead.
        flow.borrow_mut().set_hint(2, 1);
        evaluate(&mut stage, &flow);
        let focus_b = metadata.focuses().get_id("app-b").unwrap();
        assert_eq!(flow.borrow().tags().get_tag(app), focus_b);
    }

    #[test]
    fn rule_exclusion_clears_unsupported_facet() {
        let (mut stage, metadata) = setup();
        let flow = flow_with_packets(&metadata, 2, 2);
        let cat = metadata.facets().get_id("category").unwrap();
        let cat_rule = metadata.focuses().get_id("cat-rule").unwrap();

        flow.borrow_mut().set_hint(1, 1);
        evaluate(&mut stage, &flow);
        assert_eq!(flow.borrow().tags().get_tag(cat), cat_rule);

        // The excluded block's hint suppresses the rule; nothing else tags
        // the category facet, so its non-final tag is cleared again.
        flow.borrow_mut().set_hint(2, 1);
        evaluate(&mut stage, &flow);
        assert_eq!(flow.borrow().tags().get_tag(cat), 0);
    }

    #[test]
    fn standalone_final_signature_sets_both_tag_levels() {
        let (mut stage, metadata) = setup();
        let flow = flow_with_packets(&metadata, 2, 2);
        let app = metadata.facets().get_id("application").unwrap();
        let cat = metadata.facets().get_id("category").unwrap();

        flow.borrow_mut().set_hint(1, 3);
        evaluate(&mut stage, &flow);

        let f = flow.borrow();
        assert_eq!(f.tags().get_tag(app), metadata.focuses().get_id("app-a").unwrap());
        assert_eq!(f.tags().get_tag(cat), metadata.focuses().get_id("cat-a").unwrap());
        assert!(f.tags().is_final_facet(app));
        assert!(f.is_final(), "required facet is final");
        drop(f);

        // A later conflicting evaluation cannot undo a final facet.
        flow.borrow_mut().set_hint(2, 1);
        evaluate(&mut stage, &flow);
        assert_eq!(
            flow.borrow().tags().get_tag(app),
            metadata.focuses().get_id("app-a").unwrap()
        );
    }

    #[test]
    fn precondition_constraint_gates_block() {
        let (mut stage, metadata) = setup();

        // 100 uplink / 20 downlink packets: not symmetric.
        let lopsided = flow_with_packets(&metadata, 100, 20);
        lopsided.borrow_mut().set_hint(3, 1);
        evaluate(&mut stage, &lopsided);
        assert_eq!(lopsided.borrow().tags().get_tag(1), 0);

        let balanced = flow_with_packets(&metadata, 10, 10);
        balanced.borrow_mut().set_hint(3, 1);
        evaluate(&mut stage, &balanced);
        assert_eq!(
            balanced.borrow().tags().get_tag(1),
            metadata.focuses().get_id("app-c").unwrap()
        );
    }

    #[test]
    fn final_state_matches_mask_property() {
        let (mut stage, metadata) = setup();
        let flow = flow_with_packets(&metadata, 2, 2);
        flow.borrow_mut().set_hint(1, 3);
        evaluate(&mut stage, &flow);
        let f = flow.borrow();
        // application (required) is final, category is final via the same
        // signature: the conjunction over the final mask holds.
        assert_eq!(
            f.is_final(),
            metadata
                .final_mask()
                .ones()
                .all(|facet| f.tags().is_final_facet(facet as u32))
        );
    }

    #[test]
    fn skips_flows_without_fresh_hints() {
        let (mut stage, metadata) = setup();
        let flow = flow_with_packets(&metadata, 1, 0);
        let mut state = tests_support::state();

        let mut packet = packet_for(&flow);
        stage.process_packet(&mut packet, &mut state);
        assert_eq!(stage.evaluations, 0, "no hints yet");

        flow.borrow_mut().set_hint(1, 1);
        let mut packet = packet_for(&flow);
        stage.process_packet(&mut packet, &mut state);
        assert_eq!(stage.evaluations, 1);

        flow.borrow_mut().packet(TimeVal::new(9, 0), true, 10);
        let mut packet = packet_for(&flow);
        stage.process_packet(&mut packet, &mut state);
        assert_eq!(stage.evaluations, 1, "stale hints are not re-evaluated");
    }
}
