//! Classification metadata.
//!
//! The rule set driving the classifier stages is loaded once from an XML
//! file and is immutable afterwards. It declares the facets (with the final
//! mask), generic classifier descriptors, and the blocks with their
//! signatures, preconditions and rules. Ids for blocks, facets and focus
//! values are interned in declaration order starting at 1.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::str;

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::classify::bitset::BitSet;
use crate::classify::constraints::Constraint;
use crate::classify::hints::Hint;
use crate::classify::tags::TagContainer;

/// Transparent string ↔ id mapping; ids are dense and start at 1.
#[derive(Debug, Default, Clone)]
pub struct IdNameMapper {
    names: Vec<String>,
    ids: HashMap<String, u32>,
}

impl IdNameMapper {
    /// Registers `name` if new; returns its id either way.
    pub fn register(&mut self, name: &str) -> u32 {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        self.names.push(name.to_string());
        let id = self.names.len() as u32;
        self.ids.insert(name.to_string(), id);
        id
    }

    pub fn get_id(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    /// Name for `id`, or `"na"` when unregistered (including id 0).
    pub fn name(&self, id: u32) -> &str {
        if id == 0 {
            return "na";
        }
        self.names
            .get(id as usize - 1)
            .map(String::as_str)
            .unwrap_or("na")
    }

    /// Number of registered names; equals the highest assigned id.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// A generic detector registered outside any block; its signature id is
/// valid within every block.
#[derive(Debug, Clone)]
pub struct ClassifierDescriptor {
    pub sig_id: u32,
    pub standalone: bool,
    pub is_final: bool,
}

/// A detector definition belonging to one block.
#[derive(Debug, Clone)]
pub struct SignatureDef {
    pub id: u32,
    /// Consuming detector kind: `port`, `dpi`, `http`, `http-header`,
    /// `http-request-body`, `http-response-body`, …
    pub kind: String,
    pub standalone: bool,
    pub is_final: bool,
    pub tags: TagContainer,
    attrs: HashMap<String, String>,
}

impl SignatureDef {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// An `exclude` element of a rule or precondition, resolved to ids.
#[derive(Debug, Clone, Copy)]
pub enum ExcludeRef {
    /// `block="name"`: everything hinted by that block.
    Block(u32),
    /// `block="all"`: every foreign hint.
    All,
    /// `block="all" facet="name"`: every hint feeding that facet.
    Facet(u32),
}

#[derive(Debug, Clone, Default)]
pub struct PreconditionDef {
    pub excludes: Vec<ExcludeRef>,
    pub allows: Vec<u32>,
    pub constraints: Vec<Constraint>,
}

#[derive(Debug, Clone)]
pub struct RuleDef {
    pub is_final: bool,
    pub includes: Vec<Hint>,
    pub excludes: Vec<ExcludeRef>,
    pub allows: Vec<u32>,
    pub constraints: Vec<Constraint>,
    pub tags: TagContainer,
}

#[derive(Debug, Clone)]
pub struct BlockDef {
    pub tags: TagContainer,
    pub signatures: Vec<SignatureDef>,
    pub precondition: Option<PreconditionDef>,
    pub rules: Vec<RuleDef>,
}

/// The immutable rule set.
#[derive(Debug, Default)]
pub struct ClassificationMetadata {
    blocks_mapper: IdNameMapper,
    facets_mapper: IdNameMapper,
    focus_mapper: IdNameMapper,
    final_mask: BitSet,
    classifiers: BTreeMap<String, ClassifierDescriptor>,
    blocks: Vec<BlockDef>,
    number_of_signatures: usize,
}

impl ClassificationMetadata {
    /// An empty rule set: no facets, no blocks. Used when the configuration
    /// carries no classification file; stages that need signatures then fail
    /// their own initialisation.
    pub fn empty() -> Self {
        ClassificationMetadata {
            final_mask: BitSet::new(1),
            ..Default::default()
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(&path).with_context(|| {
            format!("reading classification metadata {:?}", path.as_ref())
        })?;
        Self::from_str(&text)
            .with_context(|| format!("parsing classification metadata {:?}", path.as_ref()))
    }

    pub fn blocks(&self) -> &IdNameMapper {
        &self.blocks_mapper
    }

    pub fn facets(&self) -> &IdNameMapper {
        &self.facets_mapper
    }

    pub fn focuses(&self) -> &IdNameMapper {
        &self.focus_mapper
    }

    /// Bit i set iff facet i must be final for a flow to be final overall.
    pub fn final_mask(&self) -> &BitSet {
        &self.final_mask
    }

    pub fn classifiers(&self) -> &BTreeMap<String, ClassifierDescriptor> {
        &self.classifiers
    }

    pub fn classifier_sig_id(&self, name: &str) -> Option<u32> {
        self.classifiers.get(name).map(|c| c.sig_id)
    }

    /// Block definition for `block_id` (ids start at 1).
    pub fn block(&self, block_id: u32) -> &BlockDef {
        &self.blocks[block_id as usize - 1]
    }

    pub fn number_of_signatures(&self) -> usize {
        self.number_of_signatures
    }

    /// Visits every signature of the given kind across all blocks.
    pub fn for_each_signature<F>(&self, kind: &str, mut f: F)
    where
        F: FnMut(u32, &SignatureDef),
    {
        for block_id in 1..=self.blocks.len() as u32 {
            for sig in &self.block(block_id).signatures {
                if sig.kind == kind {
                    f(block_id, sig);
                }
            }
        }
    }

    pub fn from_str(xml: &str) -> Result<Self> {
        Parser::default().run(xml)
    }
}

/// Raw (unresolved) forms captured during the event walk.
#[derive(Default)]
struct RawCondition {
    is_final: bool,
    includes: Vec<(Option<String>, u32)>,
    excludes: Vec<(String, Option<String>)>,
    allows: Vec<String>,
    constraints: Vec<Constraint>,
    tags: TagContainer,
}

#[derive(Default)]
struct RawBlock {
    name: String,
    tags: TagContainer,
    signatures: Vec<SignatureDef>,
    precondition: Option<RawCondition>,
    rules: Vec<RawCondition>,
}

#[derive(Default)]
struct Parser {
    facets_mapper: IdNameMapper,
    focus_mapper: IdNameMapper,
    required_facets: Vec<u32>,
    classifiers: BTreeMap<String, ClassifierDescriptor>,
    blocks: Vec<RawBlock>,
    block: Option<RawBlock>,
    rule: Option<RawCondition>,
    precondition: Option<RawCondition>,
    signature: Option<SignatureDef>,
    number_of_signatures: usize,
}

impl Parser {
    fn run(mut self, xml: &str) -> Result<ClassificationMetadata> {
        let mut reader = Reader::from_str(xml);
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => self.open(e, false)?,
                Ok(Event::Empty(ref e)) => self.open(e, true)?,
                Ok(Event::End(ref e)) => {
                    let name = local_name(e.name().as_ref());
                    self.close(&name)?;
                }
                Ok(Event::Eof) => break,
                Err(e) => bail!("XML parse error: {}", e),
                _ => {}
            }
            buf.clear();
        }
        self.finish()
    }

    fn open(&mut self, e: &BytesStart, empty: bool) -> Result<()> {
        let name = local_name(e.name().as_ref());
        let attrs = attributes(e)?;
        match name.as_str() {
            "classification" | "facets" | "classifiers" => {}
            "facet" => {
                let facet = require(&attrs, "facet", "name")?;
                let id = self.facets_mapper.register(facet);
                if flag(&attrs, "required") {
                    self.required_facets.push(id);
                }
            }
            "classifier" => {
                let cname = require(&attrs, "classifier", "name")?.to_string();
                let sig_id = number(&attrs, "classifier", "sigId")?;
                self.classifiers.insert(
                    cname,
                    ClassifierDescriptor {
                        sig_id,
                        standalone: flag(&attrs, "standalone"),
                        is_final: flag(&attrs, "final"),
                    },
                );
            }
            "block" => {
                let bname = require(&attrs, "block", "name")?.to_string();
                self.block = Some(RawBlock {
                    name: bname,
                    tags: TagContainer::new(self.facets_mapper.len()),
                    ..Default::default()
                });
                if empty {
                    self.close("block")?;
                }
            }
            "signature" => {
                if self.block.is_none() {
                    bail!("signature outside of a block");
                }
                let id = number(&attrs, "signature", "id")?;
                let kind = require(&attrs, "signature", "type")?.to_string();
                self.signature = Some(SignatureDef {
                    id,
                    kind,
                    standalone: flag(&attrs, "standalone"),
                    is_final: flag(&attrs, "final"),
                    tags: TagContainer::new(self.facets_mapper.len()),
                    attrs,
                });
                if empty {
                    self.close("signature")?;
                }
            }
            "preconditions" => {
                self.precondition = Some(RawCondition::default());
                if empty {
                    self.close("preconditions")?;
                }
            }
            "rule" => {
                self.rule = Some(RawCondition {
                    is_final: flag(&attrs, "final"),
                    tags: TagContainer::new(self.facets_mapper.len()),
                    ..Default::default()
                });
                if empty {
                    self.close("rule")?;
                }
            }
            "tag" => {
                let facet = require(&attrs, "tag", "facet")?;
                let facet_id = self
                    .facets_mapper
                    .get_id(facet)
                    .ok_or_else(|| anyhow!("tag references unknown facet \"{}\"", facet))?;
                let focus_id = self.focus_mapper.register(require(&attrs, "tag", "focus")?);
                let target = if let Some(sig) = self.signature.as_mut() {
                    &mut sig.tags
                } else if let Some(rule) = self.rule.as_mut() {
                    &mut rule.tags
                } else if let Some(block) = self.block.as_mut() {
                    &mut block.tags
                } else {
                    bail!("tag element outside of block, rule or signature");
                };
                target.set_tag(facet_id, focus_id);
            }
            "include" => {
                let rule = self
                    .rule
                    .as_mut()
                    .ok_or_else(|| anyhow!("include outside of a rule"))?;
                let sig_id = number(&attrs, "include", "sigId")?;
                rule.includes
                    .push((attrs.get("block").cloned(), sig_id));
            }
            "exclude" => {
                let target = self
                    .rule
                    .as_mut()
                    .or(self.precondition.as_mut())
                    .ok_or_else(|| anyhow!("exclude outside of rule or preconditions"))?;
                target.excludes.push((
                    require(&attrs, "exclude", "block")?.to_string(),
                    attrs.get("facet").cloned(),
                ));
            }
            "allow" => {
                let target = self
                    .rule
                    .as_mut()
                    .or(self.precondition.as_mut())
                    .ok_or_else(|| anyhow!("allow outside of rule or preconditions"))?;
                target
                    .allows
                    .push(require(&attrs, "allow", "block")?.to_string());
            }
            "constraint" => {
                let cname = require(&attrs, "constraint", "name")?;
                let constraint = Constraint::from_name(cname)
                    .ok_or_else(|| anyhow!("unknown constraint \"{}\"", cname))?;
                let target = self
                    .rule
                    .as_mut()
                    .or(self.precondition.as_mut())
                    .ok_or_else(|| anyhow!("constraint outside of rule or preconditions"))?;
                target.constraints.push(constraint);
            }
            other => bail!("unexpected element <{}>", other),
        }
        Ok(())
    }

    fn close(&mut self, name: &str) -> Result<()> {
        match name {
            "signature" => {
                let sig = self.signature.take().expect("open signature");
                let block = self.block.as_mut().expect("open block");
                self.number_of_signatures += 1;
                block.signatures.push(sig);
            }
            "rule" => {
                let rule = self.rule.take().expect("open rule");
                self.block
                    .as_mut()
                    .ok_or_else(|| anyhow!("rule outside of a block"))?
                    .rules
                    .push(rule);
            }
            "preconditions" => {
                let precondition = self.precondition.take().expect("open preconditions");
                let block = self
                    .block
                    .as_mut()
                    .ok_or_else(|| anyhow!("preconditions outside of a block"))?;
                if block.precondition.is_some() {
                    bail!("block \"{}\": multiple preconditions", block.name);
                }
                block.precondition = Some(precondition);
            }
            "block" => {
                let block = self.block.take().expect("open block");
                self.blocks.push(block);
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Result<ClassificationMetadata> {
        let mut blocks_mapper = IdNameMapper::default();
        for block in &self.blocks {
            if blocks_mapper.get_id(&block.name).is_some() {
                bail!("duplicate block \"{}\"", block.name);
            }
            blocks_mapper.register(&block.name);
        }

        // Block signature ids must stay below the classifier id range.
        if let Some(min_classifier) = self.classifiers.values().map(|c| c.sig_id).min() {
            for block in &self.blocks {
                for sig in &block.signatures {
                    if sig.id >= min_classifier {
                        bail!(
                            "block \"{}\": signature id {} collides with the classifier id range (≥ {})",
                            block.name,
                            sig.id,
                            min_classifier
                        );
                    }
                }
            }
        }

        let mut final_mask = BitSet::new(self.facets_mapper.len() + 1);
        for id in &self.required_facets {
            final_mask.set(*id as usize);
        }

        let resolve_block = |name: &str| -> Result<u32> {
            blocks_mapper
                .get_id(name)
                .ok_or_else(|| anyhow!("reference to unknown block \"{}\"", name))
        };
        let resolve_excludes = |raw: &[(String, Option<String>)]| -> Result<Vec<ExcludeRef>> {
            raw.iter()
                .map(|(block, facet)| {
                    Ok(if block == "all" {
                        match facet {
                            None => ExcludeRef::All,
                            Some(f) => ExcludeRef::Facet(
                                self.facets_mapper
                                    .get_id(f)
                                    .ok_or_else(|| anyhow!("reference to unknown facet \"{}\"", f))?,
                            ),
                        }
                    } else {
                        ExcludeRef::Block(resolve_block(block)?)
                    })
                })
                .collect()
        };

        let mut blocks = Vec::with_capacity(self.blocks.len());
        for (index, raw) in self.blocks.iter().enumerate() {
            let own_id = index as u32 + 1;
            let mut rules = Vec::with_capacity(raw.rules.len());
            for rule in &raw.rules {
                let includes = rule
                    .includes
                    .iter()
                    .map(|(block, sig)| {
                        Ok(match block {
                            None => (own_id, *sig),
                            Some(name) => (resolve_block(name)?, *sig),
                        })
                    })
                    .collect::<Result<Vec<Hint>>>()?;
                rules.push(RuleDef {
                    is_final: rule.is_final,
                    includes,
                    excludes: resolve_excludes(&rule.excludes)?,
                    allows: rule
                        .allows
                        .iter()
                        .map(|n| resolve_block(n))
                        .collect::<Result<_>>()?,
                    constraints: rule.constraints.clone(),
                    tags: rule.tags.clone(),
                });
            }
            let precondition = match &raw.precondition {
                None => None,
                Some(pre) => Some(PreconditionDef {
                    excludes: resolve_excludes(&pre.excludes)?,
                    allows: pre
                        .allows
                        .iter()
                        .map(|n| resolve_block(n))
                        .collect::<Result<_>>()?,
                    constraints: pre.constraints.clone(),
                }),
            };
            blocks.push(BlockDef {
                tags: raw.tags.clone(),
                signatures: raw.signatures.clone(),
                precondition,
                rules,
            });
        }

        Ok(ClassificationMetadata {
            blocks_mapper,
            facets_mapper: self.facets_mapper,
            focus_mapper: self.focus_mapper,
            final_mask,
            classifiers: self.classifiers,
            blocks,
            number_of_signatures: self.number_of_signatures,
        })
    }
}

fn local_name(raw: &[u8]) -> String {
    let name = str::from_utf8(raw).unwrap_or("");
    name.rsplit(':').next().unwrap_or(name).to_string()
}

fn attributes(e: &BytesStart) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| anyhow!("bad attribute: {}", e))?;
        let key = local_name(attr.key.as_ref());
        let value = attr
            .unescape_value()
            .map_err(|e| anyhow!("bad attribute value: {}", e))?
            .into_owned();
        map.insert(key, value);
    }
    Ok(map)
}

fn require<'a>(attrs: &'a HashMap<String, String>, elem: &str, key: &str) -> Result<&'a str> {
    attrs
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("<{}> missing attribute \"{}\"", elem, key))
}

fn number(attrs: &HashMap<String, String>, elem: &str, key: &str) -> Result<u32> {
    require(attrs, elem, key)?
        .parse()
        .with_context(|| format!("<{}> attribute \"{}\" is not a number", elem, key))
}

fn flag(attrs: &HashMap<String, String>, key: &str) -> bool {
    attrs.get(key).map(|v| v == "true").unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TEST_XML: &str = r#"
<classification>
  <facets>
    <facet name="application" required="true"/>
    <facet name="category"/>
  </facets>
  <classifiers>
    <classifier name="port" sigId="1000" standalone="true"/>
  </classifiers>
  <block name="HTTP">
    <tag facet="application" focus="http"/>
    <signature id="1" type="http" standalone="true"/>
    <signature id="2" type="http-header" name="user-agent" regexp="(?i)curl" standalone="true" final="true">
      <tag facet="category" focus="web"/>
    </signature>
    <signature id="3" type="port" value="80" proto="tcp" standalone="true"/>
  </block>
  <block name="HTTPS">
    <tag facet="application" focus="https"/>
    <signature id="1" type="port" value="443" proto="tcp" standalone="true"/>
  </block>
</classification>
"#;

    pub(crate) fn test_metadata() -> ClassificationMetadata {
        ClassificationMetadata::from_str(TEST_XML).expect("valid test metadata")
    }

    #[test]
    fn loads_facets_blocks_and_signatures() {
        let meta = test_metadata();
        assert_eq!(meta.facets().len(), 2);
        assert_eq!(meta.blocks().len(), 2);
        assert_eq!(meta.number_of_signatures(), 4);
        assert_eq!(meta.blocks().get_id("HTTP"), Some(1));
        assert_eq!(meta.blocks().name(2), "HTTPS");
        assert_eq!(meta.facets().name(1), "application");
        assert!(meta.final_mask().test(1));
        assert!(!meta.final_mask().test(2));
        assert_eq!(meta.classifier_sig_id("port"), Some(1000));
    }

    #[test]
    fn block_and_signature_tags_are_interned() {
        let meta = test_metadata();
        let http = meta.block(1);
        assert_eq!(http.tags.get_tag(1), meta.focuses().get_id("http").unwrap());
        let ua = &http.signatures[1];
        assert!(ua.is_final);
        assert_eq!(ua.tags.get_tag(2), meta.focuses().get_id("web").unwrap());
        assert_eq!(ua.attr("name"), Some("user-agent"));
    }

    #[test]
    fn signature_visitor_filters_by_kind() {
        let meta = test_metadata();
        let mut ports = vec![];
        meta.for_each_signature("port", |block, sig| {
            ports.push((block, sig.attr("value").unwrap().to_string()));
        });
        assert_eq!(
            ports,
            vec![(1, "80".to_string()), (2, "443".to_string())]
        );
    }

    #[test]
    fn unknown_references_are_fatal() {
        let bad_facet = r#"<classification><facets><facet name="a"/></facets>
            <block name="B"><tag facet="nope" focus="x"/></block></classification>"#;
        assert!(ClassificationMetadata::from_str(bad_facet).is_err());

        let bad_constraint = r#"<classification><facets/><block name="B">
            <rule><constraint name="wat"/></rule></block></classification>"#;
        assert!(ClassificationMetadata::from_str(bad_constraint).is_err());

        let bad_block_ref = r#"<classification><facets/><block name="B">
            <rule><exclude block="MISSING"/></rule></block></classification>"#;
        assert!(ClassificationMetadata::from_str(bad_block_ref).is_err());
    }

    #[test]
    fn signature_id_collision_with_classifier_range() {
        let xml = r#"<classification><facets/>
            <classifiers><classifier name="port" sigId="10"/></classifiers>
            <block name="B"><signature id="10" type="dpi" regexp="x"/></block>
            </classification>"#;
        assert!(ClassificationMetadata::from_str(xml).is_err());
    }
}
