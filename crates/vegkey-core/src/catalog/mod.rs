//! Rule catalog: ordered (predicate, target) pairs grouped into phases.
//!
//! A catalog is configuration data. It is loaded from JSON, compiled against
//! a sealed registry into a [`CompiledCatalog`], and interpreted by the rule
//! engine. Phases are labels only; evaluation is one linear pass in catalog
//! order.

pub mod compile;
pub mod expr;
pub mod lint;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KeyError, Result};

pub use compile::{CompiledCatalog, CompiledRule, CompiledTarget, Predicate, Value, RATIO_EPSILON};
pub use lint::{lint, Finding, FindingKind};

/// Catalog document as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The "unassigned" code written inside the domain mask before the first rule.
    pub base_code: i64,
    /// Per-layer replacement for that layer's nodata sentinel.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fill_nodata: BTreeMap<String, f64>,
    /// Named derived quantities, in definition order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derive: Vec<DeriveSpec>,
    pub phases: Vec<PhaseSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeriveSpec {
    pub name: String,
    pub expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub when: String,
    pub then: TargetSpec,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Note for domain-expert review; never changes evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

/// What a matching rule writes: a fixed code, or the value of a layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    Code(i64),
    Layer { layer: String },
}

impl Catalog {
    pub fn new(name: impl Into<String>, base_code: i64) -> Self {
        Self {
            name: name.into(),
            description: None,
            base_code,
            fill_nodata: BTreeMap::new(),
            derive: Vec::new(),
            phases: Vec::new(),
        }
    }

    /// Append a phase. Builder-style, mostly for tests and embedded catalogs.
    pub fn with_phase(mut self, name: impl Into<String>, rules: Vec<RuleSpec>) -> Self {
        self.phases.push(PhaseSpec { name: name.into(), rules });
        self
    }

    pub fn with_derived(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.derive.push(DeriveSpec { name: name.into(), expr: expr.into(), review: None });
        self
    }

    pub fn with_fill(mut self, layer: impl Into<String>, value: f64) -> Self {
        self.fill_nodata.insert(layer.into(), value);
        self
    }

    pub fn from_json(text: &str, origin: &Path) -> Result<Self> {
        serde_json::from_str(text).map_err(|source| KeyError::Json { path: origin.to_path_buf(), source })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| KeyError::io(format!("cannot read catalog {}", path.display()), e))?;
        Self::from_json(&text, path)
    }

    /// All rules in evaluation order, paired with their phase index.
    pub fn rules(&self) -> impl Iterator<Item = (usize, &RuleSpec)> {
        self.phases
            .iter()
            .enumerate()
            .flat_map(|(i, p)| p.rules.iter().map(move |r| (i, r)))
    }

    pub fn rule_count(&self) -> usize {
        self.phases.iter().map(|p| p.rules.len()).sum()
    }
}

impl RuleSpec {
    pub fn new(id: impl Into<String>, when: impl Into<String>, code: i64) -> Self {
        Self {
            id: id.into(),
            label: None,
            when: when.into(),
            then: TargetSpec::Code(code),
            enabled: true,
            review: None,
        }
    }

    /// A rule that copies `layer`'s value where `when` holds.
    pub fn copy_layer(id: impl Into<String>, when: impl Into<String>, layer: impl Into<String>) -> Self {
        Self {
            then: TargetSpec::Layer { layer: layer.into() },
            ..Self::new(id, when, 0)
        }
    }

    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn disabled(mut self, review: impl Into<String>) -> Self {
        self.enabled = false;
        self.review = Some(review.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_codes_and_layer_targets() {
        let json = r#"{
            "name": "merge",
            "base_code": 1,
            "phases": [{
                "name": "baseline",
                "rules": [
                    {"id": "m1", "when": "crosswalk > 255", "then": {"layer": "crosswalk"}},
                    {"id": "m2", "when": "current == 4457", "then": 4456, "label": "bog"},
                    {"id": "m3", "when": "current == 1", "then": 7, "enabled": false, "review": "dead"}
                ]
            }]
        }"#;
        let c = Catalog::from_json(json, Path::new("merge.json")).unwrap();
        let rules: Vec<_> = c.rules().map(|(_, r)| r).collect();
        assert_eq!(rules[0].then, TargetSpec::Layer { layer: "crosswalk".into() });
        assert_eq!(rules[1].then, TargetSpec::Code(4456));
        assert!(rules[1].enabled);
        assert!(!rules[2].enabled);
        assert_eq!(c.rule_count(), 3);
    }

    #[test]
    fn malformed_json_names_the_file() {
        let err = Catalog::from_json("{", Path::new("broken.json")).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn shipped_catalogs_deserialize() {
        for (name, text) in [
            ("foliar_key", include_str!("../../../../catalogs/foliar_key.json")),
            ("evt_crosswalk", include_str!("../../../../catalogs/evt_crosswalk.json")),
            ("evt_revision", include_str!("../../../../catalogs/evt_revision.json")),
            ("change_status", include_str!("../../../../catalogs/change_status.json")),
        ] {
            let c = Catalog::from_json(text, Path::new(name)).unwrap();
            assert!(c.rule_count() > 0, "{name} has no rules");
            assert!(
                lint(&c).iter().all(|f| f.kind != FindingKind::DeadRule && f.kind != FindingKind::Syntax),
                "{name} has dead or unparsable rules"
            );
        }
    }

    #[test]
    fn crosswalk_keeps_defective_rules_for_review() {
        let c = Catalog::from_json(include_str!("../../../../catalogs/evt_crosswalk.json"), Path::new("cw")).unwrap();
        let findings = lint(&c);
        let disabled: Vec<_> = findings
            .iter()
            .filter(|f| f.kind == FindingKind::Disabled)
            .map(|f| f.rule.as_str())
            .collect();
        assert_eq!(disabled, vec!["4410", "4479", "4483", "4467", "4476", "4456"]);
        for id in ["7663", "4450"] {
            assert!(
                findings.iter().any(|f| f.rule == id && f.kind == FindingKind::Review),
                "rule {id} should carry a review note"
            );
        }
    }

    #[test]
    fn foliar_key_flags_narrow_integer_arithmetic() {
        let c = Catalog::from_json(include_str!("../../../../catalogs/foliar_key.json"), Path::new("key")).unwrap();
        let findings = lint(&c);
        for (id, phase) in [("ndshrub", "derive"), ("eridwarf", "derive"), ("picwet", "derive"), ("12.36", "sparse or barren")] {
            assert!(
                findings
                    .iter()
                    .any(|f| f.rule == id && f.phase == phase && f.kind == FindingKind::Review && f.message.contains("uint8")),
                "{id} should carry a uint8 review note"
            );
        }
    }

    #[test]
    fn foliar_key_classifies_reference_pixels() {
        use crate::engine::{OutputSpec, RuleEngine};
        use crate::grid::GridGeometry;
        use crate::mask::DomainMask;
        use crate::raster::{ElementType, MemoryRaster};
        use crate::registry::LayerRegistry;

        const LAYERS: [&str; 21] = [
            "area", "zones", "above", "alnus", "betshr", "dectre", "dryas", "empnig", "erivag", "picgla", "picmar",
            "rhoshr", "salshr", "sphagn", "vacvit", "wetsed", "evrshr", "lichen", "forb", "gramin", "decshr",
        ];
        const N: usize = 7;
        let mut values: BTreeMap<&str, [i64; N]> = LAYERS.iter().map(|&l| (l, [0; N])).collect();
        let mut set = |layer: &str, pixel: usize, v: i64| values.get_mut(layer).unwrap()[pixel] = v;
        for p in 0..N {
            set("area", p, 1);
            set("above", p, 1);
        }
        set("alnus", 0, 35);
        set("zones", 1, 3);
        set("picgla", 1, 20);
        set("zones", 2, 3);
        set("picgla", 2, 2);
        set("picmar", 2, 8);
        set("lichen", 2, 20);
        set("sphagn", 4, 25);
        set("wetsed", 4, 20);
        set("evrshr", 4, 20);
        set("lichen", 5, 255);
        set("forb", 5, 255);
        set("area", 6, 0);
        set("alnus", 6, 90);

        let mut reg = LayerRegistry::new();
        for name in LAYERS {
            let raster =
                MemoryRaster::from_ints(GridGeometry::unit(N, 1), ElementType::U8, Some(255.0), &values[name]);
            reg.register(name, raster).unwrap();
        }
        let reg = reg.seal().unwrap();

        let catalog = Catalog::from_json(include_str!("../../../../catalogs/foliar_key.json"), Path::new("key")).unwrap();
        let output = OutputSpec::new(ElementType::U8, 255).unwrap();
        let engine = RuleEngine::compile(&catalog, &reg, output).unwrap();
        let gate = DomainMask::equals("area", 1.0).bind(&reg, &output).unwrap();
        let window = reg.reference().full_window();
        let scope = gate.read(&reg, &window).unwrap();
        let codes = gate.apply(engine.evaluate(&window, &reg, &scope).unwrap(), &scope).into_codes();

        assert_eq!(codes[0], 17, "alder");
        assert_eq!(codes[1], 8, "white spruce forest");
        assert_eq!(codes[2], 1, "spruce-lichen woodland");
        assert_eq!(codes[3], 37, "barren");
        assert_eq!(codes[4], 30, "dwarf shrub-sphagnum");
        assert_eq!(codes[5], 253, "missing forb leaves the pixel unassigned");
        assert_eq!(codes[6], 255, "outside the mask");
    }
}
