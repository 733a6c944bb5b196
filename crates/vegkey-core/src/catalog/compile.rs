//! Typed, name-resolved form of a catalog.
//!
//! Compilation is the catalog's validation pass: every layer name must resolve
//! in the sealed registry, every constant target must fit the output type,
//! and every expression must be well-typed. Nothing here touches pixel data.

use std::collections::{BTreeMap, HashMap};

use crate::catalog::expr::{self, BinOp, Expr};
use crate::catalog::{Catalog, TargetSpec};
use crate::engine::OutputSpec;
use crate::error::{KeyError, Result};
use crate::registry::{LayerHandle, SealedRegistry};

/// Additive guard on ratio denominators: `a / b` evaluates as `a / (b + ε)`.
pub const RATIO_EPSILON: f64 = 0.01;

/// Per-pixel inputs visible to an expression.
pub trait PixelContext {
    /// Value of a layer slot, `None` where the layer holds its nodata sentinel.
    fn layer(&self, slot: usize) -> Option<f64>;
    /// The classification buffer at this pixel, `None` where it holds output nodata.
    fn current(&self) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    #[inline]
    fn apply(self, a: f64, b: f64) -> bool {
        match self {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    /// Epsilon-guarded division.
    Ratio,
    Min,
    Max,
}

/// Numeric expression. Missing inputs propagate as `None`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Const(f64),
    Layer(usize),
    Current,
    Neg(Box<Value>),
    Trunc(Box<Value>),
    Arith(ArithOp, Box<Value>, Box<Value>),
    /// `where(cond, a, b)`: only the chosen branch is evaluated.
    Select(Box<Predicate>, Box<Value>, Box<Value>),
}

impl Value {
    pub fn eval<C: PixelContext>(&self, ctx: &C) -> Option<f64> {
        match self {
            Value::Const(v) => Some(*v),
            Value::Layer(slot) => ctx.layer(*slot),
            Value::Current => ctx.current(),
            Value::Neg(v) => v.eval(ctx).map(|x| -x),
            Value::Trunc(v) => v.eval(ctx).map(f64::trunc),
            Value::Arith(op, l, r) => {
                let a = l.eval(ctx)?;
                let b = r.eval(ctx)?;
                Some(match op {
                    ArithOp::Add => a + b,
                    ArithOp::Sub => a - b,
                    ArithOp::Mul => a * b,
                    ArithOp::Ratio => a / (b + RATIO_EPSILON),
                    ArithOp::Min => a.min(b),
                    ArithOp::Max => a.max(b),
                })
            }
            Value::Select(cond, a, b) => {
                if cond.test(ctx) {
                    a.eval(ctx)
                } else {
                    b.eval(ctx)
                }
            }
        }
    }

    fn visit_slots(&self, f: &mut impl FnMut(usize)) {
        match self {
            Value::Layer(s) => f(*s),
            Value::Neg(v) | Value::Trunc(v) => v.visit_slots(f),
            Value::Arith(_, l, r) => {
                l.visit_slots(f);
                r.visit_slots(f);
            }
            Value::Select(cond, a, b) => {
                cond.collect_slots(f);
                a.visit_slots(f);
                b.visit_slots(f);
            }
            Value::Const(_) | Value::Current => {}
        }
    }
}

/// Pure, total, pointwise boolean test.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Const(bool),
    Not(Box<Predicate>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    /// False whenever either side is missing.
    Compare(CmpOp, Value, Value),
    InSet(Value, Vec<f64>),
    InRange(Value, f64, f64),
    IsNodata(usize),
}

impl Predicate {
    pub fn test<C: PixelContext>(&self, ctx: &C) -> bool {
        match self {
            Predicate::Const(b) => *b,
            Predicate::Not(p) => !p.test(ctx),
            Predicate::All(ps) => ps.iter().all(|p| p.test(ctx)),
            Predicate::Any(ps) => ps.iter().any(|p| p.test(ctx)),
            Predicate::Compare(op, l, r) => match (l.eval(ctx), r.eval(ctx)) {
                (Some(a), Some(b)) => op.apply(a, b),
                _ => false,
            },
            Predicate::InSet(v, set) => v.eval(ctx).is_some_and(|x| set.contains(&x)),
            Predicate::InRange(v, lo, hi) => v.eval(ctx).is_some_and(|x| x >= *lo && x <= *hi),
            Predicate::IsNodata(slot) => ctx.layer(*slot).is_none(),
        }
    }

    /// Every layer slot the predicate reads.
    pub fn slots(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_slots(&mut |s| out.push(s));
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_slots(&self, f: &mut impl FnMut(usize)) {
        match self {
            Predicate::Const(_) => {}
            Predicate::Not(p) => p.collect_slots(f),
            Predicate::All(ps) | Predicate::Any(ps) => ps.iter().for_each(|p| p.collect_slots(f)),
            Predicate::Compare(_, l, r) => {
                l.visit_slots(f);
                r.visit_slots(f);
            }
            Predicate::InSet(v, _) | Predicate::InRange(v, _, _) => v.visit_slots(f),
            Predicate::IsNodata(s) => f(*s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompiledTarget {
    Code(i32),
    /// Copy the slot's value; a missing value writes output nodata.
    Layer(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub id: String,
    pub label: Option<String>,
    pub phase: usize,
    pub predicate: Predicate,
    pub target: CompiledTarget,
    pub enabled: bool,
}

/// A registered layer the catalog reads, in first-reference order.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub handle: LayerHandle,
    pub name: String,
    /// Replacement for the layer's nodata sentinel, if configured.
    pub fill: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CompiledCatalog {
    pub name: String,
    pub base_code: i32,
    pub phases: Vec<String>,
    pub rules: Vec<CompiledRule>,
    pub slots: Vec<Slot>,
}

impl CompiledCatalog {
    pub fn compile(catalog: &Catalog, registry: &SealedRegistry, output: &OutputSpec) -> Result<Self> {
        let mut c = Compiler {
            registry,
            fill: &catalog.fill_nodata,
            slots: Vec::new(),
            slot_of: HashMap::new(),
            derived: HashMap::new(),
        };

        for name in catalog.fill_nodata.keys() {
            registry.resolve_for(name, "fill_nodata")?;
        }

        for d in &catalog.derive {
            let location = format!("derived quantity '{}'", d.name);
            if d.name == "current" || c.derived.contains_key(&d.name) || registry.resolve(&d.name).is_ok() {
                return Err(KeyError::CatalogSyntax {
                    location,
                    message: "name is already taken by a layer, a derived quantity, or 'current'".into(),
                });
            }
            let parsed = expr::parse(&d.expr).map_err(|message| KeyError::CatalogSyntax {
                location: location.clone(),
                message,
            })?;
            let value = c.value(&parsed, &location)?;
            c.derived.insert(d.name.clone(), value);
        }

        let base_code = output.code(catalog.base_code, "base_code")?;
        if base_code == output.nodata_code() {
            return Err(KeyError::CatalogSyntax {
                location: "base_code".into(),
                message: format!("unassigned code {base_code} equals the output nodata value"),
            });
        }

        let mut rules = Vec::with_capacity(catalog.rule_count());
        for (phase, spec) in catalog.rules() {
            let location = format!("rule {}", spec.id);
            let parsed = expr::parse(&spec.when).map_err(|message| KeyError::CatalogSyntax {
                location: location.clone(),
                message,
            })?;
            let predicate = c.predicate(&parsed, &location)?;
            let target = match &spec.then {
                TargetSpec::Code(code) => CompiledTarget::Code(output.code(*code, &location)?),
                TargetSpec::Layer { layer } => {
                    let slot = c.layer_slot(layer, &location)?;
                    let layer_type = registry.meta(c.slots[slot].handle).element_type;
                    if !output.element_type.holds(layer_type) {
                        let (_, hi) = layer_type.range();
                        return Err(KeyError::TypeOverflow {
                            code: hi as i64,
                            element_type: output.element_type,
                            referenced_by: format!("{location} (copies {layer_type} layer '{layer}')"),
                        });
                    }
                    CompiledTarget::Layer(slot)
                }
            };
            rules.push(CompiledRule {
                id: spec.id.clone(),
                label: spec.label.clone(),
                phase,
                predicate,
                target,
                enabled: spec.enabled,
            });
        }

        Ok(Self {
            name: catalog.name.clone(),
            base_code,
            phases: catalog.phases.iter().map(|p| p.name.clone()).collect(),
            rules,
            slots: c.slots,
        })
    }

    /// Rules the engine evaluates, in order.
    pub fn enabled_rules(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    pub fn phase_name(&self, rule: &CompiledRule) -> &str {
        &self.phases[rule.phase]
    }
}

struct Compiler<'a> {
    registry: &'a SealedRegistry,
    fill: &'a BTreeMap<String, f64>,
    slots: Vec<Slot>,
    slot_of: HashMap<LayerHandle, usize>,
    derived: HashMap<String, Value>,
}

impl Compiler<'_> {
    fn layer_slot(&mut self, name: &str, location: &str) -> Result<usize> {
        let handle = self.registry.resolve_for(name, location)?;
        if let Some(&slot) = self.slot_of.get(&handle) {
            return Ok(slot);
        }
        let slot = self.slots.len();
        self.slots.push(Slot {
            handle,
            name: name.to_string(),
            fill: self.fill.get(name).copied(),
        });
        self.slot_of.insert(handle, slot);
        Ok(slot)
    }

    fn value(&mut self, e: &Expr, location: &str) -> Result<Value> {
        let syntax = |message: String| KeyError::CatalogSyntax { location: location.to_string(), message };
        Ok(match e {
            Expr::Number(n) => Value::Const(*n),
            Expr::Ident(name) if name == "current" => Value::Current,
            Expr::Ident(name) => match self.derived.get(name) {
                Some(v) => v.clone(),
                None => Value::Layer(self.layer_slot(name, location)?),
            },
            Expr::Neg(inner) => Value::Neg(Box::new(self.value(inner, location)?)),
            Expr::Binary(op, l, r) if !op.is_comparison() && !op.is_logical() => {
                let op = match op {
                    BinOp::Add => ArithOp::Add,
                    BinOp::Sub => ArithOp::Sub,
                    BinOp::Mul => ArithOp::Mul,
                    _ => ArithOp::Ratio,
                };
                Value::Arith(op, Box::new(self.value(l, location)?), Box::new(self.value(r, location)?))
            }
            Expr::Call(f, args) => match (f.as_str(), args.as_slice()) {
                ("trunc", [a]) => Value::Trunc(Box::new(self.value(a, location)?)),
                ("min", [a, b]) => {
                    Value::Arith(ArithOp::Min, Box::new(self.value(a, location)?), Box::new(self.value(b, location)?))
                }
                ("max", [a, b]) => {
                    Value::Arith(ArithOp::Max, Box::new(self.value(a, location)?), Box::new(self.value(b, location)?))
                }
                ("where", [cond, a, b]) => Value::Select(
                    Box::new(self.predicate(cond, location)?),
                    Box::new(self.value(a, location)?),
                    Box::new(self.value(b, location)?),
                ),
                ("trunc", _) | ("min", _) | ("max", _) | ("where", _) => {
                    return Err(syntax(format!("{f}() called with {} arguments", args.len())))
                }
                ("nodata", _) => return Err(syntax("nodata() is a condition, not a value".into())),
                _ => return Err(syntax(format!("unknown function '{f}'"))),
            },
            Expr::Bool(_) | Expr::Not(_) | Expr::Binary(..) | Expr::InList(..) | Expr::InRange(..) => {
                return Err(syntax("expected a value, found a condition".into()))
            }
        })
    }

    fn predicate(&mut self, e: &Expr, location: &str) -> Result<Predicate> {
        let syntax = |message: String| KeyError::CatalogSyntax { location: location.to_string(), message };
        Ok(match e {
            Expr::Bool(b) => Predicate::Const(*b),
            Expr::Not(inner) => Predicate::Not(Box::new(self.predicate(inner, location)?)),
            Expr::Binary(BinOp::And, l, r) => {
                let mut parts = Vec::new();
                for side in [l, r] {
                    match self.predicate(side, location)? {
                        Predicate::All(inner) => parts.extend(inner),
                        p => parts.push(p),
                    }
                }
                Predicate::All(parts)
            }
            Expr::Binary(BinOp::Or, l, r) => {
                let mut parts = Vec::new();
                for side in [l, r] {
                    match self.predicate(side, location)? {
                        Predicate::Any(inner) => parts.extend(inner),
                        p => parts.push(p),
                    }
                }
                Predicate::Any(parts)
            }
            Expr::Binary(op, l, r) if op.is_comparison() => {
                let cmp = match op {
                    BinOp::Eq => CmpOp::Eq,
                    BinOp::Ne => CmpOp::Ne,
                    BinOp::Lt => CmpOp::Lt,
                    BinOp::Le => CmpOp::Le,
                    BinOp::Gt => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                Predicate::Compare(cmp, self.value(l, location)?, self.value(r, location)?)
            }
            Expr::InList(v, items) => Predicate::InSet(self.value(v, location)?, items.clone()),
            Expr::InRange(v, lo, hi) => {
                if lo > hi {
                    return Err(syntax(format!("empty range {lo}..={hi}")));
                }
                Predicate::InRange(self.value(v, location)?, *lo, *hi)
            }
            Expr::Call(f, args) if f == "nodata" => match args.as_slice() {
                [Expr::Ident(name)] if name != "current" && !self.derived.contains_key(name) => {
                    Predicate::IsNodata(self.layer_slot(name, location)?)
                }
                _ => return Err(syntax("nodata() takes a single layer name".into())),
            },
            Expr::Number(_) | Expr::Ident(_) | Expr::Neg(_) | Expr::Binary(..) | Expr::Call(..) => {
                return Err(syntax("expected a condition, found a value".into()))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RuleSpec;
    use crate::grid::GridGeometry;
    use crate::raster::{ElementType, MemoryRaster};
    use crate::registry::LayerRegistry;

    struct Px {
        layers: Vec<Option<f64>>,
        current: Option<f64>,
    }

    impl PixelContext for Px {
        fn layer(&self, slot: usize) -> Option<f64> {
            self.layers[slot]
        }
        fn current(&self) -> Option<f64> {
            self.current
        }
    }

    fn registry(names: &[(&str, ElementType)]) -> SealedRegistry {
        let mut reg = LayerRegistry::new();
        for (name, ty) in names {
            reg.register(*name, MemoryRaster::filled(GridGeometry::unit(2, 2), *ty, Some(255.0), 0.0))
                .unwrap();
        }
        reg.seal().unwrap()
    }

    fn output() -> OutputSpec {
        OutputSpec::new(ElementType::I16, -32768).unwrap()
    }

    fn compile_one(when: &str, reg: &SealedRegistry) -> Result<CompiledCatalog> {
        let catalog = Catalog::new("t", 253).with_phase("p", vec![RuleSpec::new("r1", when, 17)]);
        CompiledCatalog::compile(&catalog, reg, &output())
    }

    #[test]
    fn slots_follow_first_reference_order() {
        let reg = registry(&[("area", ElementType::U8), ("alnus", ElementType::U8), ("zones", ElementType::U8)]);
        let c = compile_one("zones in 2..=7 && alnus >= 30 && zones != 4", &reg).unwrap();
        let names: Vec<_> = c.slots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["zones", "alnus"]);
        assert_eq!(c.rules[0].predicate.slots(), vec![0, 1]);
    }

    #[test]
    fn conjunctions_are_flattened() {
        let reg = registry(&[("a", ElementType::U8)]);
        let c = compile_one("a > 1 && a > 2 && a > 3", &reg).unwrap();
        assert!(matches!(&c.rules[0].predicate, Predicate::All(p) if p.len() == 3));
    }

    #[test]
    fn unknown_layer_names_the_rule() {
        let reg = registry(&[("a", ElementType::U8)]);
        let err = compile_one("picsum >= 5", &reg).unwrap_err();
        assert!(matches!(err, KeyError::UnknownLayer { ref name, ref referenced_by } if name == "picsum" && referenced_by == "rule r1"));
    }

    #[test]
    fn type_errors_are_syntax_errors() {
        let reg = registry(&[("a", ElementType::U8)]);
        assert!(matches!(compile_one("a", &reg), Err(KeyError::CatalogSyntax { .. })));
        assert!(matches!(compile_one("(a > 1) + 2 > 0", &reg), Err(KeyError::CatalogSyntax { .. })));
        assert!(matches!(compile_one("nodata(a + 1)", &reg), Err(KeyError::CatalogSyntax { .. })));
        assert!(matches!(compile_one("sqrt(a) > 1", &reg), Err(KeyError::CatalogSyntax { .. })));
        assert!(matches!(compile_one("a in 5..=1", &reg), Err(KeyError::CatalogSyntax { .. })));
    }

    #[test]
    fn overflowing_codes_fail_before_any_pixel() {
        let reg = registry(&[("a", ElementType::U8)]);
        let catalog = Catalog::new("t", 253).with_phase("p", vec![RuleSpec::new("big", "a > 0", 40_000)]);
        let err = CompiledCatalog::compile(&catalog, &reg, &output()).unwrap_err();
        assert!(matches!(err, KeyError::TypeOverflow { code: 40_000, .. }));

        let catalog = Catalog::new("t", 70_000).with_phase("p", vec![]);
        let err = CompiledCatalog::compile(&catalog, &reg, &output()).unwrap_err();
        assert!(matches!(err, KeyError::TypeOverflow { ref referenced_by, .. } if referenced_by == "base_code"));
    }

    #[test]
    fn base_code_must_differ_from_output_nodata() {
        let reg = registry(&[("a", ElementType::U8)]);
        let catalog = Catalog::new("t", -32768).with_phase("p", vec![RuleSpec::new("u", "current == -32768", 5)]);
        let err = CompiledCatalog::compile(&catalog, &reg, &output()).unwrap_err();
        assert!(matches!(err, KeyError::CatalogSyntax { ref location, .. } if location == "base_code"));
    }

    #[test]
    fn layer_copy_requires_a_fitting_type() {
        let reg = registry(&[("evt", ElementType::I16), ("wide", ElementType::U16)]);
        let ok = Catalog::new("t", 1).with_phase("p", vec![RuleSpec::copy_layer("m", "current == 1", "evt")]);
        let c = CompiledCatalog::compile(&ok, &reg, &output()).unwrap();
        assert_eq!(c.rules[0].target, CompiledTarget::Layer(0));

        let bad = Catalog::new("t", 1).with_phase("p", vec![RuleSpec::copy_layer("m", "current == 1", "wide")]);
        assert!(matches!(
            CompiledCatalog::compile(&bad, &reg, &output()),
            Err(KeyError::TypeOverflow { .. })
        ));
    }

    #[test]
    fn derived_quantities_expand_inline() {
        let reg = registry(&[("picgla", ElementType::U8), ("picmar", ElementType::U8)]);
        let catalog = Catalog::new("t", 253)
            .with_derived("picsum", "picgla + picmar")
            .with_derived("picratio", "trunc(picgla / picsum * 100)")
            .with_phase("p", vec![RuleSpec::new("r", "picratio >= 70", 8)]);
        let c = CompiledCatalog::compile(&catalog, &reg, &output()).unwrap();
        let p = &c.rules[0].predicate;

        let px = |g: f64, m: f64| Px { layers: vec![Some(g), Some(m)], current: Some(253.0) };
        assert!(p.test(&px(40.0, 10.0)));
        assert!(!p.test(&px(10.0, 40.0)));
    }

    #[test]
    fn where_selects_a_branch_per_pixel() {
        let reg = registry(&[("above", ElementType::U8), ("forb", ElementType::U8)]);
        let catalog = Catalog::new("t", 253)
            .with_derived("forb_above", "where(above == 1, forb, 0)")
            .with_phase("p", vec![RuleSpec::new("r", "forb_above >= 20", 35)]);
        let c = CompiledCatalog::compile(&catalog, &reg, &output()).unwrap();
        let p = &c.rules[0].predicate;

        let px = |above: f64, forb: Option<f64>| Px { layers: vec![Some(above), forb], current: Some(253.0) };
        assert!(p.test(&px(1.0, Some(30.0))));
        assert!(!p.test(&px(0.0, Some(30.0))), "outside the sub-domain the covariate reads as zero");
        assert_eq!(p.slots(), vec![0, 1]);

        let zero = Catalog::new("t", 253)
            .with_derived("forb_above", "where(above == 1, forb, 0)")
            .with_phase("p", vec![RuleSpec::new("r", "forb_above == 0", 36)]);
        let c = CompiledCatalog::compile(&zero, &reg, &output()).unwrap();
        assert!(c.rules[0].predicate.test(&px(0.0, None)), "unselected branch may be missing");
        assert!(!c.rules[0].predicate.test(&px(1.0, None)));
    }

    #[test]
    fn derived_name_may_not_shadow_a_layer() {
        let reg = registry(&[("picsum", ElementType::U8)]);
        let catalog = Catalog::new("t", 253).with_derived("picsum", "1 + 1");
        assert!(matches!(
            CompiledCatalog::compile(&catalog, &reg, &output()),
            Err(KeyError::CatalogSyntax { .. })
        ));
    }

    #[test]
    fn missing_values_never_satisfy_comparisons() {
        let reg = registry(&[("a", ElementType::U8), ("b", ElementType::U8)]);
        let missing = Px { layers: vec![None, Some(3.0)], current: Some(253.0) };
        for when in ["a >= 0", "a < 1000", "a == a", "a != 3", "a + b > 0", "a in [0, 255]", "a in 0..=255"] {
            let c = compile_one(when, &reg).unwrap();
            assert!(!c.rules[0].predicate.test(&missing), "{when} matched a missing value");
        }
        let c = compile_one("nodata(a) && !nodata(b)", &reg).unwrap();
        assert!(c.rules[0].predicate.test(&missing));
    }

    #[test]
    fn ratio_of_zeros_is_zero() {
        let reg = registry(&[("a", ElementType::U8), ("b", ElementType::U8)]);
        let zeros = Px { layers: vec![Some(0.0), Some(0.0)], current: Some(253.0) };
        let ge = compile_one("a / (a + b) * 100 >= 1", &reg).unwrap();
        assert!(!ge.rules[0].predicate.test(&zeros));
        let le = compile_one("a / (a + b) * 100 <= 30", &reg).unwrap();
        assert!(le.rules[0].predicate.test(&zeros));
    }

    #[test]
    fn ratio_adds_epsilon_to_the_denominator() {
        let reg = registry(&[("a", ElementType::U8), ("b", ElementType::U8)]);
        let c = compile_one("a / b > 0", &reg).unwrap();
        let Predicate::Compare(_, ratio, _) = &c.rules[0].predicate else {
            panic!("expected a comparison");
        };
        let px = Px { layers: vec![Some(40.0), Some(10.0)], current: Some(253.0) };
        approx::assert_relative_eq!(ratio.eval(&px).unwrap(), 40.0 / 10.01, epsilon = 1e-12);
    }
}
