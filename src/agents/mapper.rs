//! Mapper stage: rule-based translation plan.
//!
//! A pure function of the `logic_schema`. No backend call, so the plan is
//! identical every time it is computed from the same schema.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::context::PreparedContext;
use crate::pipeline::stage::{require, Stage, StageId, StageOutput, StageReport};
use crate::pipeline::state::{
    DesignMapping, LogicSchema, PatternMapping, PipelineState, ResourceKind,
};

use super::error::StageResult;

/// Cyclomatic complexity above which the plan flags a risk.
const COMPLEXITY_RISK: usize = 15;

/// Loops in one function that make it a vectorization candidate.
const LOOP_HEAVY: usize = 2;

const PYTHON_KEYWORDS: &[&str] = &[
    "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del", "elif",
    "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is", "lambda",
    "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield",
];

const FACTORY_PREFIXES: &[&str] = &["create", "make", "build", "new"];

/// Produces the `design_mapping`.
#[derive(Debug, Clone)]
pub struct MapperAgent {
    target_language: String,
}

impl MapperAgent {
    pub fn new(target_language: impl Into<String>) -> Self {
        Self {
            target_language: target_language.into(),
        }
    }
}

#[async_trait]
impl Stage for MapperAgent {
    fn id(&self) -> StageId {
        StageId::Mapper
    }

    async fn run(&self, state: &PipelineState, _context: &PreparedContext) -> StageResult<StageReport> {
        let schema = require(StageId::Mapper, state.logic_schema(), "logic_schema")?;
        let mapping = map_schema(schema, &self.target_language);
        let message = format!(
            "{} patterns, {} symbols, {} risks",
            mapping.patterns.len(),
            mapping.symbol_map.len(),
            mapping.risks.len()
        );
        Ok(StageReport::new(StageOutput::Mapping(mapping), message))
    }
}

/// Derives the translation plan for `schema`.
pub fn map_schema(schema: &LogicSchema, target_language: &str) -> DesignMapping {
    let mut patterns = Vec::new();
    let mut add = |legacy: &str, target: &str, symbols: BTreeSet<String>| {
        if !symbols.is_empty() {
            patterns.push(PatternMapping {
                legacy: legacy.to_string(),
                target: target.to_string(),
                symbols: symbols.into_iter().collect(),
            });
        }
    };

    let resources = |kinds: &[ResourceKind]| -> BTreeSet<String> {
        schema
            .resource_patterns
            .iter()
            .filter(|p| kinds.contains(&p.kind))
            .map(|p| p.symbol.clone())
            .collect()
    };

    add(
        "manual_allocation",
        "scoped_acquisition",
        resources(&[ResourceKind::ManualAllocation, ResourceKind::ManualRelease]),
    );
    add("raw_pointer", "optional_reference", resources(&[ResourceKind::RawPointer]));
    add(
        "resource_handle",
        "context_manager",
        resources(&[ResourceKind::FileHandle, ResourceKind::Lock]),
    );
    add(
        "singleton_accessor",
        "module_level_instance",
        schema
            .classes
            .iter()
            .filter(|c| c.is_singleton)
            .map(|c| c.name.clone())
            .collect(),
    );
    add(
        "data_class",
        "dataclass",
        schema
            .classes
            .iter()
            .filter(|c| !c.fields.is_empty() && !c.is_singleton)
            .map(|c| c.name.clone())
            .collect(),
    );
    add(
        "factory_function",
        "constructor_classmethod",
        schema
            .functions
            .iter()
            .filter(|f| {
                let lower = f.name.to_ascii_lowercase();
                FACTORY_PREFIXES.iter().any(|p| lower.starts_with(p)) && lower.len() > 4
            })
            .map(|f| f.name.clone())
            .collect(),
    );
    add(
        "blocking_io",
        "async_candidate",
        schema
            .functions
            .iter()
            .filter(|f| f.performs_io && f.name != "main")
            .map(|f| f.name.clone())
            .collect(),
    );
    add(
        "loop_heavy",
        "vectorization_candidate",
        schema
            .functions
            .iter()
            .filter(|f| f.loop_count >= LOOP_HEAVY)
            .map(|f| f.name.clone())
            .collect(),
    );

    let mut symbol_map = BTreeMap::new();
    for class in &schema.classes {
        symbol_map.insert(class.name.clone(), pascal_case(&class.name));
        for method in &class.methods {
            symbol_map.insert(format!("{}::{}", class.name, method), snake_case(method));
        }
    }
    for function in &schema.functions {
        let key = match &function.owner {
            Some(owner) => format!("{}::{}", owner, function.name),
            None => function.name.clone(),
        };
        symbol_map.insert(key, snake_case(&function.name));
    }

    let risks = risks(schema);
    let rationale = if patterns.is_empty() {
        format!(
            "No legacy idioms detected; translate {} classes and {} functions directly to {}.",
            schema.classes.len(),
            schema.functions.len(),
            target_language
        )
    } else {
        format!(
            "Replace {} legacy idioms with {} equivalents: {}.",
            patterns.len(),
            target_language,
            patterns
                .iter()
                .map(|p| format!("{} -> {}", p.legacy, p.target))
                .collect::<Vec<_>>()
                .join(", ")
        )
    };

    DesignMapping {
        target_language: target_language.to_string(),
        patterns,
        symbol_map,
        risks,
        rationale,
    }
}

fn risks(schema: &LogicSchema) -> Vec<String> {
    let mut risks = Vec::new();

    let allocations = schema
        .resource_patterns
        .iter()
        .filter(|p| p.kind == ResourceKind::ManualAllocation)
        .count();
    let releases = schema
        .resource_patterns
        .iter()
        .filter(|p| p.kind == ResourceKind::ManualRelease)
        .count();
    if allocations > releases {
        risks.push(format!(
            "{} allocations but {} releases: the legacy code may leak; confirm intended lifetimes",
            allocations, releases
        ));
    }
    if schema.has_resource(ResourceKind::RawPointer) {
        risks.push("raw pointers may alias; verify no shared mutation is lost in translation".to_string());
    }
    if schema.has_resource(ResourceKind::Lock) {
        risks.push("locking semantics differ in the target runtime; re-check critical sections".to_string());
    }
    if schema.control_flow.cyclomatic_complexity > COMPLEXITY_RISK {
        risks.push(format!(
            "cyclomatic complexity {} exceeds {}; port in small verified steps",
            schema.control_flow.cyclomatic_complexity, COMPLEXITY_RISK
        ));
    }
    if schema.classes.is_empty() && schema.functions.is_empty() {
        risks.push("no classes or functions detected; the plan is based on the flow description only".to_string());
    }

    risks
}

/// `getHTTPValue` -> `get_http_value`, escaping target keywords.
pub fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev = i.checked_sub(1).map(|j| chars[j]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_ascii_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_ascii_uppercase() => next.is_some_and(|n| n.is_ascii_lowercase()),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }

    let mut out = out.trim_matches('_').to_string();
    if out.is_empty() {
        out.push_str("unnamed");
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    if PYTHON_KEYWORDS.contains(&out.as_str()) {
        out.push('_');
    }
    out
}

/// `ring_buffer` -> `RingBuffer`; already-Pascal names are kept.
pub fn pascal_case(name: &str) -> String {
    let out: String = name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
    if out.is_empty() {
        "Unnamed".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextStrategy;
    use crate::pipeline::state::{ClassInfo, ControlFlow, FunctionInfo, ResourcePattern};

    fn resource(kind: ResourceKind, symbol: &str, line: usize) -> ResourcePattern {
        ResourcePattern {
            kind,
            symbol: symbol.to_string(),
            line,
        }
    }

    fn schema() -> LogicSchema {
        LogicSchema {
            classes: vec![
                ClassInfo {
                    name: "ConfigRegistry".to_string(),
                    methods: vec!["getInstance".to_string()],
                    fields: vec!["entries".to_string()],
                    is_singleton: true,
                },
                ClassInfo {
                    name: "sample_point".to_string(),
                    methods: Vec::new(),
                    fields: vec!["x".to_string(), "y".to_string()],
                    is_singleton: false,
                },
            ],
            functions: vec![
                FunctionInfo {
                    name: "createBuffer".to_string(),
                    ..Default::default()
                },
                FunctionInfo {
                    name: "loadFile".to_string(),
                    performs_io: true,
                    ..Default::default()
                },
                FunctionInfo {
                    name: "convolve".to_string(),
                    loop_count: 3,
                    ..Default::default()
                },
                FunctionInfo {
                    name: "lambda".to_string(),
                    owner: Some("Parser".to_string()),
                    ..Default::default()
                },
            ],
            includes: vec!["cstdlib".to_string()],
            resource_patterns: vec![
                resource(ResourceKind::ManualAllocation, "malloc", 4),
                resource(ResourceKind::ManualAllocation, "Buffer", 9),
                resource(ResourceKind::ManualRelease, "buf", 12),
                resource(ResourceKind::RawPointer, "buf", 4),
                resource(ResourceKind::FileHandle, "fopen", 20),
            ],
            control_flow: ControlFlow {
                branches: 10,
                loops: 8,
                max_nesting: 4,
                cyclomatic_complexity: 19,
            },
            flow_description: "Loads, convolves and writes samples.".to_string(),
            line_count: 120,
            strategy: ContextStrategy::Direct,
            notes: Vec::new(),
        }
    }

    fn pattern<'a>(mapping: &'a DesignMapping, legacy: &str) -> Option<&'a PatternMapping> {
        mapping.patterns.iter().find(|p| p.legacy == legacy)
    }

    #[test]
    fn test_pattern_rules() {
        let mapping = map_schema(&schema(), "python");
        assert_eq!(mapping.target_language, "python");

        let manual = pattern(&mapping, "manual_allocation").unwrap();
        assert_eq!(manual.target, "scoped_acquisition");
        assert_eq!(manual.symbols, vec!["Buffer", "buf", "malloc"]);

        assert_eq!(pattern(&mapping, "raw_pointer").unwrap().symbols, vec!["buf"]);
        assert_eq!(pattern(&mapping, "resource_handle").unwrap().target, "context_manager");
        assert_eq!(
            pattern(&mapping, "singleton_accessor").unwrap().symbols,
            vec!["ConfigRegistry"]
        );
        assert_eq!(pattern(&mapping, "data_class").unwrap().symbols, vec!["sample_point"]);
        assert_eq!(
            pattern(&mapping, "factory_function").unwrap().symbols,
            vec!["createBuffer"]
        );
        assert_eq!(pattern(&mapping, "blocking_io").unwrap().symbols, vec!["loadFile"]);
        assert_eq!(pattern(&mapping, "loop_heavy").unwrap().symbols, vec!["convolve"]);
        assert!(mapping.rationale.contains("manual_allocation -> scoped_acquisition"));
    }

    #[test]
    fn test_symbol_map() {
        let mapping = map_schema(&schema(), "python");
        assert_eq!(mapping.symbol_map["ConfigRegistry"], "ConfigRegistry");
        assert_eq!(mapping.symbol_map["sample_point"], "SamplePoint");
        assert_eq!(mapping.symbol_map["ConfigRegistry::getInstance"], "get_instance");
        assert_eq!(mapping.symbol_map["loadFile"], "load_file");
        assert_eq!(mapping.symbol_map["Parser::lambda"], "lambda_");
    }

    #[test]
    fn test_risks() {
        let mapping = map_schema(&schema(), "python");
        assert!(mapping.risks.iter().any(|r| r.contains("2 allocations but 1 releases")));
        assert!(mapping.risks.iter().any(|r| r.contains("raw pointers")));
        assert!(mapping.risks.iter().any(|r| r.contains("complexity 19")));
    }

    #[test]
    fn test_mapping_is_idempotent() {
        let schema = schema();
        assert_eq!(map_schema(&schema, "python"), map_schema(&schema, "python"));
    }

    #[test]
    fn test_empty_schema() {
        let mut empty = schema();
        empty.classes.clear();
        empty.functions.clear();
        empty.resource_patterns.clear();
        empty.control_flow = ControlFlow::default();

        let mapping = map_schema(&empty, "python");
        assert!(mapping.patterns.is_empty());
        assert!(mapping.symbol_map.is_empty());
        assert_eq!(mapping.risks.len(), 1);
        assert!(mapping.rationale.starts_with("No legacy idioms detected"));
    }

    #[test]
    fn test_case_conversion() {
        assert_eq!(snake_case("getHTTPValue"), "get_http_value");
        assert_eq!(snake_case("parse_header"), "parse_header");
        assert_eq!(snake_case("~Buffer"), "buffer");
        assert_eq!(snake_case("Vec3Add"), "vec3_add");
        assert_eq!(snake_case("del"), "del_");
        assert_eq!(pascal_case("ring_buffer"), "RingBuffer");
        assert_eq!(pascal_case("HTTPServer"), "HTTPServer");
    }
}
