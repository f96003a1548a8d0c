//! Deterministic lexical scan of legacy source.
//!
//! A regex pass over comment- and string-stripped text that finds classes,
//! functions, imports, resource-ownership sites and a coarse control-flow
//! shape. It is not a parser: it is the floor the extractor merges backend
//! analysis onto, so the schema is never empty when the source is not.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::pipeline::state::{
    ClassInfo, ControlFlow, FunctionInfo, ResourceKind, ResourcePattern, SourceLanguage,
};
use crate::utils::find_matching_brace;

/// What the scan found in one piece of source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LexicalScan {
    pub line_count: usize,
    pub includes: Vec<String>,
    pub classes: Vec<ClassInfo>,
    pub functions: Vec<FunctionInfo>,
    pub resource_patterns: Vec<ResourcePattern>,
    pub control_flow: ControlFlow,
}

struct Patterns {
    strip: Regex,
    include: Regex,
    class: Regex,
    function: Regex,
    declaration: Regex,
    access: Regex,
    singleton: Regex,
    loop_kw: Regex,
    branch_kw: Regex,
    logical: Regex,
    io_call: Regex,
    io_name: Regex,
    new_alloc: Regex,
    c_alloc: Regex,
    delete: Regex,
    free: Regex,
    raw_pointer: Regex,
    file_handle: Regex,
    lock: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            strip: Regex::new(
                r#"'(?:[^'\\\n]|\\.)'|"(?:[^"\\\n]|\\.)*"|//[^\n]*|/\*[\s\S]*?\*/"#,
            )?,
            include: Regex::new(
                r#"^\s*(?:#\s*include\s*[<"]([^>"]+)[>"]|import\s+(?:static\s+)?([\w.*]+)\s*;)"#,
            )?,
            class: Regex::new(r"\b(?:class|struct|interface)[ \t]+([A-Za-z_]\w*)[^;{()]*\{")?,
            function: Regex::new(
                r"(?m)^[ \t]*((?:[A-Za-z_][\w:<>,\[\]]*[ \t\*&]+)+?)([A-Za-z_~][\w:~]*)[ \t]*\(([^;{}()]*)\)[ \t]*(?:const[ \t]*)?(?:throws[ \t]+[\w., ]+)?\s*\{",
            )?,
            declaration: Regex::new(r"([A-Za-z_~]\w*)\s*\([^()]*\)\s*(?:const\s*)?(?:=\s*0\s*)?;")?,
            access: Regex::new(r"\b(?:public|private|protected)\s*:")?,
            singleton: Regex::new(
                r"static[^;{]*\b(?:getInstance|instance|get_instance|sharedInstance)\s*\(",
            )?,
            loop_kw: Regex::new(r"\b(?:for|while)\b")?,
            branch_kw: Regex::new(r"\b(?:if|case|catch)\b")?,
            logical: Regex::new(r"&&|\|\|")?,
            io_call: Regex::new(
                r"\b(?:printf|scanf|puts|gets|fopen|fread|fwrite|fprintf|fscanf|fgets|cout|cin|cerr|getline|ifstream|ofstream|System\.out|System\.in|Scanner|BufferedReader|FileReader|FileWriter|InputStream|OutputStream)\b",
            )?,
            io_name: Regex::new(r"(?i)(?:read|write|load|save|print|send|recv|fetch|open|parse)")?,
            new_alloc: Regex::new(r"\bnew\s+([A-Za-z_][\w:]*)")?,
            c_alloc: Regex::new(r"\b(malloc|calloc|realloc|strdup)\s*\(")?,
            delete: Regex::new(r"\bdelete\s*(?:\[\s*\])?\s*([A-Za-z_]\w*)")?,
            free: Regex::new(r"\bfree\s*\(\s*([A-Za-z_]\w*)")?,
            raw_pointer: Regex::new(
                r"^\s*(?:const\s+)?[A-Za-z_][\w:<>]*\s*\*+\s*([A-Za-z_]\w*)\s*(?:=|;|\[)",
            )?,
            file_handle: Regex::new(
                r"\b(fopen|ifstream|ofstream|fstream|FileReader|FileWriter|FileInputStream|FileOutputStream|RandomAccessFile|Socket)\b",
            )?,
            lock: Regex::new(
                r"\b(pthread_mutex_lock|lock_guard|unique_lock|std::mutex|ReentrantLock|synchronized)\b",
            )?,
        })
    }
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns::compile().ok()).as_ref()
}

const KEYWORDS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "else", "do", "sizeof", "new", "delete",
    "try",
];

const MODIFIERS: &[&str] = &[
    "static", "inline", "virtual", "public", "private", "protected", "final", "synchronized",
    "explicit", "extern", "abstract", "override", "constexpr",
];

/// Scans `text`; line numbers start at `first_line`.
pub fn scan(text: &str, language: SourceLanguage, first_line: usize) -> LexicalScan {
    let mut result = LexicalScan {
        line_count: text.lines().count(),
        ..Default::default()
    };
    let Some(p) = patterns() else {
        return result;
    };

    result.includes = text
        .lines()
        .filter_map(|line| p.include.captures(line))
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().to_string())
        .fold(Vec::new(), push_unique);

    let code = strip(p, text);

    let regions: Vec<(String, usize, usize)> = p
        .class
        .captures_iter(&code)
        .filter_map(|c| {
            let name = c.get(1)?.as_str().to_string();
            let open = c.get(0)?.end() - 1;
            let close = open + find_matching_brace(&code[open..])?;
            Some((name, open, close))
        })
        .collect();

    result.functions = scan_functions(p, &code, &regions);

    result.classes = regions
        .iter()
        .map(|(name, open, close)| {
            let body = &code[*open..=*close];
            let outline = top_level(body);
            let mut methods: Vec<String> = result
                .functions
                .iter()
                .filter(|f| f.owner.as_deref() == Some(name.as_str()))
                .map(|f| f.name.clone())
                .collect();
            for caps in p.declaration.captures_iter(&outline) {
                if let Some(m) = caps.get(1) {
                    let method = m.as_str().to_string();
                    if !KEYWORDS.contains(&method.as_str()) && !methods.contains(&method) {
                        methods.push(method);
                    }
                }
            }
            ClassInfo {
                name: name.clone(),
                methods,
                fields: class_fields(p, &outline),
                is_singleton: p.singleton.is_match(body),
            }
        })
        .fold(Vec::new(), |mut acc: Vec<ClassInfo>, class| {
            if !acc.iter().any(|c| c.name == class.name) {
                acc.push(class);
            }
            acc
        });

    for (i, line) in code.lines().enumerate() {
        collect_resources(p, line, first_line + i, language, &mut result.resource_patterns);
    }

    result.control_flow = control_flow(p, &code);
    result
}

fn push_unique(mut acc: Vec<String>, item: String) -> Vec<String> {
    if !acc.contains(&item) {
        acc.push(item);
    }
    acc
}

/// Blanks comments and literals, keeping line structure.
fn strip(p: &Patterns, text: &str) -> String {
    p.strip
        .replace_all(text, |caps: &Captures| {
            let m = caps.get(0).map(|m| m.as_str()).unwrap_or("");
            if m.starts_with('"') {
                "\"\"".to_string()
            } else if m.starts_with('\'') {
                "' '".to_string()
            } else {
                m.chars().filter(|&c| c == '\n').collect()
            }
        })
        .into_owned()
}

fn scan_functions(p: &Patterns, code: &str, regions: &[(String, usize, usize)]) -> Vec<FunctionInfo> {
    let mut functions: Vec<FunctionInfo> = Vec::new();

    for caps in p.function.captures_iter(code) {
        let (Some(whole), Some(prefix), Some(name), Some(params)) =
            (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
        else {
            continue;
        };

        let qualified = name.as_str();
        let (owner, name) = match qualified.rsplit_once("::") {
            Some((owner, name)) => (Some(owner.to_string()), name.to_string()),
            None => {
                let owner = regions
                    .iter()
                    .filter(|(_, open, close)| *open < whole.start() && whole.start() < *close)
                    .max_by_key(|(_, open, _)| *open)
                    .map(|(class, _, _)| class.clone());
                (owner, qualified.to_string())
            }
        };
        if KEYWORDS.contains(&name.as_str()) {
            continue;
        }

        let prefix_words: Vec<&str> = prefix.as_str().split_whitespace().collect();
        if prefix_words.iter().any(|w| KEYWORDS.contains(w) || *w == "else") {
            continue;
        }
        let return_type = prefix_words
            .iter()
            .filter(|w| !MODIFIERS.contains(w))
            .copied()
            .collect::<Vec<_>>()
            .join(" ");

        let open = whole.end() - 1;
        let body = find_matching_brace(&code[open..])
            .map(|close| &code[open..=open + close])
            .unwrap_or("");

        let params: Vec<String> = params
            .as_str()
            .split(',')
            .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|s| !s.is_empty() && s != "void")
            .collect();

        let info = FunctionInfo {
            performs_io: p.io_call.is_match(body) || p.io_name.is_match(&name),
            loop_count: p.loop_kw.find_iter(body).count(),
            return_type: (!return_type.is_empty()).then_some(return_type),
            params,
            owner,
            name,
        };

        if !functions
            .iter()
            .any(|f| f.name == info.name && f.owner == info.owner)
        {
            functions.push(info);
        }
    }

    functions
}

/// Text of a braced block at nesting depth one, with nested blocks
/// collapsed to `;`.
fn top_level(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut depth = 0usize;
    for c in body.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 1 {
                    out.push(';');
                }
            }
            _ if depth == 1 => out.push(c),
            _ => {}
        }
    }
    out
}

fn class_fields(p: &Patterns, outline: &str) -> Vec<String> {
    let cleaned = p.access.replace_all(outline, " ");
    cleaned
        .split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty())
        .filter(|stmt| {
            let first = stmt.split_whitespace().next().unwrap_or("");
            !matches!(first, "using" | "friend" | "typedef" | "return" | "enum")
        })
        .filter_map(|stmt| {
            let decl = stmt.split('=').next().unwrap_or(stmt).trim();
            if decl.contains('(') || decl.split_whitespace().count() < 2 {
                return None;
            }
            let name: String = decl
                .rsplit(|c: char| !(c.is_alphanumeric() || c == '_'))
                .find(|s| !s.is_empty())?
                .to_string();
            Some(name)
        })
        .fold(Vec::new(), push_unique)
}

fn collect_resources(
    p: &Patterns,
    line: &str,
    line_no: usize,
    language: SourceLanguage,
    out: &mut Vec<ResourcePattern>,
) {
    let mut push = |kind: ResourceKind, symbol: &str| {
        out.push(ResourcePattern {
            kind,
            symbol: symbol.to_string(),
            line: line_no,
        })
    };

    if language == SourceLanguage::Cpp {
        for c in p.new_alloc.captures_iter(line) {
            if let Some(m) = c.get(1) {
                push(ResourceKind::ManualAllocation, m.as_str());
            }
        }
        for c in p.c_alloc.captures_iter(line) {
            if let Some(m) = c.get(1) {
                push(ResourceKind::ManualAllocation, m.as_str());
            }
        }
        for c in p.delete.captures_iter(line) {
            if let Some(m) = c.get(1) {
                push(ResourceKind::ManualRelease, m.as_str());
            }
        }
        for c in p.free.captures_iter(line) {
            if let Some(m) = c.get(1) {
                push(ResourceKind::ManualRelease, m.as_str());
            }
        }
        if let Some(m) = p.raw_pointer.captures(line).and_then(|c| c.get(1)) {
            if !KEYWORDS.contains(&m.as_str()) {
                push(ResourceKind::RawPointer, m.as_str());
            }
        }
    }

    if let Some(m) = p.file_handle.captures(line).and_then(|c| c.get(1)) {
        push(ResourceKind::FileHandle, m.as_str());
    }
    if let Some(m) = p.lock.captures(line).and_then(|c| c.get(1)) {
        push(ResourceKind::Lock, m.as_str());
    }
}

fn control_flow(p: &Patterns, code: &str) -> ControlFlow {
    let loops = p.loop_kw.find_iter(code).count();
    let branches = p.branch_kw.find_iter(code).count();
    let logical = p.logical.find_iter(code).count();

    let mut depth = 0usize;
    let mut max_nesting = 0usize;
    for c in code.chars() {
        match c {
            '{' => {
                depth += 1;
                max_nesting = max_nesting.max(depth);
            }
            '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }

    ControlFlow {
        branches,
        loops,
        max_nesting,
        cyclomatic_complexity: 1 + branches + loops + logical,
    }
}
