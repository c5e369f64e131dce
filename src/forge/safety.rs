//! Static rejection of generated code: pattern rules, import allow-list,
//! and shape checks.

use crate::forge::python::PythonRuntime;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::LazyLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyIssue {
    pub severity: Severity,
    pub category: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SafetyReport {
    pub passed: bool,
    pub tool_name: String,
    pub issues: Vec<SafetyIssue>,
}

impl SafetyReport {
    pub fn summary(&self) -> Value {
        json!({
            "passed": self.passed,
            "tool_name": self.tool_name,
            "issue_count": self.issues.len(),
            "issues": self.issues,
        })
    }

    /// Issue messages joined for retry feedback.
    pub fn issue_text(&self) -> String {
        self.issues
            .iter()
            .map(|i| i.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Literal patterns a generated tool may never contain.
const FORBIDDEN_PATTERNS: &[&str] = &[
    r"os\.system",
    r"subprocess\.",
    r"eval\(",
    r"exec\(",
    r"__import__\(",
    r"open\(.*/etc/",
    r"shutil\.rmtree",
    r"requests\.get\(.*localhost",
    r"socket\.",
    r"ctypes\.",
];

/// Modules a generated tool may import. Prefix match (`urllib.parse`
/// admits `urllib.parse.quote`).
const ALLOWED_IMPORTS: &[&str] = &[
    "httpx",
    "aiohttp",
    "json",
    "re",
    "datetime",
    "pathlib",
    "typing",
    "pydantic",
    "os",
    "math",
    "collections",
    "itertools",
    "functools",
    "hashlib",
    "base64",
    "urllib.parse",
    "html",
    "textwrap",
    "dataclasses",
    "adjutant_skill",
];

pub struct CodeSafetyChecker {
    forbidden: Vec<(String, Regex)>,
    allowed_imports: Vec<String>,
    import_stmt: Regex,
    from_stmt: Regex,
    decorator_stmt: Regex,
    python: PythonRuntime,
}

impl CodeSafetyChecker {
    pub fn new(python: PythonRuntime) -> Self {
        let forbidden = FORBIDDEN_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok().map(|r| ((*p).to_string(), r)))
            .collect();
        Self {
            forbidden,
            allowed_imports: ALLOWED_IMPORTS.iter().map(|s| s.to_string()).collect(),
            import_stmt: Regex::new(r"^\s*import\s+(.+)$").expect("import pattern"),
            from_stmt: Regex::new(r"^\s*from\s+([\w.]+)\s+import\b").expect("from pattern"),
            decorator_stmt: Regex::new(r"^\s*@tool\b").expect("decorator pattern"),
            python,
        }
    }

    /// Run the six passes in order. Passes after syntax are skipped when the
    /// source does not parse. Passed ⇔ no high-severity issue.
    pub async fn check(&self, code: &str, tool_name: &str) -> SafetyReport {
        let mut issues = Vec::new();

        match self.python.check_syntax(code).await {
            Ok(verdict) if verdict.ok => {}
            Ok(verdict) => {
                issues.push(SafetyIssue {
                    severity: Severity::High,
                    category: "syntax".into(),
                    message: format!("syntax error: {}", verdict.msg.unwrap_or_default()),
                    line: verdict.line,
                });
                return SafetyReport {
                    passed: false,
                    tool_name: tool_name.to_string(),
                    issues,
                };
            }
            Err(e) => {
                // without a parser the bundle could never run anyway
                issues.push(SafetyIssue {
                    severity: Severity::High,
                    category: "syntax".into(),
                    message: format!("syntax check unavailable: {}", e),
                    line: None,
                });
                return SafetyReport {
                    passed: false,
                    tool_name: tool_name.to_string(),
                    issues,
                };
            }
        }

        issues.extend(self.check_forbidden_patterns(code));
        issues.extend(self.check_imports(code));
        issues.extend(self.check_type_hints(code));
        issues.extend(self.check_decorator(code));
        issues.extend(self.check_async(code));

        let passed = !issues.iter().any(|i| i.severity == Severity::High);
        info!(tool_name, passed, issue_count = issues.len(), "code safety check");
        SafetyReport {
            passed,
            tool_name: tool_name.to_string(),
            issues,
        }
    }

    fn check_forbidden_patterns(&self, code: &str) -> Vec<SafetyIssue> {
        let mut issues = Vec::new();
        for (lineno, line) in code.lines().enumerate() {
            if line.trim_start().starts_with('#') {
                continue;
            }
            for (pattern, regex) in &self.forbidden {
                if regex.is_match(line) {
                    issues.push(SafetyIssue {
                        severity: Severity::High,
                        category: "forbidden_pattern".into(),
                        message: format!("forbidden pattern: {}", pattern),
                        line: Some(lineno + 1),
                    });
                }
            }
        }
        issues
    }

    fn is_allowed_import(&self, module: &str) -> bool {
        self.allowed_imports
            .iter()
            .any(|allowed| module == allowed || module.starts_with(&format!("{}.", allowed)))
    }

    fn check_imports(&self, code: &str) -> Vec<SafetyIssue> {
        let mut issues = Vec::new();
        for (lineno, line) in code.lines().enumerate() {
            if line.trim_start().starts_with('#') {
                continue;
            }
            if let Some(caps) = self.from_stmt.captures(line) {
                let module = &caps[1];
                if !self.is_allowed_import(module) {
                    issues.push(SafetyIssue {
                        severity: Severity::High,
                        category: "import".into(),
                        message: format!("disallowed import: {}", module),
                        line: Some(lineno + 1),
                    });
                }
            } else if let Some(caps) = self.import_stmt.captures(line) {
                // `import a, b as c` lists several modules on one line
                for part in caps[1].split(',') {
                    let module = part.trim().split_whitespace().next().unwrap_or("");
                    if module.is_empty() {
                        continue;
                    }
                    if !self.is_allowed_import(module) {
                        issues.push(SafetyIssue {
                            severity: Severity::High,
                            category: "import".into(),
                            message: format!("disallowed import: {}", module),
                            line: Some(lineno + 1),
                        });
                    }
                }
            }
        }
        issues
    }

    fn check_type_hints(&self, code: &str) -> Vec<SafetyIssue> {
        def_headers(code)
            .into_iter()
            .filter(|h| !h.header.contains("->"))
            .map(|h| SafetyIssue {
                severity: Severity::Medium,
                category: "type_hint".into(),
                message: format!("function '{}' has no return annotation", h.name),
                line: Some(h.line),
            })
            .collect()
    }

    fn check_decorator(&self, code: &str) -> Vec<SafetyIssue> {
        let has_marker = code.lines().any(|line| self.decorator_stmt.is_match(line));
        if has_marker {
            vec![]
        } else {
            vec![SafetyIssue {
                severity: Severity::Medium,
                category: "decorator".into(),
                message: "no function carries the @tool marker".into(),
                line: None,
            }]
        }
    }

    fn check_async(&self, code: &str) -> Vec<SafetyIssue> {
        let has_async = def_headers(code).iter().any(|h| h.is_async);
        if has_async {
            vec![]
        } else {
            vec![SafetyIssue {
                severity: Severity::Low,
                category: "async".into(),
                message: "no async function defined; async def is preferred".into(),
                line: None,
            }]
        }
    }
}

struct DefHeader {
    name: String,
    line: usize,
    /// Full header text from `def` through the terminating `:`.
    header: String,
    is_async: bool,
}

/// Collect `def`/`async def` headers, following multi-line parameter lists
/// to the closing `:` at paren depth zero.
fn def_headers(code: &str) -> Vec<DefHeader> {
    static DEF_START: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*(async\s+)?def\s+(\w+)\s*\(").expect("def pattern"));

    let lines: Vec<&str> = code.lines().collect();
    let mut headers = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if let Some(caps) = DEF_START.captures(line) {
            let is_async = caps.get(1).is_some();
            let name = caps[2].to_string();
            let start_line = i;
            let mut header = String::new();
            let mut depth = 0i32;
            let mut done = false;
            while i < lines.len() && !done {
                let current = lines[i];
                header.push_str(current);
                header.push(' ');
                for (pos, ch) in current.char_indices() {
                    match ch {
                        '(' | '[' | '{' => depth += 1,
                        ')' | ']' | '}' => depth -= 1,
                        ':' if depth == 0 => {
                            // only the header-terminating colon counts;
                            // ignore annotation colons inside parens
                            if i > start_line || pos > current.find('(').unwrap_or(0) {
                                done = true;
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                i += 1;
            }
            headers.push(DefHeader {
                name,
                line: start_line + 1,
                header,
                is_async,
            });
        } else {
            i += 1;
        }
    }
    headers
}
