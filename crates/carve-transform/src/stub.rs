//! Macro/Feature Stubber: replace configured `macro_rules!` bodies and
//! modules with inert versions so kept crates stop needing what they pulled in.
//!
//! Only call sites are left alone. A macro keeps every matcher, so existing
//! invocations still parse; each transcriber becomes the configured expansion.
//! An imported crate gets a local module of the same name, so `use name::..`
//! resolves once the dependency is gone.

use crate::locations::CrateLocations;
use crate::scan::{code_mask, is_open, line_indent, line_start, matching_delimiter, skip_trivia};
use carve_core::config::{StubKind, StubTarget};
use carve_core::{CarveError, Result};
use rayon::prelude::*;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// New contents for one source file.
#[derive(Debug, Clone, Serialize)]
pub struct StubEdit {
    pub path: PathBuf,
    pub crate_name: String,
    pub targets: BTreeSet<String>,
    #[serde(skip)]
    pub contents: String,
}

#[derive(Debug, Default)]
pub struct StubPlan {
    pub edits: Vec<StubEdit>,
    /// One soft `StubTargetNotFound` per target that matched nothing usable.
    pub missing: Vec<CarveError>,
    /// Crate name → dependency keys to drop from its manifest.
    pub dropped_dependencies: BTreeMap<String, BTreeSet<String>>,
}

impl StubPlan {
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty() && self.dropped_dependencies.is_empty()
    }

    /// Write every edit under `root`. Returns the paths written.
    pub fn apply(&self, root: &Path) -> Result<Vec<PathBuf>> {
        for edit in &self.edits {
            crate::write_atomic(&root.join(&edit.path), &edit.contents)?;
            tracing::debug!("stubbed {:?} in {}", edit.targets, edit.path.display());
        }
        Ok(self.edits.iter().map(|e| e.path.clone()).collect())
    }
}

/// What one scan of one file found for one target.
#[derive(Debug)]
enum Finding {
    Stubbed,
    Unparseable(String),
    ModuleFile(PathBuf),
}

struct FileScan {
    path: PathBuf,
    crate_name: String,
    original: String,
    rewritten: String,
    findings: Vec<(usize, Finding)>,
}

struct Patterns {
    macros: Vec<Option<Regex>>,
    modules: Vec<Option<Regex>>,
    imports: Vec<Option<Regex>>,
}

impl Patterns {
    fn compile(targets: &[StubTarget]) -> Result<Self> {
        let compile = |pattern: String| {
            Regex::new(&pattern).map_err(|e| CarveError::Config(format!("stub pattern: {e}")))
        };
        let mut macros = Vec::new();
        let mut modules = Vec::new();
        let mut imports = Vec::new();
        for target in targets {
            let name = regex::escape(&target.name);
            let module = || compile(format!(r"\bmod\s+{name}\s*([;{{])"));
            match target.kind {
                StubKind::Macro => {
                    macros.push(Some(compile(format!(r"macro_rules!\s*{name}\b"))?));
                    modules.push(None);
                    imports.push(None);
                }
                StubKind::Module => {
                    macros.push(None);
                    modules.push(Some(module()?));
                    imports.push(None);
                }
                // A module inserted on an earlier run is refreshed in place.
                StubKind::Import => {
                    macros.push(None);
                    modules.push(Some(module()?));
                    imports.push(Some(compile(format!(r"\buse\s+{name}\s*::"))?));
                }
            }
        }
        Ok(Self {
            macros,
            modules,
            imports,
        })
    }
}

/// Plan stubs for `targets` across every `.rs` file of the crates in `locations`.
pub fn plan_stubs(root: &Path, locations: &CrateLocations, targets: &[StubTarget]) -> Result<StubPlan> {
    build_plan(root, locations, targets, true)
}

/// Crate name → dependency keys the stubs would drop, without logging misses.
/// Used to cut those edges before the closure is computed.
pub fn dropped_dependencies(
    root: &Path,
    locations: &CrateLocations,
    targets: &[StubTarget],
) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let dropping: Vec<StubTarget> = targets
        .iter()
        .filter(|t| !t.drop_dependencies.is_empty())
        .cloned()
        .collect();
    Ok(build_plan(root, locations, &dropping, false)?.dropped_dependencies)
}

fn build_plan(root: &Path, locations: &CrateLocations, targets: &[StubTarget], log: bool) -> Result<StubPlan> {
    if targets.is_empty() {
        return Ok(StubPlan::default());
    }
    let patterns = Patterns::compile(targets)?;
    let files = source_files(root, locations);
    tracing::debug!("scanning {} source files for {} stub targets", files.len(), targets.len());

    let scans = files
        .par_iter()
        .map(|(path, crate_name)| scan_file(root, path, crate_name, targets, &patterns))
        .collect::<Result<Vec<_>>>()?;

    let mut found_in: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
    let mut problems: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let mut edits: BTreeMap<PathBuf, StubEdit> = BTreeMap::new();
    let mut module_files: Vec<(usize, String, PathBuf)> = Vec::new();

    for scan in &scans {
        for (idx, finding) in &scan.findings {
            match finding {
                Finding::Stubbed => {
                    found_in.entry(*idx).or_default().insert(scan.crate_name.clone());
                }
                Finding::Unparseable(reason) => {
                    problems.entry(*idx).or_default().push(reason.clone());
                }
                Finding::ModuleFile(file) => {
                    module_files.push((*idx, scan.crate_name.clone(), file.clone()));
                }
            }
        }
        if scan.rewritten != scan.original {
            let targets_hit = scan
                .findings
                .iter()
                .filter(|(_, f)| matches!(f, Finding::Stubbed))
                .map(|(idx, _)| targets[*idx].name.clone())
                .collect();
            edits.insert(
                scan.path.clone(),
                StubEdit {
                    path: scan.path.clone(),
                    crate_name: scan.crate_name.clone(),
                    targets: targets_hit,
                    contents: scan.rewritten.clone(),
                },
            );
        }
    }

    // Whole-file module replacements win over any edit planned for that file.
    for (idx, crate_name, file) in module_files {
        let target = &targets[idx];
        let contents = module_source(target.replacement.as_deref().unwrap_or_default());
        let current = match scans.iter().find(|s| s.path == file) {
            Some(scan) => scan.original.clone(),
            None => read_source(root, &file)?,
        };
        found_in.entry(idx).or_default().insert(crate_name.clone());
        if current == contents {
            edits.remove(&file);
            continue;
        }
        let edit = edits.entry(file.clone()).or_insert_with(|| StubEdit {
            path: file.clone(),
            crate_name,
            targets: BTreeSet::new(),
            contents: String::new(),
        });
        edit.targets.insert(target.name.clone());
        edit.contents = contents;
    }

    let mut plan = StubPlan {
        edits: edits.into_values().collect(),
        ..StubPlan::default()
    };

    for (idx, target) in targets.iter().enumerate() {
        if let Some(scope) = &target.crate_name
            && locations.dir_of(scope).is_none()
        {
            tracing::debug!("stub `{}` skipped, `{scope}` is not kept", target.name);
            continue;
        }
        match found_in.get(&idx) {
            Some(crates) => {
                for reason in problems.get(&idx).into_iter().flatten().filter(|_| log) {
                    tracing::warn!("stub `{}` skipped one definition: {reason}", target.name);
                }
                for crate_name in crates {
                    for key in &target.drop_dependencies {
                        plan.dropped_dependencies
                            .entry(crate_name.clone())
                            .or_default()
                            .insert(key.clone());
                    }
                }
            }
            None => {
                let reason = match (problems.get(&idx), &target.crate_name) {
                    (Some(reasons), _) => reasons.join("; "),
                    (None, Some(scope)) => format!("nothing to stub in `{scope}`"),
                    (None, None) => "no definition in any kept crate".to_string(),
                };
                let warning = CarveError::StubTargetNotFound {
                    name: target.name.clone(),
                    reason,
                };
                if log {
                    tracing::warn!("{warning}");
                }
                plan.missing.push(warning);
            }
        }
    }
    Ok(plan)
}

fn read_source(root: &Path, rel: &Path) -> Result<String> {
    let full = root.join(rel);
    std::fs::read_to_string(&full).map_err(|e| CarveError::io(full, e))
}

/// Every `.rs` file under each crate's directory, attributed to the innermost
/// crate that contains it. Build output and VCS metadata are skipped.
fn source_files(root: &Path, locations: &CrateLocations) -> Vec<(PathBuf, String)> {
    let mut out = BTreeMap::new();
    for (name, dir) in locations.iter() {
        let walker = ignore::WalkBuilder::new(root.join(dir))
            .standard_filters(false)
            .filter_entry(|e| !matches!(e.file_name().to_str(), Some("target" | ".git")))
            .build();
        for entry in walker.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "rs") || !path.is_file() {
                continue;
            }
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            if locations.owner_of(rel) == Some(name) {
                out.insert(rel.to_path_buf(), name.to_string());
            }
        }
    }
    out.into_iter().collect()
}

fn scan_file(
    root: &Path,
    path: &Path,
    crate_name: &str,
    targets: &[StubTarget],
    patterns: &Patterns,
) -> Result<FileScan> {
    let original = read_source(root, path)?;
    let mut text = original.clone();
    let mut findings = Vec::new();

    for (idx, target) in targets.iter().enumerate() {
        if target.crate_name.as_deref().is_some_and(|c| c != crate_name) {
            continue;
        }
        if let Some(re) = &patterns.macros[idx] {
            let (next, outcome) = stub_macro(&text, re, target.expansion());
            text = next;
            findings.extend(outcome.into_iter().map(|f| (idx, f)));
        }
        if let Some(re) = &patterns.modules[idx] {
            let replacement = target.replacement.as_deref().unwrap_or_default();
            let (next, outcome) = stub_module(root, path, &text, re, &target.name, replacement);
            text = next;
            if !outcome.is_empty() {
                findings.extend(outcome.into_iter().map(|f| (idx, f)));
                continue;
            }
        }
        if let Some(re) = &patterns.imports[idx] {
            let replacement = target.replacement.as_deref().unwrap_or_default();
            let (next, outcome) = insert_import_stub(&text, re, &target.name, replacement);
            text = next;
            findings.extend(outcome.into_iter().map(|f| (idx, f)));
        }
    }

    Ok(FileScan {
        path: path.to_path_buf(),
        crate_name: crate_name.to_string(),
        original,
        rewritten: text,
        findings,
    })
}

/// Rewrite every `macro_rules!` definition matched by `re`.
fn stub_macro(src: &str, re: &Regex, expansion: &str) -> (String, Vec<Finding>) {
    let mask = code_mask(src);
    let mut out = src.to_string();
    let mut findings = Vec::new();

    // Back to front so earlier offsets stay valid in `out`.
    let matches: Vec<_> = re.find_iter(src).filter(|m| mask[m.start()]).collect();
    for m in matches.iter().rev() {
        let open = skip_trivia(src, m.end());
        let rules = matching_delimiter(src, open).and_then(|close| {
            parse_rules(&src[open + 1..close]).map(|rules| (close, rules))
        });
        let Some((close, rules)) = rules else {
            findings.push(Finding::Unparseable(format!(
                "`{}` at byte {} has no parseable rule list",
                m.as_str(),
                m.start()
            )));
            continue;
        };
        let body = render_rules(&rules, expansion, line_indent(src, m.start()));
        out.replace_range(open + 1..close, &body);
        findings.push(Finding::Stubbed);
    }
    (out, findings)
}

/// Matchers of a `macro_rules!` body: `(matcher) => {transcriber};` repeated.
fn parse_rules(body: &str) -> Option<Vec<&str>> {
    let b = body.as_bytes();
    let mut matchers = Vec::new();
    let mut i = skip_trivia(body, 0);
    while i < b.len() {
        if !is_open(b[i]) {
            return None;
        }
        let matcher_end = matching_delimiter(body, i)?;
        matchers.push(&body[i..=matcher_end]);

        i = skip_trivia(body, matcher_end + 1);
        if !body[i..].starts_with("=>") {
            return None;
        }
        i = skip_trivia(body, i + 2);
        if !b.get(i).copied().is_some_and(is_open) {
            return None;
        }
        let transcriber_end = matching_delimiter(body, i)?;
        i = skip_trivia(body, transcriber_end + 1);
        if b.get(i) == Some(&b';') {
            i = skip_trivia(body, i + 1);
        }
    }
    (!matchers.is_empty()).then_some(matchers)
}

fn render_rules(matchers: &[&str], expansion: &str, indent: &str) -> String {
    let expansion = expansion.trim();
    let transcriber = if expansion.is_empty() {
        "{}".to_string()
    } else {
        format!("{{ {expansion} }}")
    };
    let mut body = String::from("\n");
    for matcher in matchers {
        body.push_str(&format!("{indent}    {matcher} => {transcriber};\n"));
    }
    body.push_str(indent);
    body
}

/// Replace inline `mod name { .. }` bodies; report `mod name;` declarations
/// as the file that has to be replaced instead.
fn stub_module(
    root: &Path,
    path: &Path,
    src: &str,
    re: &Regex,
    name: &str,
    replacement: &str,
) -> (String, Vec<Finding>) {
    let mask = code_mask(src);
    let mut out = src.to_string();
    let mut findings = Vec::new();

    let decls: Vec<_> = re
        .captures_iter(src)
        .filter_map(|c| c.get(1))
        .filter(|m| mask[m.start()])
        .collect();
    for delim in decls.iter().rev() {
        if delim.as_str() == ";" {
            let candidates = module_file_candidates(path, name);
            match candidates.iter().find(|c| root.join(c).is_file()) {
                Some(file) => findings.push(Finding::ModuleFile(file.clone())),
                None => findings.push(Finding::Unparseable(format!(
                    "`mod {name};` in {} has no file at {}",
                    path.display(),
                    candidates
                        .iter()
                        .map(|c| c.display().to_string())
                        .collect::<Vec<_>>()
                        .join(" or ")
                ))),
            }
            continue;
        }
        let open = delim.start();
        let Some(close) = matching_delimiter(src, open) else {
            findings.push(Finding::Unparseable(format!(
                "`mod {name}` in {} has unbalanced braces",
                path.display()
            )));
            continue;
        };
        let indent = line_indent(src, open);
        out.replace_range(open + 1..close, &inline_body(replacement, indent));
        findings.push(Finding::Stubbed);
    }
    (out, findings)
}

/// Insert `mod name { replacement }` above the first `use name::..` in `src`,
/// ahead of any attributes on that import.
fn insert_import_stub(src: &str, re: &Regex, name: &str, replacement: &str) -> (String, Vec<Finding>) {
    let mask = code_mask(src);
    let Some(m) = re.find_iter(src).find(|m| mask[m.start()]) else {
        return (src.to_string(), Vec::new());
    };
    let mut at = line_start(src, m.start());
    while at > 0 {
        let prev = line_start(src, at - 1);
        if !src[prev..at].trim_start().starts_with("#[") {
            break;
        }
        at = prev;
    }
    let indent = line_indent(src, m.start());
    let item = format!("{indent}mod {name} {{{}}}\n", inline_body(replacement, indent));
    let mut out = src.to_string();
    out.insert_str(at, &item);
    (out, vec![Finding::Stubbed])
}

fn inline_body(replacement: &str, indent: &str) -> String {
    let mut body = String::from("\n");
    for line in replacement.trim_end().lines() {
        if !line.trim().is_empty() {
            body.push_str(indent);
            body.push_str("    ");
            body.push_str(line);
        }
        body.push('\n');
    }
    body.push_str(indent);
    body
}

fn module_source(replacement: &str) -> String {
    format!("{}\n", replacement.trim_end())
}

/// Where `mod name;` declared in `declaring` looks for its file.
fn module_file_candidates(declaring: &Path, name: &str) -> Vec<PathBuf> {
    let parent = declaring.parent().unwrap_or(Path::new(""));
    let file_name = declaring.file_name().and_then(|f| f.to_str()).unwrap_or_default();
    let in_target_dir = matches!(
        parent.file_name().and_then(|f| f.to_str()),
        Some("bin" | "examples" | "tests" | "benches")
    );
    let is_crate_root = in_target_dir || matches!(file_name, "lib.rs" | "main.rs" | "mod.rs" | "build.rs");
    let base = match declaring.file_stem() {
        Some(stem) if !is_crate_root => parent.join(stem),
        _ => parent.to_path_buf(),
    };
    vec![base.join(format!("{name}.rs")), base.join(name).join("mod.rs")]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn macro_re(name: &str) -> Regex {
        Regex::new(&format!(r"macro_rules!\s*{name}\b")).unwrap()
    }

    #[test]
    fn test_macro_keeps_matchers_and_replaces_transcribers() {
        let src = r#"#[macro_export]
macro_rules! actions {
    ($namespace:path, [ $($name:ident),* $(,)? ]) => {
        $(impl_actions!($namespace, $name);)*
    };
    () => { "}" };
}

fn main() { actions!(zed, [Open]); }
"#;
        let (out, findings) = stub_macro(src, &macro_re("actions"), "()");
        assert!(matches!(findings.as_slice(), [Finding::Stubbed]));
        let expected = r#"#[macro_export]
macro_rules! actions {
    ($namespace:path, [ $($name:ident),* $(,)? ]) => { () };
    () => { () };
}

fn main() { actions!(zed, [Open]); }
"#;
        assert_eq!(out, expected);
    }

    #[test]
    fn test_macro_stub_is_idempotent() {
        let src = "    macro_rules! m ( ($x:expr) => ($x + 1); );\n";
        let (once, _) = stub_macro(src, &macro_re("m"), "");
        let (twice, findings) = stub_macro(&once, &macro_re("m"), "");
        assert_eq!(once, twice);
        assert!(matches!(findings.as_slice(), [Finding::Stubbed]));
        assert!(once.contains("($x:expr) => {};"));
        assert!(once.trim_end().ends_with(");"));
    }

    #[test]
    fn test_macro_in_comment_or_string_is_ignored() {
        let src = "// macro_rules! m { () => {} }\nconst S: &str = \"macro_rules! m {}\";\n";
        let (out, findings) = stub_macro(src, &macro_re("m"), "()");
        assert_eq!(out, src);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_similar_macro_names_do_not_match() {
        let src = "macro_rules! my_macro_two { () => { 2 }; }\n";
        let (out, findings) = stub_macro(src, &macro_re("my_macro"), "()");
        assert_eq!(out, src);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_unparseable_macro_is_reported() {
        let src = "macro_rules! m { () => }\n";
        let (out, findings) = stub_macro(src, &macro_re("m"), "()");
        assert_eq!(out, src);
        assert!(matches!(findings.as_slice(), [Finding::Unparseable(_)]));
    }

    #[test]
    fn test_inline_module_body_is_replaced() {
        let re = Regex::new(r"\bmod\s+telemetry\s*([;{])").unwrap();
        let src = "pub mod telemetry {\n    pub fn send() { upload(); }\n}\n";
        let (out, findings) = stub_module(
            Path::new("/nonexistent"),
            Path::new("crates/a/src/lib.rs"),
            src,
            &re,
            "telemetry",
            "pub fn send() {}",
        );
        assert_eq!(out, "pub mod telemetry {\n    pub fn send() {}\n}\n");
        assert!(matches!(findings.as_slice(), [Finding::Stubbed]));
    }

    fn import_patterns(name: &str) -> (Regex, Regex) {
        (
            Regex::new(&format!(r"\bmod\s+{name}\s*([;{{])")).unwrap(),
            Regex::new(&format!(r"\buse\s+{name}\s*::")).unwrap(),
        )
    }

    #[test]
    fn test_import_gets_local_module() {
        let (_, use_re) = import_patterns("perf");
        let src = "use proc_macro::TokenStream;\n#[allow(unused)]\nuse perf::*;\n\nfn weight() -> u8 { consts::WEIGHT_DEFAULT }\n";
        let (out, findings) = insert_import_stub(src, &use_re, "perf", "pub mod consts {\n    pub const WEIGHT_DEFAULT: u8 = 0;\n}");
        assert!(matches!(findings.as_slice(), [Finding::Stubbed]));
        assert_eq!(
            out,
            "use proc_macro::TokenStream;\nmod perf {\n    pub mod consts {\n        pub const WEIGHT_DEFAULT: u8 = 0;\n    }\n}\n#[allow(unused)]\nuse perf::*;\n\nfn weight() -> u8 { consts::WEIGHT_DEFAULT }\n"
        );
    }

    #[test]
    fn test_import_stub_is_idempotent() {
        let (mod_re, use_re) = import_patterns("perf");
        let src = "use perf::Importance;\n";
        let (once, _) = insert_import_stub(src, &use_re, "perf", "pub enum Importance { Average }");
        let (twice, findings) = stub_module(
            Path::new("/nonexistent"),
            Path::new("crates/util_macros/src/util_macros.rs"),
            &once,
            &mod_re,
            "perf",
            "pub enum Importance { Average }",
        );
        assert_eq!(once, twice);
        assert!(matches!(findings.as_slice(), [Finding::Stubbed]));
    }

    #[test]
    fn test_import_in_comment_or_other_path_is_ignored() {
        let (_, use_re) = import_patterns("perf");
        let src = "// use perf::*;\nuse my_perf::X;\nuse crate::perf::Y;\n";
        let (out, findings) = insert_import_stub(src, &use_re, "perf", "");
        assert_eq!(out, src);
        assert!(findings.is_empty());
    }

    #[test]
    fn test_module_file_candidates() {
        assert_eq!(
            module_file_candidates(Path::new("crates/a/src/lib.rs"), "net"),
            vec![
                PathBuf::from("crates/a/src/net.rs"),
                PathBuf::from("crates/a/src/net/mod.rs")
            ]
        );
        assert_eq!(
            module_file_candidates(Path::new("crates/a/src/platform.rs"), "mac"),
            vec![
                PathBuf::from("crates/a/src/platform/mac.rs"),
                PathBuf::from("crates/a/src/platform/mac/mod.rs")
            ]
        );
    }
}
