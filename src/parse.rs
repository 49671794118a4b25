use tree_sitter::{Node, Parser};

use crate::Language;

/// Byte span of one named function/method in a source file.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSpan {
    pub name: String,
    pub start_byte: usize,
    pub end_byte: usize,
}

fn grammar(lang: Language) -> tree_sitter::Language {
    match lang {
        Language::Python => tree_sitter_python::LANGUAGE.into(),
        Language::Rust => tree_sitter_rust::LANGUAGE.into(),
        Language::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
        Language::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        Language::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
    }
}

fn is_function_kind(lang: Language, kind: &str) -> bool {
    match lang {
        Language::Python => kind == "function_definition",
        Language::Rust => kind == "function_item",
        Language::JavaScript | Language::TypeScript | Language::Tsx => matches!(
            kind,
            "function_declaration" | "generator_function_declaration" | "method_definition"
        ),
    }
}

fn node_text<'a>(node: Node<'a>, source: &'a str) -> &'a str {
    &source[node.start_byte()..node.end_byte()]
}

/// List named function/method spans. Nested functions are not listed
/// separately; they belong to their enclosing method's span.
pub fn list_methods(source: &str, lang: Language) -> Vec<MethodSpan> {
    let mut parser = Parser::new();
    parser
        .set_language(&grammar(lang))
        .expect("failed to set grammar");
    let Some(tree) = parser.parse(source, None) else {
        return Vec::new();
    };
    let mut spans = Vec::new();
    collect_methods(tree.root_node(), source, lang, &mut spans);
    spans
}

fn collect_methods(node: Node, source: &str, lang: Language, spans: &mut Vec<MethodSpan>) {
    if is_function_kind(lang, node.kind()) {
        if let Some(name_node) = node.child_by_field_name("name") {
            spans.push(MethodSpan {
                name: node_text(name_node, source).to_string(),
                start_byte: node.start_byte(),
                end_byte: node.end_byte(),
            });
        }
        return; // nested functions stay inside their parent's span
    }
    let count = node.child_count();
    for i in 0..count {
        if let Some(child) = node.child(i) {
            collect_methods(child, source, lang, spans);
        }
    }
}

pub fn method_names(source: &str, lang: Language) -> Vec<String> {
    list_methods(source, lang).into_iter().map(|s| s.name).collect()
}

pub fn extract_method(source: &str, lang: Language, name: &str) -> Option<String> {
    list_methods(source, lang)
        .into_iter()
        .find(|s| s.name == name)
        .map(|s| source[s.start_byte..s.end_byte].to_string())
}

/// Widen a span to whole lines so splicing does not leave dangling
/// indentation or join adjacent definitions.
fn line_bounds(source: &str, span: &MethodSpan) -> (usize, usize) {
    let start = source[..span.start_byte]
        .rfind('\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    let end = source[span.end_byte..]
        .find('\n')
        .map(|i| span.end_byte + i + 1)
        .unwrap_or(source.len());
    (start, end)
}

/// Remove the named methods, splicing out their whole-line spans.
pub fn remove_methods(source: &str, lang: Language, names: &[String]) -> String {
    let mut doomed: Vec<(usize, usize)> = list_methods(source, lang)
        .iter()
        .filter(|s| names.iter().any(|n| n == &s.name))
        .map(|s| line_bounds(source, s))
        .collect();
    doomed.sort();
    let mut out = String::with_capacity(source.len());
    let mut cursor = 0;
    for (start, end) in doomed {
        if start > cursor {
            out.push_str(&source[cursor..start]);
        }
        cursor = cursor.max(end);
    }
    out.push_str(&source[cursor..]);
    out
}

/// Keep only the named method, removing every other one. Non-method
/// scaffolding (imports, helpers) is preserved.
pub fn keep_only_method(source: &str, lang: Language, name: &str) -> String {
    let others: Vec<String> = method_names(source, lang)
        .into_iter()
        .filter(|n| n != name)
        .collect();
    remove_methods(source, lang, &others)
}

/// Replace the named method's text with `body`. None if absent.
pub fn replace_method(source: &str, lang: Language, name: &str, body: &str) -> Option<String> {
    let span = list_methods(source, lang).into_iter().find(|s| s.name == name)?;
    let mut out = String::with_capacity(source.len() + body.len());
    out.push_str(&source[..span.start_byte]);
    out.push_str(body.trim_end_matches('\n'));
    out.push_str(&source[span.end_byte..]);
    Some(out)
}

/// Replace the named method if present, otherwise append the body at the
/// end of the file. Generated test classes are flat function collections,
/// so appending keeps them well-formed in every supported language.
pub fn merge_method(source: &str, lang: Language, name: &str, body: &str) -> String {
    if let Some(replaced) = replace_method(source, lang, name, body) {
        return replaced;
    }
    let mut out = source.trim_end_matches('\n').to_string();
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(body.trim_end_matches('\n'));
    out.push('\n');
    out
}
