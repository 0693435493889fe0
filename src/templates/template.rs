use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Number;

use super::context::{TemplateContext, TemplateValue};
use super::TemplateError;

/// `{{ expr }}`, `{% stmt %}` and `{# comment #}`, non-greedy so adjacent tags
/// stay separate. Quoted literals inside `{{ }}` are consumed whole, so a
/// default may contain `}}`.
static TAG_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)\{\{((?:"[^"]*"|'[^']*'|[^"'])*?)\}\}|\{%(.*?)%\}|\{#(.*?)#\}"#).unwrap()
});

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Variable {
        name: String,
        default: Option<TemplateValue>,
    },
    Conditional {
        guard: String,
        negated: bool,
        then_branch: Vec<Node>,
        else_branch: Vec<Node>,
    },
}

/// A parsed prompt template.
///
/// Parsing happens once when configuration is loaded; the result is immutable
/// and can be rendered any number of times, from any number of tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    source: String,
    nodes: Vec<Node>,
}

impl PromptTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut builder = TreeBuilder::default();
        let mut cursor = 0;

        for caps in TAG_PATTERN.captures_iter(source) {
            let Some(whole) = caps.get(0) else { continue };
            builder.text(&source[cursor..whole.start()], cursor)?;

            if let Some(expr) = caps.get(1) {
                builder.push(parse_expression(expr.as_str(), whole.start())?);
            } else if let Some(stmt) = caps.get(2) {
                builder.statement(stmt.as_str(), whole.start())?;
            }

            cursor = whole.end();
        }
        builder.text(&source[cursor..], cursor)?;

        Ok(Self {
            source: source.to_string(),
            nodes: builder.finish()?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// A template with no tags renders to its own source.
    pub fn is_literal(&self) -> bool {
        self.nodes.iter().all(|node| matches!(node, Node::Text(_)))
    }

    pub fn render(&self, context: &TemplateContext) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        render_nodes(&self.nodes, context, &mut out)?;
        Ok(out)
    }

    /// Every variable name the template reads, interpolated or as a guard.
    pub fn variables(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        collect_variables(&self.nodes, &mut names);
        names.into_iter().collect()
    }
}

/// Renders `template` against `context`.
pub fn render(template: &PromptTemplate, context: &TemplateContext) -> Result<String, TemplateError> {
    template.render(context)
}

fn render_nodes(
    nodes: &[Node],
    context: &TemplateContext,
    out: &mut String,
) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Variable { name, default } => {
                let value = context
                    .get(name)
                    .or(default.as_ref())
                    .ok_or_else(|| TemplateError::UndefinedVariable { name: name.clone() })?;
                out.push_str(&value.to_string());
            }
            Node::Conditional {
                guard,
                negated,
                then_branch,
                else_branch,
            } => {
                let truthy = context.get(guard).map(TemplateValue::is_truthy).unwrap_or(false);
                if truthy != *negated {
                    render_nodes(then_branch, context, out)?;
                } else {
                    render_nodes(else_branch, context, out)?;
                }
            }
        }
    }
    Ok(())
}

fn collect_variables(nodes: &[Node], names: &mut BTreeSet<String>) {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Variable { name, .. } => {
                names.insert(name.clone());
            }
            Node::Conditional {
                guard,
                then_branch,
                else_branch,
                ..
            } => {
                names.insert(guard.clone());
                collect_variables(then_branch, names);
                collect_variables(else_branch, names);
            }
        }
    }
}

#[derive(Debug)]
struct OpenBlock {
    guard: String,
    negated: bool,
    offset: usize,
    then_branch: Vec<Node>,
    else_branch: Option<Vec<Node>>,
}

#[derive(Debug, Default)]
struct TreeBuilder {
    root: Vec<Node>,
    open: Vec<OpenBlock>,
}

impl TreeBuilder {
    fn current(&mut self) -> &mut Vec<Node> {
        match self.open.last_mut() {
            Some(block) => match block.else_branch.as_mut() {
                Some(else_branch) => else_branch,
                None => &mut block.then_branch,
            },
            None => &mut self.root,
        }
    }

    fn push(&mut self, node: Node) {
        self.current().push(node);
    }

    fn text(&mut self, text: &str, offset: usize) -> Result<(), TemplateError> {
        if text.is_empty() {
            return Ok(());
        }
        for opener in ["{{", "{%", "{#"] {
            if let Some(pos) = text.find(opener) {
                return Err(malformed(offset + pos, format!("unterminated `{}` tag", opener)));
            }
        }
        self.push(Node::Text(text.to_string()));
        Ok(())
    }

    fn statement(&mut self, body: &str, offset: usize) -> Result<(), TemplateError> {
        let words: Vec<&str> = body.split_whitespace().collect();
        match words.as_slice() {
            ["if", name] => self.open_block(name, false, offset),
            ["if", "not", name] => self.open_block(name, true, offset),
            ["else"] => {
                let block = self
                    .open
                    .last_mut()
                    .ok_or_else(|| malformed(offset, "`else` without a matching `if`"))?;
                if block.else_branch.is_some() {
                    return Err(malformed(offset, "duplicate `else` in the same `if` block"));
                }
                block.else_branch = Some(Vec::new());
                Ok(())
            }
            ["endif"] => {
                let block = self
                    .open
                    .pop()
                    .ok_or_else(|| malformed(offset, "`endif` without a matching `if`"))?;
                self.push(Node::Conditional {
                    guard: block.guard,
                    negated: block.negated,
                    then_branch: block.then_branch,
                    else_branch: block.else_branch.unwrap_or_default(),
                });
                Ok(())
            }
            _ => Err(malformed(offset, format!("unsupported tag `{{% {} %}}`", body.trim()))),
        }
    }

    fn open_block(&mut self, name: &str, negated: bool, offset: usize) -> Result<(), TemplateError> {
        check_identifier(name, offset)?;
        self.open.push(OpenBlock {
            guard: name.to_string(),
            negated,
            offset,
            then_branch: Vec::new(),
            else_branch: None,
        });
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<Node>, TemplateError> {
        if let Some(block) = self.open.pop() {
            return Err(malformed(
                block.offset,
                format!("`if {}` block is never closed with `endif`", block.guard),
            ));
        }
        Ok(self.root)
    }
}

fn parse_expression(body: &str, offset: usize) -> Result<Node, TemplateError> {
    let (name, filter) = match body.split_once('|') {
        Some((name, filter)) => (name.trim(), Some(filter.trim())),
        None => (body.trim(), None),
    };
    check_identifier(name, offset)?;

    let default = match filter {
        None => None,
        Some(filter) => Some(parse_default_filter(filter, offset)?),
    };

    Ok(Node::Variable {
        name: name.to_string(),
        default,
    })
}

fn parse_default_filter(filter: &str, offset: usize) -> Result<TemplateValue, TemplateError> {
    let arg = filter
        .strip_prefix("default")
        .map(str::trim_start)
        .and_then(|rest| rest.strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| malformed(offset, format!("unsupported filter `{}`", filter)))?
        .trim();

    let arg = match arg.strip_prefix("value") {
        Some(rest) if rest.trim_start().starts_with('=') => rest.trim_start()[1..].trim(),
        _ => arg,
    };

    parse_literal(arg).ok_or_else(|| {
        malformed(
            offset,
            format!("default value `{}` must be a string, number or boolean literal", arg),
        )
    })
}

fn parse_literal(text: &str) -> Option<TemplateValue> {
    for quote in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return Some(TemplateValue::String(text[1..text.len() - 1].to_string()));
        }
    }
    match text {
        "true" => Some(TemplateValue::Bool(true)),
        "false" => Some(TemplateValue::Bool(false)),
        _ => serde_json::from_str::<Number>(text).ok().map(TemplateValue::Number),
    }
}

fn check_identifier(name: &str, offset: usize) -> Result<(), TemplateError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else if name.is_empty() {
        Err(malformed(offset, "empty variable name"))
    } else {
        Err(malformed(
            offset,
            format!("invalid variable name `{}` (use letters, digits and underscore)", name),
        ))
    }
}

fn malformed(offset: usize, reason: impl Into<String>) -> TemplateError {
    TemplateError::MalformedTemplate {
        offset,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        TemplateContext::new()
    }

    #[test]
    fn test_literal_template() {
        let template = PromptTemplate::parse("You are a helpful assistant.").unwrap();
        assert!(template.is_literal());
        assert_eq!(template.render(&ctx()).unwrap(), "You are a helpful assistant.");
    }

    #[test]
    fn test_variable_substitution() {
        let template = PromptTemplate::parse("Hello {{ name }}, you are {{age}}!").unwrap();
        let context = ctx().with("name", "Ada").with("age", 36i64);
        assert_eq!(template.render(&context).unwrap(), "Hello Ada, you are 36!");
    }

    #[test]
    fn test_booleans_render_canonically() {
        let template = PromptTemplate::parse("formal={{ formal }}").unwrap();
        assert_eq!(template.render(&ctx().with("formal", true)).unwrap(), "formal=true");
        assert_eq!(template.render(&ctx().with("formal", false)).unwrap(), "formal=false");
    }

    #[test]
    fn test_undefined_variable() {
        let template = PromptTemplate::parse("System prompt with {{ missing_var }}.").unwrap();
        let err = template.render(&ctx()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::UndefinedVariable {
                name: "missing_var".to_string()
            }
        );
    }

    #[test]
    fn test_declared_defaults() {
        let template = PromptTemplate::parse(
            r#"{{ name | default("guest") }} / {{ n | default(value=3) }} / {{ on | default(true) }}"#,
        )
        .unwrap();
        assert_eq!(template.render(&ctx()).unwrap(), "guest / 3 / true");
        assert_eq!(
            template.render(&ctx().with("name", "Ada")).unwrap(),
            "Ada / 3 / true"
        );
    }

    #[test]
    fn test_conditional_guarded_segment() {
        let template = PromptTemplate::parse(
            "You are {{ personality }}.{% if formal %} Use formal language.{% endif %} Be brief.",
        )
        .unwrap();

        let formal = template
            .render(&ctx().with("personality", "helpful").with("formal", true))
            .unwrap();
        let casual = template
            .render(&ctx().with("personality", "helpful").with("formal", false))
            .unwrap();

        assert_eq!(formal, "You are helpful. Use formal language. Be brief.");
        assert_eq!(casual, "You are helpful. Be brief.");
        assert_eq!(formal.replace(" Use formal language.", ""), casual);
    }

    #[test]
    fn test_absent_guard_is_falsy() {
        let template = PromptTemplate::parse("{% if name %}Hello {{ name }}{% else %}Hello guest{% endif %}!").unwrap();
        assert_eq!(template.render(&ctx()).unwrap(), "Hello guest!");
        assert_eq!(template.render(&ctx().with("name", "")).unwrap(), "Hello guest!");
        assert_eq!(template.render(&ctx().with("name", "Ada")).unwrap(), "Hello Ada!");
    }

    #[test]
    fn test_negated_and_nested_conditionals() {
        let template = PromptTemplate::parse(
            "{% if detailed %}Detailed{% if pros %} +pros{% endif %}{% if not examples %} -examples{% endif %}{% else %}Short{% endif %}",
        )
        .unwrap();

        assert_eq!(template.render(&ctx()).unwrap(), "Short");
        assert_eq!(
            template.render(&ctx().with("detailed", true).with("pros", 1i64)).unwrap(),
            "Detailed +pros -examples"
        );
        assert_eq!(
            template
                .render(&ctx().with("detailed", true).with("examples", true))
                .unwrap(),
            "Detailed"
        );
    }

    #[test]
    fn test_default_literal_may_hold_delimiters() {
        let template =
            PromptTemplate::parse(r#"[{{ x | default("a}}b|c") }}] [{{ y | default('{% x %}') }}]"#).unwrap();
        assert_eq!(template.render(&ctx()).unwrap(), "[a}}b|c] [{% x %}]");
        assert_eq!(template.variables(), vec!["x", "y"]);

        let err = PromptTemplate::parse(r#"{{ x | default("open) }}"#).unwrap_err();
        assert!(matches!(err, TemplateError::MalformedTemplate { offset: 0, .. }));
    }

    #[test]
    fn test_comments_are_dropped() {
        let template = PromptTemplate::parse("a{# note to self #}b").unwrap();
        assert_eq!(template.render(&ctx()).unwrap(), "ab");
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let template = PromptTemplate::parse(
            "{{ a }}-{{ b }}{% if c %}-{{ c }}{% endif %}{{ d | default(0.5) }}",
        )
        .unwrap();
        let context = ctx().with("a", "x").with("b", 2i64).with("c", true);
        let first = template.render(&context).unwrap();
        for _ in 0..10 {
            assert_eq!(template.render(&context).unwrap(), first);
        }
        assert_eq!(first, "x-2-true0.5");
    }

    #[test]
    fn test_unmatched_delimiters() {
        let cases = [
            "{% if a %}never closed",
            "{% endif %}",
            "{% else %}",
            "{% if a %}x{% else %}y{% else %}z{% endif %}",
            "Hello {{ name",
            "Hello {% if a",
            "{{ }}",
            "{{ not-an-ident }}",
            "{% for x in xs %}{% endfor %}",
            "{{ name | upper }}",
            "{{ name | default(unquoted) }}",
        ];
        for source in cases {
            let err = PromptTemplate::parse(source).unwrap_err();
            assert!(
                matches!(err, TemplateError::MalformedTemplate { .. }),
                "expected malformed for {:?}, got {:?}",
                source,
                err
            );
        }
    }

    #[test]
    fn test_malformed_reports_offset() {
        let err = PromptTemplate::parse("abc {% if x %}").unwrap_err();
        assert!(matches!(err, TemplateError::MalformedTemplate { offset: 4, .. }));
    }

    #[test]
    fn test_variables_listing() {
        let template =
            PromptTemplate::parse("{{ b }} {% if a %}{{ c }}{% else %}{{ b }}{% endif %}").unwrap();
        assert_eq!(template.variables(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_free_render_function() {
        let template = PromptTemplate::parse("{{ x }}").unwrap();
        assert_eq!(render(&template, &ctx().with("x", 1i64)).unwrap(), "1");
    }
}
