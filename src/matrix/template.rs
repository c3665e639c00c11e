//! Command templates with `{name}` placeholders.
//!
//! Templates are parsed and checked against a closed set of variables when the
//! matrix is built, so an unknown placeholder is a configuration error rather
//! than a surprise halfway through a run. `{{` and `}}` produce literal braces.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unclosed placeholder starting at byte {0}")]
    Unclosed(usize),

    #[error("unmatched '}}' at byte {0}")]
    StrayBrace(usize),

    #[error("invalid placeholder name '{0}'")]
    InvalidName(String),

    #[error("unknown variable '{{{0}}}'")]
    UnknownVariable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(TemplateError::Unclosed(pos));
                    }
                    let name = name.trim().to_string();
                    if !valid_name(&name) {
                        return Err(TemplateError::InvalidName(name));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Var(name));
                }
                '}' => return Err(TemplateError::StrayBrace(pos)),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }

    /// Placeholder names used by this template, deduplicated.
    pub fn variables(&self) -> BTreeSet<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Var(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Fail on the first placeholder outside `known`.
    pub fn validate<'a>(
        &self,
        known: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), TemplateError> {
        let known: BTreeSet<&str> = known.into_iter().collect();
        match self.variables().into_iter().find(|v| !known.contains(v)) {
            Some(unknown) => Err(TemplateError::UnknownVariable(unknown.to_string())),
            None => Ok(()),
        }
    }

    pub fn render(&self, vars: &BTreeMap<String, String>) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Var(name) => {
                    let value = vars
                        .get(name)
                        .ok_or_else(|| TemplateError::UnknownVariable(name.clone()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_placeholders() {
        let t = Template::parse("conda build --croot {workdir}/build -e cuda{cuda}").unwrap();
        let out = t
            .render(&vars(&[("workdir", "/tmp/w"), ("cuda", "12.4")]))
            .unwrap();
        assert_eq!(out, "conda build --croot /tmp/w/build -e cuda12.4");
    }

    #[test]
    fn escaped_braces_are_literal() {
        let t = Template::parse("echo {{not_a_var}} {package}").unwrap();
        assert_eq!(t.variables().into_iter().collect::<Vec<_>>(), vec!["package"]);
        let out = t.render(&vars(&[("package", "numpy")])).unwrap();
        assert_eq!(out, "echo {not_a_var} numpy");
    }

    #[test]
    fn shell_parameter_expansion_needs_escaping() {
        let unescaped = Template::parse("echo ${HOME}").unwrap();
        assert_eq!(
            unescaped.validate(["package"]),
            Err(TemplateError::UnknownVariable("HOME".to_string()))
        );
        let t = Template::parse("echo ${{HOME}}").unwrap();
        assert_eq!(t.render(&BTreeMap::new()).unwrap(), "echo ${HOME}");
    }

    #[test]
    fn rejects_unclosed() {
        assert_eq!(
            Template::parse("echo {package"),
            Err(TemplateError::Unclosed(5))
        );
    }

    #[test]
    fn rejects_stray_close() {
        assert_eq!(Template::parse("echo }"), Err(TemplateError::StrayBrace(5)));
    }

    #[test]
    fn rejects_bad_names() {
        assert!(matches!(
            Template::parse("echo {1abc}"),
            Err(TemplateError::InvalidName(_))
        ));
        assert!(matches!(
            Template::parse("echo {}"),
            Err(TemplateError::InvalidName(_))
        ));
        assert!(matches!(
            Template::parse("echo {a-b}"),
            Err(TemplateError::InvalidName(_))
        ));
    }

    #[test]
    fn validate_against_closed_set() {
        let t = Template::parse("{package} {cuda} {mystery}").unwrap();
        assert_eq!(
            t.validate(["package", "cuda"]),
            Err(TemplateError::UnknownVariable("mystery".to_string()))
        );
        assert!(t.validate(["package", "cuda", "mystery"]).is_ok());
    }

    #[test]
    fn literal_only_template() {
        let t = Template::parse("make -j8").unwrap();
        assert!(t.variables().is_empty());
        assert_eq!(t.render(&BTreeMap::new()).unwrap(), "make -j8");
    }
}
