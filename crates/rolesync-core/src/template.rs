//! `{attribute}` templates rendered against directory entries.
//!
//! `{{` and `}}` produce literal braces. Attribute names are case-insensitive;
//! `{dn}` renders the entry's distinguished name.

use crate::error::{SyncError, SyncResult};
use crate::traits::LdapEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A parsed template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse `source`, returning a message describing the first syntax error.
    pub fn parse(source: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') => {
                                name.push(c);
                            }
                            Some(c) => {
                                return Err(format!(
                                    "invalid character '{c}' in placeholder of '{source}'"
                                ))
                            }
                            None => return Err(format!("unclosed placeholder in '{source}'")),
                        }
                    }
                    if name.is_empty() {
                        return Err(format!("empty placeholder in '{source}'"));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(name.to_ascii_lowercase()));
                }
                '}' => return Err(format!("unmatched '}}' in '{source}'")),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Attribute names referenced by the template, lowercased.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// True when the template has no placeholder.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.fields().next().is_none()
    }

    /// Render with literal segments only. Placeholders are kept verbatim.
    #[must_use]
    pub fn render_static(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field(name) => {
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                }
            }
        }
        out
    }

    /// Substitute each placeholder with the first value of the attribute.
    pub fn render(&self, entry: &LdapEntry) -> SyncResult<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field(name) => match entry.first_value(name) {
                    Some(value) if !value.is_empty() => out.push_str(value),
                    _ => {
                        return Err(SyncError::TemplateSubstitution {
                            template: self.source.clone(),
                            attribute: name.clone(),
                            dn: entry.dn.clone(),
                        })
                    }
                },
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> LdapEntry {
        LdapEntry::new("cn=alice,ou=people,dc=example,dc=com")
            .with_attribute("cn", ["alice"])
            .with_attribute("memberOf", ["cn=dba,ou=groups", "cn=dev,ou=groups"])
    }

    #[test]
    fn test_static_template() {
        let tpl = Template::parse("app_{{owner}}").unwrap();
        assert!(tpl.is_static());
        assert_eq!(tpl.render_static(), "app_{owner}");
        assert_eq!(tpl.render(&entry()).unwrap(), "app_{owner}");
    }

    #[test]
    fn test_render_uses_first_value() {
        let tpl = Template::parse("{CN}_{memberof}").unwrap();
        assert_eq!(tpl.fields().collect::<Vec<_>>(), vec!["cn", "memberof"]);
        assert_eq!(tpl.render(&entry()).unwrap(), "alice_cn=dba,ou=groups");
    }

    #[test]
    fn test_render_dn() {
        let tpl = Template::parse("{dn}").unwrap();
        assert_eq!(
            tpl.render(&entry()).unwrap(),
            "cn=alice,ou=people,dc=example,dc=com"
        );
    }

    #[test]
    fn test_missing_attribute() {
        let tpl = Template::parse("{mail}").unwrap();
        match tpl.render(&entry()).unwrap_err() {
            SyncError::TemplateSubstitution { attribute, dn, .. } => {
                assert_eq!(attribute, "mail");
                assert_eq!(dn, "cn=alice,ou=people,dc=example,dc=com");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_syntax_errors() {
        assert!(Template::parse("{cn").is_err());
        assert!(Template::parse("cn}").is_err());
        assert!(Template::parse("{}").is_err());
        assert!(Template::parse("{c n}").is_err());
    }
}
