//! Selection expressions and their compiled form.
//!
//! Grammar:
//!
//! ```text
//! Group     := '{' FieldSpec (',' FieldSpec)* '}'
//! FieldSpec := Name | Name Group
//! ```
//!
//! Names are unquoted identifiers; whitespace between tokens is ignored.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::QuerySyntaxError;

/// What to do with the value of a selected field.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Copy the value verbatim, nested structure included.
    Leaf,
    /// Apply the child group to the value (to each element for arrays).
    Nested(Arc<Group>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub selection: Selection,
}

/// Ordered set of selected fields. Field order is output key order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Group {
    fields: Vec<Field>,
    index: HashMap<String, usize>,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Exact-match lookup returning the field's position and selection.
    pub fn lookup(&self, name: &str) -> Option<(usize, &Selection)> {
        self.index.get(name).map(|&i| (i, &self.fields[i].selection))
    }

    pub fn get(&self, name: &str) -> Option<&Selection> {
        self.lookup(name).map(|(_, selection)| selection)
    }

    /// Adds a field; returns `false` if the name is already present.
    pub fn insert(&mut self, name: impl Into<String>, selection: Selection) -> bool {
        let name = name.into();
        if self.index.contains_key(&name) {
            return false;
        }
        self.index.insert(name.clone(), self.fields.len());
        self.fields.push(Field { name, selection });
        true
    }

    /// Builder-style `insert` for constructing trees in code.
    pub fn with(mut self, name: impl Into<String>, selection: Selection) -> Self {
        self.insert(name, selection);
        self
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", field.name)?;
            if let Selection::Nested(child) = &field.selection {
                write!(f, " {}", child)?;
            }
        }
        write!(f, " }}")
    }
}

/// Compiles a selection expression such as `{ name, address { street, city } }`.
pub fn compile(expression: &str) -> Result<Group, QuerySyntaxError> {
    let mut parser = Parser { src: expression, pos: 0 };
    parser.skip_ws();
    let group = parser.group()?;
    parser.skip_ws();
    if parser.pos < expression.len() {
        return Err(QuerySyntaxError::TrailingInput { offset: parser.pos });
    }
    debug!(target: "jql::selection", fields = group.len(), "compiled selection");
    Ok(group)
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '$' | '-')
}

fn describe(c: Option<char>) -> String {
    match c {
        Some(c) => format!("'{}'", c),
        None => "end of input".to_string(),
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self, c: char) {
        self.pos += c.len_utf8();
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.bump(c);
        }
    }

    fn group(&mut self) -> Result<Group, QuerySyntaxError> {
        let open = self.pos;
        match self.peek() {
            Some('{') => self.bump('{'),
            other => {
                return Err(QuerySyntaxError::UnexpectedChar { found: describe(other), expected: "'{'", offset: open })
            }
        }

        let mut group = Group::new();
        loop {
            self.skip_ws();
            let name_start = self.pos;
            let name = self.name(open)?;
            if group.get(&name).is_some() {
                return Err(QuerySyntaxError::DuplicateField { name, offset: name_start });
            }
            self.skip_ws();

            let selection = if self.peek() == Some('{') {
                Selection::Nested(Arc::new(self.group()?))
            } else {
                Selection::Leaf
            };
            group.insert(name, selection);

            self.skip_ws();
            match self.peek() {
                Some(',') => self.bump(','),
                Some('}') => {
                    self.bump('}');
                    return Ok(group);
                }
                None => return Err(QuerySyntaxError::UnterminatedGroup { offset: open }),
                other => {
                    return Err(QuerySyntaxError::UnexpectedChar {
                        found: describe(other),
                        expected: "',' or '}'",
                        offset: self.pos,
                    })
                }
            }
        }
    }

    fn name(&mut self, open: usize) -> Result<String, QuerySyntaxError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !is_name_char(c) {
                break;
            }
            self.bump(c);
        }
        if self.pos > start {
            return Ok(self.src[start..self.pos].to_string());
        }
        match self.peek() {
            None => Err(QuerySyntaxError::UnterminatedGroup { offset: open }),
            other => Err(QuerySyntaxError::UnexpectedChar { found: describe(other), expected: "field name", offset: start }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(group: &Group) -> Vec<&str> {
        group.fields().iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn compiles_leaves_in_order() {
        let group = compile("{ name, email, phone }").unwrap();
        assert_eq!(names(&group), vec!["name", "email", "phone"]);
        assert!(group.fields().iter().all(|f| f.selection == Selection::Leaf));
        assert_eq!(group.lookup("email").map(|(i, _)| i), Some(1));
        assert!(group.get("zipcode").is_none());
    }

    #[test]
    fn compiles_nested_groups() {
        let group = compile("{ name, address { street, city } }").unwrap();
        match group.get("address") {
            Some(Selection::Nested(child)) => assert_eq!(names(child), vec!["street", "city"]),
            other => panic!("expected nested selection, got {:?}", other),
        }
    }

    #[test]
    fn whitespace_is_insignificant() {
        let a = compile("{a,b{c,d{e}}}").unwrap();
        let b = compile("\n{ a ,\tb { c , d { e } } }  ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "{ a, b { c, d { e } } }");
    }

    #[test]
    fn duplicate_field_is_rejected_with_offset() {
        let err = compile("{ id, name, id }").unwrap_err();
        assert_eq!(err, QuerySyntaxError::DuplicateField { name: "id".into(), offset: 12 });
    }

    #[test]
    fn duplicates_in_different_groups_are_fine() {
        assert!(compile("{ id, child { id } }").is_ok());
    }

    #[test]
    fn unterminated_group() {
        let err = compile("{ a, b { c }").unwrap_err();
        assert_eq!(err, QuerySyntaxError::UnterminatedGroup { offset: 0 });
        assert_eq!(err.offset(), 0);
    }

    #[test]
    fn empty_group_and_trailing_comma_are_errors() {
        assert!(matches!(compile("{}"), Err(QuerySyntaxError::UnexpectedChar { offset: 1, .. })));
        assert!(matches!(compile("{ a, }"), Err(QuerySyntaxError::UnexpectedChar { offset: 5, .. })));
    }

    #[test]
    fn missing_open_brace_and_trailing_input() {
        assert!(matches!(compile("name"), Err(QuerySyntaxError::UnexpectedChar { offset: 0, .. })));
        assert!(matches!(compile(""), Err(QuerySyntaxError::UnexpectedChar { offset: 0, .. })));
        assert_eq!(compile("{ a } b").unwrap_err(), QuerySyntaxError::TrailingInput { offset: 6 });
    }

    #[test]
    fn unexpected_separator() {
        let err = compile("{ a; b }").unwrap_err();
        assert_eq!(
            err,
            QuerySyntaxError::UnexpectedChar { found: "';'".into(), expected: "',' or '}'", offset: 3 }
        );
    }
}
