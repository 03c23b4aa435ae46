// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::errors::EvalError;

use core::fmt::{self, Display, Formatter};
use core::str::FromStr;
use std::rc::Rc;

use anyhow::Result;

/// One trailing segment of a resource path: an array index or a map key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Subscript {
    Index(i64),
    Key(Rc<str>),
}

impl Display for Subscript {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Subscript::Index(i) => write!(f, "[{i}]"),
            // Double quotes are canonical on serialize.
            Subscript::Key(k) => {
                write!(f, "[\"{}\"]", k.replace('\\', "\\\\").replace('"', "\\\""))
            }
        }
    }
}

/// Canonical address of a resource/component instance:
/// `[file:][parent.]type.name([idx]|["key"])*`.
///
/// Paths are the store key and the dependency-graph node identity. They are
/// immutable; `append_index`/`append_key` derive child paths without touching
/// the original. A path with no subscripts addresses the whole named instance
/// (a "collection"); one with subscripts addresses a specific item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourcePath {
    file: Option<Rc<str>>,
    parent: Vec<Rc<str>>,
    type_name: Rc<str>,
    name: Rc<str>,
    subscripts: Vec<Subscript>,
}

impl ResourcePath {
    pub fn new(type_name: &str, name: &str) -> Self {
        Self {
            file: None,
            parent: vec![],
            type_name: type_name.into(),
            name: name.into(),
            subscripts: vec![],
        }
    }

    pub fn with_file(mut self, file: &str) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn without_file(&self) -> Self {
        let mut path = self.clone();
        path.file = None;
        path
    }

    /// Address of a nested instance owned by the instance at `self`.
    /// Subscripts of the owner are folded into its name segment.
    pub fn child(&self, type_name: &str, name: &str) -> Self {
        Self {
            file: self.file.clone(),
            parent: self.child_scope(),
            type_name: type_name.into(),
            name: name.into(),
            subscripts: vec![],
        }
    }

    /// The parent-segment list a child of this instance would carry.
    pub fn child_scope(&self) -> Vec<Rc<str>> {
        let mut parent = self.parent.clone();
        parent.push(self.type_name.clone());
        if self.subscripts.is_empty() {
            parent.push(self.name.clone());
        } else {
            let mut seg = self.name.to_string();
            for s in &self.subscripts {
                seg.push_str(&s.to_string());
            }
            parent.push(seg.into());
        }
        parent
    }

    pub fn append_index(&self, index: i64) -> Self {
        let mut path = self.clone();
        path.subscripts.push(Subscript::Index(index));
        path
    }

    pub fn append_key(&self, key: &str) -> Self {
        let mut path = self.clone();
        path.subscripts.push(Subscript::Key(key.into()));
        path
    }

    pub fn append(&self, subscript: Subscript) -> Self {
        let mut path = self.clone();
        path.subscripts.push(subscript);
        path
    }

    /// The path without its subscripts: the keyed family this item belongs to.
    pub fn collection(&self) -> Self {
        let mut path = self.clone();
        path.subscripts.clear();
        path
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    pub fn parent_segments(&self) -> &[Rc<str>] {
        &self.parent
    }

    pub fn has_parent(&self) -> bool {
        !self.parent.is_empty()
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscripts(&self) -> &[Subscript] {
        &self.subscripts
    }

    pub fn is_collection(&self) -> bool {
        self.subscripts.is_empty()
    }

    pub fn is_item(&self) -> bool {
        !self.subscripts.is_empty()
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{file}:")?;
        }
        for seg in &self.parent {
            write!(f, "{seg}.")?;
        }
        write!(f, "{}.{}", self.type_name, self.name)?;
        for sub in &self.subscripts {
            write!(f, "{sub}")?;
        }
        Ok(())
    }
}

impl FromStr for ResourcePath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || EvalError::MalformedPath(s.to_string());

        // The file prefix ends at the first `:` that precedes any subscript.
        let bracket = s.find('[').unwrap_or(s.len());
        let (file, rest) = match s[..bracket].find(':') {
            Some(pos) => (Some(&s[..pos]), &s[pos + 1..]),
            None => (None, s),
        };
        if matches!(file, Some("")) {
            return Err(malformed().into());
        }

        // Split the dotted part from the subscript suffix.
        let bracket = rest.find('[').unwrap_or(rest.len());
        let (dotted, mut tail) = rest.split_at(bracket);

        let mut segments: Vec<&str> = vec![];
        for seg in dotted.split('.') {
            if seg.is_empty()
                || !seg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(malformed().into());
            }
            segments.push(seg);
        }
        if segments.len() < 2 {
            return Err(malformed().into());
        }
        let name = segments.pop().ok_or_else(malformed)?;
        let type_name = segments.pop().ok_or_else(malformed)?;

        let mut subscripts = vec![];
        while !tail.is_empty() {
            if !tail.starts_with('[') {
                return Err(malformed().into());
            }
            tail = &tail[1..];
            match tail.chars().next() {
                // Quoted key; single and double quotes both accepted on parse.
                Some(quote @ ('"' | '\'')) => {
                    tail = &tail[1..];
                    let mut key = String::new();
                    let mut chars = tail.char_indices();
                    let mut consumed = None;
                    while let Some((i, ch)) = chars.next() {
                        match ch {
                            '\\' => match chars.next() {
                                Some((_, c @ ('\\' | '"' | '\''))) => key.push(c),
                                _ => return Err(malformed().into()),
                            },
                            _ if ch == quote => {
                                consumed = Some(i + 1);
                                break;
                            }
                            _ => key.push(ch),
                        }
                    }
                    let end = consumed.ok_or_else(malformed)?;
                    tail = &tail[end..];
                    if !tail.starts_with(']') {
                        return Err(malformed().into());
                    }
                    tail = &tail[1..];
                    subscripts.push(Subscript::Key(key.into()));
                }
                // Integer index.
                _ => {
                    let end = tail.find(']').ok_or_else(malformed)?;
                    let index = tail[..end].parse::<i64>().map_err(|_| malformed())?;
                    tail = &tail[end + 1..];
                    subscripts.push(Subscript::Index(index));
                }
            }
        }

        Ok(Self {
            file: file.map(Into::into),
            parent: segments.iter().map(|s| Rc::from(*s)).collect(),
            type_name: type_name.into(),
            name: name.into(),
            subscripts,
        })
    }
}
