//! Document identity and text.

use std::fmt;
use std::ops::{Deref, DerefMut};

/// Opaque identity of a document, such as its canonical file path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The lines of a document, without line terminators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentLines(Vec<String>);

impl DocumentLines {
    pub fn new(lines: Vec<String>) -> Self {
        Self(lines)
    }

    /// Split text into lines. A trailing newline does not add an empty line.
    pub fn from_text(text: &str) -> Self {
        Self(text.lines().map(str::to_string).collect())
    }

    /// Join the lines back into text ending with a newline.
    pub fn to_text(&self) -> String {
        let mut text = self.0.join("\n");
        if !self.0.is_empty() {
            text.push('\n');
        }
        text
    }

    pub fn into_inner(self) -> Vec<String> {
        self.0
    }
}

impl Deref for DocumentLines {
    type Target = Vec<String>;

    fn deref(&self) -> &Vec<String> {
        &self.0
    }
}

impl DerefMut for DocumentLines {
    fn deref_mut(&mut self) -> &mut Vec<String> {
        &mut self.0
    }
}
