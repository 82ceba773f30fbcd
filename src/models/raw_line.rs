use derive_more::{Deref, Display};

/// One complete line received from the device. Always trimmed and never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Deref)]
pub struct RawLine(String);

impl RawLine {
    /// Trim `text` and wrap it. Returns `None` when nothing but whitespace is left.
    pub fn new(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}
