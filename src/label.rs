//! Symbolic names bound to cells.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::Address;

/// Rendered when nothing of the raw name survives sanitising.
pub const PLACEHOLDER_NAME: &str = "uname";

/// Maximum number of kept characters for a rendered string label.
pub const STRING_LABEL_LIMIT: usize = 0x10;

/// Kind of cell a label names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LabelKind {
    Code,
    Function,
    Data,
    String,
}

impl LabelKind {
    /// Prefix used by address-synthesised labels.
    pub fn prefix(&self) -> &'static str {
        match self {
            LabelKind::Code => "lbl_",
            LabelKind::Function => "fcn_",
            LabelKind::Data => "dat_",
            LabelKind::String => "str_",
        }
    }
}

/// Linkage of a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum LabelAccess {
    #[default]
    Unset,
    Imported,
    Exported,
    Global,
    Local,
}

/// A versioned symbolic name.
///
/// The name is a raw byte sequence; it only becomes text through
/// [`Label::display_name`]. Two cells rendering the same display name are told
/// apart by the version, which the database bumps on collision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    name: Vec<u8>,
    kind: LabelKind,
    access: LabelAccess,
    auto_generated: bool,
    version: u32,
}

impl Label {
    /// Synthesise a label from an address, e.g. `lbl_00401000`.
    pub fn from_address(address: &Address, kind: LabelKind) -> Self {
        let name = format!("{}{}", kind.prefix(), address).replace(':', "_");
        Self {
            name: name.into_bytes(),
            kind,
            access: LabelAccess::Unset,
            auto_generated: true,
            version: 0,
        }
    }

    /// A label named by a user or a backend.
    ///
    /// An empty name is accepted and renders as [`PLACEHOLDER_NAME`].
    pub fn new(name: impl Into<Vec<u8>>, kind: LabelKind, access: LabelAccess, version: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            access,
            auto_generated: false,
            version,
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn kind(&self) -> LabelKind {
        self.kind
    }

    pub fn access(&self) -> LabelAccess {
        self.access
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_auto_generated(&self) -> bool {
        self.auto_generated
    }

    /// Bump the version by one. Only the collision resolver should call this.
    pub fn increment_version(&mut self) {
        self.version = self.version.saturating_add(1);
    }

    /// Raw name up to the first NUL byte.
    fn raw(&self) -> &[u8] {
        match self.name.iter().position(|&b| b == 0) {
            Some(end) => &self.name[..end],
            None => &self.name,
        }
    }

    /// Sanitised, versioned name used for display and uniqueness checks.
    pub fn display_name(&self) -> String {
        let mut result = String::new();

        if self.kind == LabelKind::String && !self.auto_generated {
            let mut limit = STRING_LABEL_LIMIT;
            let mut capitalize = true;
            for &raw in self.raw() {
                let Some(c) = convert_to_label(raw) else {
                    capitalize = true;
                    continue;
                };
                if capitalize {
                    capitalize = false;
                    result.push(c.to_ascii_uppercase());
                } else {
                    result.push(c.to_ascii_lowercase());
                }
                limit -= 1;
                if limit == 0 {
                    break;
                }
            }
        } else {
            result.extend(self.raw().iter().filter_map(|&b| convert_to_label(b)));
        }

        if result.is_empty() {
            result.push_str(PLACEHOLDER_NAME);
        }

        if self.version == 0 {
            result
        } else {
            format!("{}.{}", result, self.version)
        }
    }

    /// Debug form: `lbl(<name> <length> <flags> <version>)`.
    pub fn dump(&self) -> String {
        let kind = match self.kind {
            LabelKind::Data => 'd',
            LabelKind::Code => 'c',
            LabelKind::String => 's',
            LabelKind::Function => '-',
        };
        let access = match self.access {
            LabelAccess::Imported => 'i',
            LabelAccess::Exported => 'e',
            LabelAccess::Global => 'g',
            LabelAccess::Local => 'l',
            LabelAccess::Unset => '-',
        };
        let auto = if self.auto_generated { 'a' } else { '-' };
        format!(
            "lbl({} {:#x} {}{}{} {:#x})",
            String::from_utf8_lossy(self.raw()),
            self.raw().len() + 1,
            kind,
            access,
            auto,
            self.version
        )
    }
}

/// Map one raw byte to a label character, `None` if it must be dropped.
pub fn convert_to_label(c: u8) -> Option<char> {
    if c.is_ascii_alphanumeric() || matches!(c, b'!' | b':' | b'_' | b'@') {
        Some(c as char)
    } else {
        None
    }
}

// Comparisons, like rendering, only see the name up to its first NUL.
impl PartialEq for Label {
    fn eq(&self, other: &Self) -> bool {
        self.raw() == other.raw()
            && self.kind == other.kind
            && self.access == other.access
            && self.auto_generated == other.auto_generated
            && self.version == other.version
    }
}

impl Eq for Label {}

impl Hash for Label {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw().hash(state);
        self.kind.hash(state);
        self.access.hash(state);
        self.auto_generated.hash(state);
        self.version.hash(state);
    }
}

impl PartialOrd for Label {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Label {
    // Name bytes first, then version; the type tags only break the remaining
    // ties so that ordering agrees with equality.
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw()
            .cmp(other.raw())
            .then(self.version.cmp(&other.version))
            .then(self.kind.cmp(&other.kind))
            .then(self.access.cmp(&other.access))
            .then(self.auto_generated.cmp(&other.auto_generated))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn addr() -> Address {
        Address::flat(0x1000, 16)
    }

    #[rstest]
    #[case(LabelKind::Code, "lbl_1000")]
    #[case(LabelKind::Function, "fcn_1000")]
    #[case(LabelKind::Data, "dat_1000")]
    #[case(LabelKind::String, "str_1000")]
    fn test_auto_label_prefix(#[case] kind: LabelKind, #[case] expected: &str) {
        let label = Label::from_address(&addr(), kind);
        assert!(label.is_auto_generated());
        assert_eq!(label.display_name(), expected);
    }

    #[test]
    fn test_versioned_display() {
        let mut label = Label::from_address(&addr(), LabelKind::Data);
        label.increment_version();
        label.increment_version();
        assert_eq!(label.display_name(), "dat_1000.2");
    }

    #[test]
    fn test_segment_separator_folded() {
        let label = Label::from_address(&Address::segmented(0xf000, 0x10, 16), LabelKind::Code);
        assert_eq!(label.display_name(), "lbl_f000_0010");
    }

    #[test]
    fn test_string_label_capitalized() {
        let label = Label::new("hello world", LabelKind::String, LabelAccess::Unset, 0);
        assert_eq!(label.display_name(), "HelloWorld");
    }

    #[test]
    fn test_string_label_capped() {
        let label = Label::new("the quick brown fox jumps", LabelKind::String, LabelAccess::Unset, 0);
        let rendered = label.display_name();
        assert_eq!(rendered, "TheQuickBrownFox");
        assert_eq!(rendered.len(), STRING_LABEL_LIMIT);
    }

    #[test]
    fn test_string_label_cap_excludes_version() {
        let label = Label::new("abcdefghijklmnopqrstuvwxyz", LabelKind::String, LabelAccess::Unset, 3);
        assert_eq!(label.display_name(), "Abcdefghijklmnop.3");
    }

    #[rstest]
    #[case(&b"foo bar"[..], "foobar")]
    #[case(&b"std::cout@plt!"[..], "std::cout@plt!")]
    #[case(&b"a-b.c"[..], "abc")]
    #[case(&b"\xff\xfe"[..], "uname")]
    #[case(&b"  -- "[..], "uname")]
    #[case(&b""[..], "uname")]
    #[case(&b"main\0garbage"[..], "main")]
    fn test_sanitize(#[case] raw: &[u8], #[case] expected: &str) {
        let label = Label::new(raw.to_vec(), LabelKind::Code, LabelAccess::Global, 0);
        assert_eq!(label.display_name(), expected);
    }

    #[test]
    fn test_display_is_idempotent() {
        let label = Label::new("weird name?", LabelKind::Function, LabelAccess::Exported, 1);
        assert_eq!(label.display_name(), label.display_name());
        assert_eq!(label.to_string(), "weirdname.1");
    }

    #[test]
    fn test_ordering_and_equality() {
        let a = Label::new("alpha", LabelKind::Code, LabelAccess::Unset, 0);
        let a1 = Label::new("alpha", LabelKind::Code, LabelAccess::Unset, 1);
        let b = Label::new("beta", LabelKind::Code, LabelAccess::Unset, 0);
        assert!(a < a1);
        assert!(a1 < b);
        assert_ne!(a, Label::new("alpha", LabelKind::Data, LabelAccess::Unset, 0));
        assert_eq!(a, Label::new("alpha", LabelKind::Code, LabelAccess::Unset, 0));
    }

    #[test]
    fn test_comparison_stops_at_nul() {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        let left = Label::new(&b"main\0garbage"[..], LabelKind::Code, LabelAccess::Global, 0);
        let right = Label::new(&b"main\0other"[..], LabelKind::Code, LabelAccess::Global, 0);
        assert_eq!(left, right);
        assert_eq!(left.cmp(&right), Ordering::Equal);
        assert_eq!(left, Label::new("main", LabelKind::Code, LabelAccess::Global, 0));
        assert!(left < Label::new("main_", LabelKind::Code, LabelAccess::Global, 0));

        left.hash(&mut hasher);
        let first = hasher.finish();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        right.hash(&mut hasher);
        assert_eq!(first, hasher.finish());
    }

    #[test]
    fn test_dump() {
        let label = Label::new("main", LabelKind::Code, LabelAccess::Exported, 2);
        assert_eq!(label.dump(), "lbl(main 0x5 ce- 0x2)");
        let auto = Label::from_address(&addr(), LabelKind::Data);
        assert_eq!(auto.dump(), "lbl(dat_1000 0x9 d-a 0x0)");
    }
}
