//! File classifications and their capability flags.
//!
//! A [`Classification`] is an immutable, cheaply cloneable handle. Two
//! classifications are equal when their names are equal, so a registry can
//! hand out clones freely and callers can compare them without caring which
//! instance they hold.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, LazyLock};

pub const PLAIN_TEXT_NAME: &str = "PLAIN_TEXT";
pub const UNKNOWN_NAME: &str = "UNKNOWN";

bitflags::bitflags! {
    /// Capabilities advertised by a classification.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CapabilityFlags: u8 {
        /// Content is human-readable text.
        const TEXT = 1 << 0;
        /// Content is opaque binary data.
        const BINARY = 1 << 1;
        /// The classification is a programming or markup language.
        const LANGUAGE = 1 << 2;
        /// Stand-in meaning "sniff the content at runtime".
        const PLACEHOLDER = 1 << 3;
    }
}

static PLAIN_TEXT: LazyLock<Classification> = LazyLock::new(|| {
    Classification::builder(PLAIN_TEXT_NAME)
        .description("Plain text")
        .default_extension("txt")
        .flags(CapabilityFlags::TEXT)
        .build()
});

static UNKNOWN: LazyLock<Classification> = LazyLock::new(|| {
    Classification::builder(UNKNOWN_NAME)
        .description("Unknown or binary content")
        .flags(CapabilityFlags::BINARY | CapabilityFlags::PLACEHOLDER)
        .build()
});

#[derive(Debug)]
struct Inner {
    name: String,
    description: String,
    default_extension: Option<String>,
    flags: CapabilityFlags,
}

#[derive(Clone)]
pub struct Classification {
    inner: Arc<Inner>,
}

impl Classification {
    pub fn builder(name: impl Into<String>) -> ClassificationBuilder {
        ClassificationBuilder {
            name: name.into(),
            description: String::new(),
            default_extension: None,
            flags: CapabilityFlags::empty(),
        }
    }

    /// The well-known plain text classification.
    pub fn plain_text() -> Classification {
        PLAIN_TEXT.clone()
    }

    /// The well-known "unknown by content" placeholder.
    pub fn unknown() -> Classification {
        UNKNOWN.clone()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    pub fn default_extension(&self) -> Option<&str> {
        self.inner.default_extension.as_deref()
    }

    pub fn flags(&self) -> CapabilityFlags {
        self.inner.flags
    }

    pub fn is_binary(&self) -> bool {
        self.inner.flags.contains(CapabilityFlags::BINARY)
    }

    pub fn is_text(&self) -> bool {
        self.inner.flags.contains(CapabilityFlags::TEXT)
    }

    pub fn is_language(&self) -> bool {
        self.inner.flags.contains(CapabilityFlags::LANGUAGE)
    }

    /// Returns `true` when this classification only says "look at the content".
    pub fn is_placeholder(&self) -> bool {
        self.inner.flags.contains(CapabilityFlags::PLACEHOLDER)
    }

    pub fn is_plain_text(&self) -> bool {
        self.name() == PLAIN_TEXT_NAME
    }

    pub fn is_unknown(&self) -> bool {
        self.name() == UNKNOWN_NAME
    }
}

impl PartialEq for Classification {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.name == other.inner.name
    }
}

impl Eq for Classification {}

impl Hash for Classification {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.name.hash(state);
    }
}

impl fmt::Debug for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classification")
            .field("name", &self.inner.name)
            .field("flags", &self.inner.flags)
            .finish()
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

#[derive(Debug, Clone)]
pub struct ClassificationBuilder {
    name: String,
    description: String,
    default_extension: Option<String>,
    flags: CapabilityFlags,
}

impl ClassificationBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn default_extension(mut self, extension: impl Into<String>) -> Self {
        let extension = extension.into();
        self.default_extension = (!extension.is_empty()).then_some(extension);
        self
    }

    pub fn flags(mut self, flags: CapabilityFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn build(self) -> Classification {
        Classification {
            inner: Arc::new(Inner {
                name: self.name,
                description: self.description,
                default_extension: self.default_extension,
                flags: self.flags,
            }),
        }
    }
}
