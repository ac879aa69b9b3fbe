//! Bundled classifications, declared lazily so an unused type costs nothing
//! until a file name touches one of its matchers.

use anyhow::Result;

use crate::classification::{CapabilityFlags, Classification};
use crate::detector::{ContentDetector, DetectionInput};
use crate::matcher::Matcher;
use crate::registry::{ProviderDeclaration, Registry};
use crate::resolver::Provenance;

pub const BUILTIN_PROVIDER: &str = "file-kind";

struct Builtin {
    name: &'static str,
    description: &'static str,
    default_extension: &'static str,
    flags: CapabilityFlags,
    extensions: &'static [&'static str],
    file_names: &'static [&'static str],
    hash_bangs: &'static [&'static str],
}

const LANGUAGE: CapabilityFlags = CapabilityFlags::TEXT.union(CapabilityFlags::LANGUAGE);

const BUILTINS: &[Builtin] = &[
    Builtin {
        name: "Rust",
        description: "Rust source",
        default_extension: "rs",
        flags: LANGUAGE,
        extensions: &["rs"],
        file_names: &[],
        hash_bangs: &[],
    },
    Builtin {
        name: "Python",
        description: "Python source",
        default_extension: "py",
        flags: LANGUAGE,
        extensions: &["py", "pyw", "pyi"],
        file_names: &[],
        hash_bangs: &["python"],
    },
    Builtin {
        name: "Shell",
        description: "Shell script",
        default_extension: "sh",
        flags: LANGUAGE,
        extensions: &["sh", "bash", "zsh"],
        file_names: &[".bashrc", ".zshrc", ".profile"],
        hash_bangs: &["sh", "bash", "zsh", "dash"],
    },
    Builtin {
        name: "XML",
        description: "XML document",
        default_extension: "xml",
        flags: LANGUAGE,
        extensions: &["xml", "xsd", "xsl", "svg"],
        file_names: &[],
        hash_bangs: &[],
    },
    Builtin {
        name: "JSON",
        description: "JSON document",
        default_extension: "json",
        flags: LANGUAGE,
        extensions: &["json"],
        file_names: &[".prettierrc"],
        hash_bangs: &[],
    },
    Builtin {
        name: "TOML",
        description: "TOML document",
        default_extension: "toml",
        flags: LANGUAGE,
        extensions: &["toml"],
        file_names: &["Cargo.lock"],
        hash_bangs: &[],
    },
    Builtin {
        name: "Markdown",
        description: "Markdown document",
        default_extension: "md",
        flags: LANGUAGE,
        extensions: &["md", "markdown"],
        file_names: &[],
        hash_bangs: &[],
    },
    Builtin {
        name: "Makefile",
        description: "Makefile",
        default_extension: "mk",
        flags: LANGUAGE,
        extensions: &["mk"],
        file_names: &["Makefile", "GNUmakefile", "makefile"],
        hash_bangs: &["make"],
    },
    Builtin {
        name: "Archive",
        description: "Compressed archive",
        default_extension: "zip",
        flags: CapabilityFlags::BINARY,
        extensions: &["zip", "jar", "tar", "tar.gz", "tgz", "gz", "7z"],
        file_names: &[],
        hash_bangs: &[],
    },
    Builtin {
        name: "Image",
        description: "Raster image",
        default_extension: "png",
        flags: CapabilityFlags::BINARY,
        extensions: &["png", "jpg", "jpeg", "gif", "bmp", "ico", "webp"],
        file_names: &[],
        hash_bangs: &[],
    },
];

impl Builtin {
    fn classification(&self) -> Classification {
        Classification::builder(self.name)
            .description(self.description)
            .default_extension(self.default_extension)
            .flags(self.flags)
            .build()
    }

    fn matchers(&self) -> Vec<Matcher> {
        self.extensions
            .iter()
            .map(|e| Matcher::extension(e))
            .chain(self.file_names.iter().map(|n| Matcher::exact(*n)))
            .chain(self.hash_bangs.iter().map(|h| Matcher::hash_bang(*h)))
            .collect()
    }
}

pub fn declare_builtins(registry: &Registry) {
    for builtin in BUILTINS {
        let declaration = ProviderDeclaration::new(
            builtin.name,
            Provenance::bundled(BUILTIN_PROVIDER),
            builtin.matchers(),
            move || builtin.classification(),
        );
        if let Err(err) = registry.declare(declaration) {
            tracing::warn!(name = builtin.name, error = %err, "Failed to declare builtin classification");
        }
    }
}

/// Recognises XML by its `<?xml` prolog regardless of the file name.
#[derive(Debug, Default)]
pub struct XmlPrologDetector;

impl ContentDetector for XmlPrologDetector {
    fn detect(&self, input: &DetectionInput<'_>) -> Result<Option<Classification>> {
        let Some(text) = input.text else {
            return Ok(None);
        };
        if !text.trim_start().starts_with("<?xml") {
            return Ok(None);
        }
        Ok(BUILTINS
            .iter()
            .find(|b| b.name == "XML")
            .map(Builtin::classification))
    }

    fn desired_prefix_len(&self) -> Option<usize> {
        Some(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FileId, FileRef};

    #[test]
    fn builtins_are_declared_lazily() {
        let registry = Registry::with_builtins();
        assert_eq!(registry.pending_len(), BUILTINS.len());
        assert_eq!(registry.classify_by_name("main.rs").name(), "Rust");
        assert_eq!(registry.pending_len(), BUILTINS.len() - 1);
    }

    #[test]
    fn builtin_lookups() {
        let registry = Registry::with_builtins();
        assert_eq!(registry.classify_by_name("Makefile").name(), "Makefile");
        assert_eq!(registry.classify_by_name("backup.tar.gz").name(), "Archive");
        assert!(registry.classify_by_name("logo.PNG").is_binary());
        assert!(registry.classify_by_name("foo.bin").is_unknown());
        assert_eq!(
            registry
                .classify_by_hash_bang("#!/usr/bin/env python3\n")
                .map(|c| c.name().to_string()),
            Some("Python".to_string())
        );
        assert_eq!(registry.classifications().len(), BUILTINS.len() + 2);
    }

    #[test]
    fn builtin_is_bundled_and_rejects_plugin_name_clash() {
        let registry = Registry::with_builtins();
        assert!(registry.provenance_of("XML").unwrap().is_bundled());
        let err = registry.register(
            Classification::builder("XML").build(),
            Provenance::plugin("other"),
            vec![],
        );
        assert!(err.is_err());
    }

    #[test]
    fn xml_prolog_detector() {
        let file = FileRef::new(FileId(1), "/a/config");
        let text = "  <?xml version=\"1.0\"?><a/>";
        let input = DetectionInput {
            file: &file,
            bytes: text.as_bytes(),
            text: Some(text),
        };
        assert_eq!(XmlPrologDetector.detect(&input).unwrap().unwrap().name(), "XML");
        let input = DetectionInput {
            file: &file,
            bytes: b"<html>",
            text: Some("<html>"),
        };
        assert!(XmlPrologDetector.detect(&input).unwrap().is_none());
    }
}
