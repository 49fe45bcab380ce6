//! Host languages a fixture can be written in.
//!
//! The prober never parses host code. All it needs from a language is the
//! LSP language id to announce on `didOpen` and the line-comment prefix the
//! annotations live behind.

use rustc_hash::FxHashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Language {
    /// LSP `languageId`.
    pub id: &'static str,
    pub extensions: &'static [&'static str],
    /// Line-comment prefix that carries annotations.
    pub comment: &'static str,
}

const BUILTIN: &[Language] = &[
    Language {
        id: "cpp",
        extensions: &["cc", "cpp", "cxx", "hh", "hpp", "hxx", "h"],
        comment: "//",
    },
    Language {
        id: "c",
        extensions: &["c"],
        comment: "//",
    },
    Language {
        id: "java",
        extensions: &["java"],
        comment: "//",
    },
    Language {
        id: "kotlin",
        extensions: &["kt", "kts"],
        comment: "//",
    },
    Language {
        id: "rust",
        extensions: &["rs"],
        comment: "//",
    },
    Language {
        id: "go",
        extensions: &["go"],
        comment: "//",
    },
    Language {
        id: "javascript",
        extensions: &["js", "jsx", "mjs"],
        comment: "//",
    },
    Language {
        id: "typescript",
        extensions: &["ts", "tsx"],
        comment: "//",
    },
    Language {
        id: "python",
        extensions: &["py"],
        comment: "#",
    },
    Language {
        id: "shellscript",
        extensions: &["sh", "bash"],
        comment: "#",
    },
    Language {
        id: "starlark",
        extensions: &["bzl", "star"],
        comment: "#",
    },
];

pub struct LanguageRegistry {
    by_extension: FxHashMap<&'static str, Language>,
    by_id: FxHashMap<&'static str, Language>,
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            by_extension: FxHashMap::default(),
            by_id: FxHashMap::default(),
        };
        for language in BUILTIN {
            registry.register(*language);
        }
        registry
    }

    pub fn register(&mut self, language: Language) {
        for ext in language.extensions {
            self.by_extension.insert(ext, language);
        }
        self.by_id.insert(language.id, language);
    }

    pub fn get_by_extension(&self, ext: &str) -> Option<Language> {
        self.by_extension.get(ext).copied()
    }

    pub fn get_by_id(&self, id: &str) -> Option<Language> {
        self.by_id.get(id).copied()
    }

    pub fn get_for_path(&self, path: &Path) -> Option<Language> {
        let ext = path.extension()?.to_str()?;
        self.get_by_extension(&ext.to_ascii_lowercase())
    }

    /// Language for `path`, with `override_id` taking precedence when it names
    /// a known language.
    pub fn resolve(&self, path: &Path, override_id: Option<&str>) -> Option<Language> {
        override_id
            .and_then(|id| self.get_by_id(id))
            .or_else(|| self.get_for_path(path))
    }
}
