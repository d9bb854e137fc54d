//! Whitelist / special-case list format (§4.D, GLOSSARY): the caller-
//! supplied list of user-defined allocator wrappers the Tag Collection
//! Pass treats as additional entry points alongside `malloc`/`calloc`/
//! `realloc`.
//!
//! Format follows the sanitizer special-case list convention referenced by
//! §4.D: sections introduced by `[section]`, entries `kind:name`, `#`
//! comments. Only the `fuzzalloc` section is meaningful here (GLOSSARY:
//! "structured by section tag (fuzzalloc), kind (fun, gv), and name").

use std::collections::HashSet;
use std::io::BufRead;

use crate::error::FuzzallocError;

const SECTION: &str = "fuzzalloc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Function,
    GlobalVariable,
}

impl EntryKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "fun" => Some(EntryKind::Function),
            "gv" => Some(EntryKind::GlobalVariable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    functions: HashSet<String>,
    global_variables: HashSet<String>,
}

impl Whitelist {
    pub fn is_whitelisted_function(&self, name: &str) -> bool {
        self.functions.contains(name)
    }

    pub fn is_whitelisted_global(&self, name: &str) -> bool {
        self.global_variables.contains(name)
    }

    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(String::as_str)
    }

    /// Loads a special-case list from `path`. A missing whitelist file is
    /// fatal (§4.D: "Missing whitelist file is fatal"), matching D's own
    /// failure semantics — this is the one place that distinction from
    /// `taglog::read_all`'s "missing means empty" matters.
    pub fn load(path: &str) -> Result<Whitelist, FuzzallocError> {
        let file = std::fs::File::open(path)
            .map_err(|source| FuzzallocError::WhitelistIoError { path: path.to_string(), source })?;
        let reader = std::io::BufReader::new(file);

        let mut whitelist = Whitelist::default();
        let mut current_section: Option<String> = None;

        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| FuzzallocError::WhitelistIoError { path: path.to_string(), source })?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(section) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                current_section = Some(section.to_string());
                continue;
            }
            if current_section.as_deref() != Some(SECTION) {
                continue;
            }
            let Some((kind_raw, name)) = trimmed.split_once(':') else {
                return Err(FuzzallocError::MalformedRecord {
                    kind: "whitelist",
                    path: path.to_string(),
                    line: index + 1,
                    text: line,
                });
            };
            match EntryKind::parse(kind_raw) {
                Some(EntryKind::Function) => {
                    whitelist.functions.insert(name.to_string());
                }
                Some(EntryKind::GlobalVariable) => {
                    whitelist.global_variables.insert(name.to_string());
                }
                None => {
                    return Err(FuzzallocError::MalformedRecord {
                        kind: "whitelist",
                        path: path.to_string(),
                        line: index + 1,
                        text: line,
                    });
                }
            }
        }

        Ok(whitelist)
    }
}
