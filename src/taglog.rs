//! Tag log format (§3, §6): the line-oriented, append-only text file the
//! Tag Collection Pass (D) writes and the Allocation Tagging Pass (E)
//! reads back.
//!
//! Grounded on §6's wire format description directly; there is no `serde`
//! use here (SPEC_FULL §3 EXPANSION: "a fixed, line-oriented textual
//! format, not a general object graph"), matching the ancestor's own
//! preference for hand-rolled `std::io` parsing over the broader pack's
//! object-graph formats.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::error::FuzzallocError;

/// One line of the tag log, minus comments and blank lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagLogRecord {
    /// `fun,<name>`
    Function { name: String },
    /// `gv,<name>`
    GlobalVariable { name: String },
    /// `ga,<name>`
    GlobalAlias { name: String },
    /// `struct,<type-name>,<element-index>,<function-name>`
    StructField { type_name: String, element_index: usize, function_name: String },
}

impl TagLogRecord {
    fn parse_line(path: &str, line_no: usize, line: &str) -> Result<Option<TagLogRecord>, FuzzallocError> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }
        let fields: Vec<&str> = trimmed.split(',').collect();
        let malformed = || FuzzallocError::MalformedRecord {
            kind: "tag log",
            path: path.to_string(),
            line: line_no,
            text: line.to_string(),
        };
        match fields.as_slice() {
            ["fun", name] => Ok(Some(TagLogRecord::Function { name: (*name).to_string() })),
            ["gv", name] => Ok(Some(TagLogRecord::GlobalVariable { name: (*name).to_string() })),
            ["ga", name] => Ok(Some(TagLogRecord::GlobalAlias { name: (*name).to_string() })),
            ["struct", type_name, index, function_name] => {
                let element_index = index.parse::<usize>().map_err(|_| malformed())?;
                Ok(Some(TagLogRecord::StructField {
                    type_name: (*type_name).to_string(),
                    element_index,
                    function_name: (*function_name).to_string(),
                }))
            }
            _ => Err(malformed()),
        }
    }

    fn render(&self) -> String {
        match self {
            TagLogRecord::Function { name } => format!("fun,{name}"),
            TagLogRecord::GlobalVariable { name } => format!("gv,{name}"),
            TagLogRecord::GlobalAlias { name } => format!("ga,{name}"),
            TagLogRecord::StructField { type_name, element_index, function_name } => {
                format!("struct,{type_name},{element_index},{function_name}")
            }
        }
    }
}

/// Reads every record in `path`, tolerating a missing file as "no records
/// yet" (the Tag Collection Pass's first invocation creates the log; only
/// the *whitelist* being missing is fatal, per §4.D).
pub fn read_all(path: &str) -> Result<Vec<TagLogRecord>, FuzzallocError> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(FuzzallocError::TagLogIoError { path: path.to_string(), source }),
    };
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| FuzzallocError::TagLogIoError { path: path.to_string(), source })?;
        if let Some(record) = TagLogRecord::parse_line(path, index + 1, &line)? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Appends `records` to the log, creating it if necessary (§3: "the file is
/// append-only across translation units").
pub fn append(path: &str, records: &[TagLogRecord]) -> Result<(), FuzzallocError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| FuzzallocError::TagLogIoError { path: path.to_string(), source })?;
    for record in records {
        writeln!(file, "{}", record.render())
            .map_err(|source| FuzzallocError::TagLogIoError { path: path.to_string(), source })?;
    }
    Ok(())
}

/// Appends only the records not already present in the log, so running the
/// collection pass twice over the same translation unit is idempotent up
/// to duplicate-line tolerance (§8 invariant 8). A `#`-prefixed separator
/// comment is written before each appended batch so successive runs remain
/// visually distinguishable in the file.
pub fn append_deduplicated(path: &str, records: &[TagLogRecord]) -> Result<(), FuzzallocError> {
    let existing = read_all(path)?;
    let fresh: Vec<TagLogRecord> = records.iter().filter(|r| !existing.contains(r)).cloned().collect();
    if fresh.is_empty() {
        return Ok(());
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| FuzzallocError::TagLogIoError { path: path.to_string(), source })?;
    writeln!(file, "# run").map_err(|source| FuzzallocError::TagLogIoError { path: path.to_string(), source })?;
    for record in &fresh {
        writeln!(file, "{}", record.render())
            .map_err(|source| FuzzallocError::TagLogIoError { path: path.to_string(), source })?;
    }
    Ok(())
}

pub fn exists(path: &str) -> bool {
    Path::new(path).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn round_trips_all_record_kinds() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        let records = vec![
            TagLogRecord::Function { name: "malloc".into() },
            TagLogRecord::GlobalVariable { name: "g_alloc_fn".into() },
            TagLogRecord::GlobalAlias { name: "alloc_alias".into() },
            TagLogRecord::StructField { type_name: "Allocator".into(), element_index: 2, function_name: "my_alloc".into() },
        ];
        append(path, &records).unwrap();
        let read_back = read_all(path).unwrap();
        assert_eq!(read_back, records);
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let records = read_all("/nonexistent/path/to/taglog.txt").unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn comment_lines_are_ignored() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        std::fs::write(path, "# a comment\nfun,malloc\n\n# another\n").unwrap();
        let records = read_all(path).unwrap();
        assert_eq!(records, vec![TagLogRecord::Function { name: "malloc".into() }]);
    }

    #[test]
    fn second_collection_run_is_idempotent_up_to_duplicates() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        let records = vec![TagLogRecord::Function { name: "malloc".into() }];
        append_deduplicated(path, &records).unwrap();
        append_deduplicated(path, &records).unwrap();
        let read_back = read_all(path).unwrap();
        assert_eq!(read_back, records);
    }

    #[test]
    fn malformed_struct_record_is_rejected() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        std::fs::write(path, "struct,Allocator,not-a-number,my_alloc\n").unwrap();
        let err = read_all(path).unwrap_err();
        assert!(matches!(err, FuzzallocError::MalformedRecord { .. }));
    }
}
