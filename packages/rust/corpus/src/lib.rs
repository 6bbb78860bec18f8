//! Lexical retrieval over the source corpus.
//!
//! [`IndexedCorpus`] is a BM25 index built once per run from an ordered
//! sequence of [`CorpusDocument`]s. [`load_jsonl`] reads the corpus file
//! format used by the CLI (one JSON object per line).

pub mod index;
pub mod tokenizer;

use std::path::Path;

use showrunner_shared::{CorpusDocument, Result, ShowrunnerError};

pub use index::{Bm25Params, IndexedCorpus};

/// Read documents from a JSON Lines file, preserving file order.
///
/// Blank lines are skipped; a malformed line fails with its line number.
pub fn load_jsonl(path: &Path) -> Result<Vec<CorpusDocument>> {
    let content = std::fs::read_to_string(path).map_err(|e| ShowrunnerError::io(path, e))?;
    parse_jsonl(&content).map_err(|e| match e {
        ShowrunnerError::Validation { message } => {
            ShowrunnerError::validation(format!("{}: {message}", path.display()))
        }
        other => other,
    })
}

fn parse_jsonl(content: &str) -> Result<Vec<CorpusDocument>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<CorpusDocument>(line)
                .map_err(|e| ShowrunnerError::validation(format!("line {}: {e}", i + 1)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lines_in_order() {
        let content = r#"{"id":"t1","title":"On Faith","locator":"https://example.org/t1","text":"faith"}

{"id":"t2","title":"On Hope","text":"hope"}
"#;
        let docs = parse_jsonl(content).expect("parse");
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "t1");
        assert_eq!(docs[1].locator, "");
    }

    #[test]
    fn reports_bad_line_number() {
        let content = "{\"id\":\"t1\",\"title\":\"a\",\"text\":\"b\"}\nnot json\n";
        let err = parse_jsonl(content).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn load_from_disk() {
        let dir = std::env::temp_dir().join(format!("sr-corpus-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("corpus.jsonl");
        std::fs::write(&path, "{\"id\":\"a\",\"title\":\"A\",\"text\":\"grace\"}\n").unwrap();

        let docs = load_jsonl(&path).expect("load");
        let index = IndexedCorpus::build(docs, Bm25Params::default()).expect("build");
        assert_eq!(index.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }
}
