//! # CoNLL-U Candidate Source
//!
//! Reads the token/word layer of CoNLL-U files, exposes multi-word token
//! training pairs and prediction candidates, and writes predicted
//! expansions back out in the same format.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use regex::Regex;

use crate::error::{Result, WakachiError};
use crate::persist::write_atomic;

/// MISC flag a tokenizer sets on tokens that still need expanding.
const MWT_FLAG: &str = "MWT=Yes";

/// One surface token and the syntactic words it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Surface form.
    pub form: String,
    /// Word forms, in order. A plain token has exactly one word equal to its form.
    pub words: Vec<String>,
    /// Whether this token is submitted to the expander.
    pub candidate: bool,
}

impl Token {
    /// A token that is its own single word.
    pub fn plain(form: impl Into<String>) -> Self {
        let form = form.into();
        Self {
            words: vec![form.clone()],
            form,
            candidate: false,
        }
    }

    /// A multi-word token with its gold expansion.
    pub fn multi(form: impl Into<String>, words: Vec<String>) -> Self {
        Self {
            form: form.into(),
            words,
            candidate: true,
        }
    }

    /// True when the token is written as a range line.
    pub fn is_multiword(&self) -> bool {
        self.words.len() > 1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sentence {
    /// Comment lines, including the leading `#`.
    pub comments: Vec<String>,
    pub tokens: Vec<Token>,
}

/// Position of a candidate inside a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub sentence: usize,
    pub token: usize,
    pub form: String,
}

/// Line-level CoNLL-U reader.
#[derive(Debug, Clone)]
pub struct ConlluReader {
    re_range: Regex,
    re_empty_node: Regex,
    re_word: Regex,
}

impl ConlluReader {
    /// Create a reader with compiled ID patterns.
    pub fn new() -> Result<Self> {
        Ok(Self {
            re_range: Regex::new(r"^(\d+)-(\d+)$")?,
            re_empty_node: Regex::new(r"^\d+\.\d+$")?,
            re_word: Regex::new(r"^\d+$")?,
        })
    }

    /// Parse CoNLL-U text.
    pub fn parse(&self, text: &str) -> Result<Document> {
        let mut sentences = Vec::new();
        let mut current = Sentence::default();
        // Words still owed to the last range line: (remaining, token index).
        let mut pending: Option<(usize, usize)> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim_end_matches('\r');

            if line.trim().is_empty() {
                if let Some((remaining, _)) = pending {
                    return Err(malformed(
                        line_no,
                        format!("sentence ended with {remaining} words of a multi-word token missing"),
                    ));
                }
                if !current.tokens.is_empty() || !current.comments.is_empty() {
                    sentences.push(std::mem::take(&mut current));
                }
                continue;
            }

            if line.starts_with('#') {
                current.comments.push(line.to_string());
                continue;
            }

            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 2 {
                return Err(malformed(line_no, "expected at least ID and FORM columns".into()));
            }
            let (id, form) = (cols[0], cols[1]);

            if self.re_empty_node.is_match(id) {
                continue;
            }

            if let Some(caps) = self.re_range.captures(id) {
                if pending.is_some() {
                    return Err(malformed(line_no, "nested multi-word token range".into()));
                }
                let start: usize = caps[1].parse().map_err(|_| malformed(line_no, "bad range".into()))?;
                let end: usize = caps[2].parse().map_err(|_| malformed(line_no, "bad range".into()))?;
                if end <= start {
                    return Err(malformed(line_no, format!("empty range {id}")));
                }
                current.tokens.push(Token {
                    form: form.to_string(),
                    words: Vec::with_capacity(end - start + 1),
                    candidate: true,
                });
                pending = Some((end - start + 1, current.tokens.len() - 1));
                continue;
            }

            if !self.re_word.is_match(id) {
                return Err(malformed(line_no, format!("unrecognised ID {id:?}")));
            }

            match pending {
                Some((remaining, token_idx)) => {
                    current.tokens[token_idx].words.push(form.to_string());
                    pending = (remaining > 1).then(|| (remaining - 1, token_idx));
                }
                None => {
                    let misc = cols.get(9).copied().unwrap_or("_");
                    let mut token = Token::plain(form);
                    token.candidate = misc.split('|').any(|f| f == MWT_FLAG);
                    current.tokens.push(token);
                }
            }
        }

        if let Some((remaining, _)) = pending {
            return Err(malformed(
                text.lines().count() + 1,
                format!("file ended with {remaining} words of a multi-word token missing"),
            ));
        }
        if !current.tokens.is_empty() || !current.comments.is_empty() {
            sentences.push(current);
        }

        Ok(Document { sentences })
    }
}

/// A parsed CoNLL-U file, reduced to the token/word layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub sentences: Vec<Sentence>,
}

impl Document {
    /// Read and parse a CoNLL-U file.
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| WakachiError::io(path, e))?;
        Self::parse(&text)
    }

    /// Parse CoNLL-U text.
    pub fn parse(text: &str) -> Result<Self> {
        ConlluReader::new()?.parse(text)
    }

    /// (form, gold words) for every multi-word token, in document order.
    pub fn expansions(&self) -> Vec<(String, Vec<String>)> {
        self.tokens()
            .filter(|t| t.is_multiword())
            .map(|t| (t.form.clone(), t.words.clone()))
            .collect()
    }

    /// Every token the expander must decide on, in document order.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.sentences
            .iter()
            .enumerate()
            .flat_map(|(s, sent)| {
                sent.tokens
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.candidate)
                    .map(move |(t, tok)| Candidate {
                        sentence: s,
                        token: t,
                        form: tok.form.clone(),
                    })
            })
            .collect()
    }

    /// Copy of this document with each candidate's words replaced by the
    /// prediction at the same position of `predictions`.
    ///
    /// An empty prediction leaves the token unexpanded.
    pub fn with_expansions(&self, predictions: &[Vec<String>]) -> Result<Self> {
        let candidates = self.candidates();
        if candidates.len() != predictions.len() {
            return Err(WakachiError::PredictionCount {
                expected: candidates.len(),
                found: predictions.len(),
            });
        }

        let mut doc = self.clone();
        for (cand, words) in candidates.iter().zip(predictions) {
            let token = &mut doc.sentences[cand.sentence].tokens[cand.token];
            token.words = if words.is_empty() {
                vec![token.form.clone()]
            } else {
                words.clone()
            };
        }
        Ok(doc)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.sentences.iter().flat_map(|s| s.tokens.iter())
    }

    /// Serialize to CoNLL-U text with freshly numbered word ids.
    pub fn to_conllu(&self) -> String {
        let mut out = String::new();
        for sent in &self.sentences {
            for comment in &sent.comments {
                out.push_str(comment);
                out.push('\n');
            }
            let mut next_id = 1usize;
            for token in &sent.tokens {
                if token.is_multiword() {
                    let end = next_id + token.words.len() - 1;
                    let _ = writeln!(out, "{next_id}-{end}\t{}{}", token.form, EMPTY_COLUMNS);
                    for word in &token.words {
                        let _ = writeln!(out, "{next_id}\t{word}{EMPTY_COLUMNS}");
                        next_id += 1;
                    }
                } else {
                    let form = token.words.first().unwrap_or(&token.form);
                    let _ = writeln!(out, "{next_id}\t{form}{EMPTY_COLUMNS}");
                    next_id += 1;
                }
            }
            out.push('\n');
        }
        out
    }

    /// Write to `path`, replacing it atomically.
    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.to_conllu().as_bytes())
    }
}

/// LEMMA through MISC, all unspecified.
const EMPTY_COLUMNS: &str = "\t_\t_\t_\t_\t_\t_\t_\t_";

fn malformed(line: usize, reason: String) -> WakachiError {
    WakachiError::MalformedConllu { line, reason }
}
