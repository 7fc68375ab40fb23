//! Character vocabulary for the sequence expander.
//!
//! Sources are encoded character by character; targets are the expansion
//! words joined with a single space, so the space character doubles as the
//! word separator.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const PAD: &str = "<PAD>";
pub const UNK: &str = "<UNK>";
pub const SOS: &str = "<SOS>";
pub const EOS: &str = "<EOS>";

pub const PAD_ID: u32 = 0;
pub const UNK_ID: u32 = 1;
pub const SOS_ID: u32 = 2;
pub const EOS_ID: u32 = 3;

const RESERVED: [&str; 4] = [PAD, UNK, SOS, EOS];

/// Bidirectional unit <-> id mapping. Ids are positional, so a vocabulary
/// must be rebuilt from the same data or restored from a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Vocab {
    id_to_unit: Vec<String>,
    unit_to_id: HashMap<String, u32>,
}

impl Vocab {
    /// Build from training pairs. Units are ordered by descending frequency,
    /// ties broken by the unit itself so the result is deterministic.
    pub fn build<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let mut counts: HashMap<char, usize> = HashMap::new();
        for (source, words) in pairs {
            for c in source.chars().chain(join_words(words).chars()) {
                *counts.entry(c).or_default() += 1;
            }
        }

        let mut units: Vec<(char, usize)> = counts.into_iter().collect();
        units.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let id_to_unit: Vec<String> = RESERVED
            .iter()
            .map(|s| s.to_string())
            .chain(units.into_iter().map(|(c, _)| c.to_string()))
            .collect();
        Self::from(id_to_unit)
    }

    pub fn len(&self) -> usize {
        self.id_to_unit.len()
    }

    /// True when only the reserved symbols are present.
    pub fn is_empty(&self) -> bool {
        self.id_to_unit.len() <= RESERVED.len()
    }

    pub fn id(&self, unit: &str) -> u32 {
        self.unit_to_id.get(unit).copied().unwrap_or(UNK_ID)
    }

    pub fn unit(&self, id: u32) -> Option<&str> {
        self.id_to_unit.get(id as usize).map(String::as_str)
    }

    /// Character ids of `text`, without boundary symbols.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut buf = [0u8; 4];
        text.chars().map(|c| self.id(c.encode_utf8(&mut buf))).collect()
    }

    /// Ids of an expansion: the words joined by spaces.
    pub fn encode_expansion(&self, words: &[String]) -> Vec<u32> {
        self.encode(&join_words(words))
    }

    /// Decode ids up to the first `<EOS>`, skipping other reserved symbols.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .take_while(|&&id| id != EOS_ID)
            .filter(|&&id| id > EOS_ID)
            .filter_map(|&id| self.unit(id))
            .collect()
    }

    /// Split decoded text back into expansion words.
    pub fn decode_expansion(&self, ids: &[u32]) -> Vec<String> {
        self.decode(ids)
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl From<Vec<String>> for Vocab {
    fn from(id_to_unit: Vec<String>) -> Self {
        let unit_to_id = id_to_unit
            .iter()
            .enumerate()
            .map(|(i, u)| (u.clone(), i as u32))
            .collect();
        Self {
            id_to_unit,
            unit_to_id,
        }
    }
}

impl From<Vocab> for Vec<String> {
    fn from(vocab: Vocab) -> Self {
        vocab.id_to_unit
    }
}

fn join_words(words: &[String]) -> String {
    words.join(" ")
}
