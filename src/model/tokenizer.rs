// Location: src/model/tokenizer.rs

//! Byte-level BPE tokenizer.
//!
//! Vocabulary and merge ranks come from `tokenizer.json`; special-token
//! wiring comes from `tokenizer_config.json`. Both `encode` and `decode`
//! are pure functions of the loaded vocabulary and their input.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use lazy_static::lazy_static;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Rendered in place of ids the vocabulary does not cover.
const UNKNOWN_MARKER: &str = "<unk>";

lazy_static! {
    static ref BYTE_TO_CHAR: [char; 256] = build_byte_to_char();
    static ref CHAR_TO_BYTE: HashMap<char, u8> = BYTE_TO_CHAR
        .iter()
        .enumerate()
        .map(|(byte, &ch)| (ch, byte as u8))
        .collect();
}

/// Fixed byte-to-printable-symbol table, independent of locale. Printable
/// bytes keep their own code point; the rest are remapped into the 256..
/// range so every byte has a distinct printable symbol.
fn build_byte_to_char() -> [char; 256] {
    let mut table = ['\u{fffd}'; 256];
    let mut next_remap = 0u32;
    for byte in 0u32..256 {
        let printable = (33..=126).contains(&byte)
            || (161..=172).contains(&byte)
            || (174..=255).contains(&byte);
        let code = if printable {
            byte
        } else {
            let code = 256 + next_remap;
            next_remap += 1;
            code
        };
        if let Some(ch) = char::from_u32(code) {
            table[byte as usize] = ch;
        }
    }
    table
}

/// Special-token ids and the flags that control their insertion.
#[derive(Debug, Clone, Default)]
pub struct SpecialTokens {
    /// Beginning-of-sequence token id
    pub bos_id: Option<u32>,
    /// End-of-sequence token id
    pub eos_id: Option<u32>,
    /// Unknown token id; unmapped symbols are dropped when absent
    pub unk_id: Option<u32>,
    /// Whether `encode` prepends the beginning token
    pub add_bos: bool,
    /// Whether `encode` appends the end token
    pub add_eos: bool,
}

/// Byte-level BPE tokenizer. Immutable after construction; no shared
/// mutable state across calls.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab: HashMap<String, u32>,
    id_to_token: HashMap<u32, String>,
    merge_ranks: HashMap<(String, String), u32>,
    special_ids: HashSet<u32>,
    special: SpecialTokens,
}

impl Tokenizer {
    /// Build a tokenizer from already-parsed parts. Lower merge rank means
    /// higher merge priority.
    pub fn new(
        vocab: HashMap<String, u32>,
        merges: Vec<(String, String)>,
        special: SpecialTokens,
    ) -> Self {
        let id_to_token = vocab.iter().map(|(token, &id)| (id, token.clone())).collect();
        let merge_ranks = merges
            .into_iter()
            .enumerate()
            .map(|(rank, pair)| (pair, rank as u32))
            .collect();
        let mut special_ids = HashSet::new();
        for id in [special.bos_id, special.eos_id, special.unk_id].into_iter().flatten() {
            special_ids.insert(id);
        }
        Self { vocab, id_to_token, merge_ranks, special_ids, special }
    }

    /// Load `tokenizer.json` (and `tokenizer_config.json` when present) from
    /// a model directory. Returns `Ok(None)` when no tokenizer file exists;
    /// generation is unavailable in that case but loading may proceed.
    pub fn from_dir(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join("tokenizer.json");
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let root: Value = serde_json::from_str(&text).map_err(|e| {
            EngineError::tokenizer(format!("invalid {}: {}", path.display(), e))
        })?;

        let mut vocab: HashMap<String, u32> = HashMap::new();
        if let Some(entries) = root.pointer("/model/vocab").and_then(Value::as_object) {
            for (token, id) in entries {
                if let Some(id) = id.as_u64() {
                    vocab.insert(token.clone(), id as u32);
                }
            }
        }

        let mut merges = Vec::new();
        if let Some(items) = root.pointer("/model/merges").and_then(Value::as_array) {
            for item in items {
                // Merges appear either as "left right" strings or as pairs
                match item {
                    Value::String(s) => {
                        if let Some((left, right)) = s.split_once(' ') {
                            merges.push((left.to_string(), right.to_string()));
                        }
                    }
                    Value::Array(pair) if pair.len() == 2 => {
                        if let (Some(left), Some(right)) = (pair[0].as_str(), pair[1].as_str()) {
                            merges.push((left.to_string(), right.to_string()));
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut special_ids = HashSet::new();
        if let Some(added) = root.get("added_tokens").and_then(Value::as_array) {
            for entry in added {
                let (Some(id), Some(content)) =
                    (entry.get("id").and_then(Value::as_u64), entry.get("content").and_then(Value::as_str))
                else {
                    continue;
                };
                vocab.insert(content.to_string(), id as u32);
                if entry.get("special").and_then(Value::as_bool).unwrap_or(false) {
                    special_ids.insert(id as u32);
                }
            }
        }

        if vocab.is_empty() {
            return Err(EngineError::tokenizer(format!(
                "{} contains no vocabulary",
                path.display()
            )));
        }

        let special = read_special_config(dir, &vocab);
        debug!(
            vocab = vocab.len(),
            merges = merges.len(),
            "tokenizer loaded from {}",
            path.display()
        );

        let mut tokenizer = Self::new(vocab, merges, special);
        if tokenizer.id_to_token.len() != tokenizer.vocab.len() {
            // Vocabulary invariant: one distinct id per token
            warn!(
                "vocabulary maps {} tokens onto {} ids",
                tokenizer.vocab.len(),
                tokenizer.id_to_token.len()
            );
        }
        tokenizer.special_ids.extend(special_ids);
        Ok(Some(tokenizer))
    }

    /// Convert text to token ids.
    ///
    /// Splits on whitespace, runs the merge loop over each word's byte
    /// symbols, and maps the final symbols to ids. Unmapped symbols become
    /// the unknown id when one is configured and are dropped otherwise.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        if self.special.add_bos {
            if let Some(bos) = self.special.bos_id {
                ids.push(bos);
            }
        }
        for word in text.split_whitespace() {
            self.encode_word(word, &mut ids);
        }
        if self.special.add_eos {
            if let Some(eos) = self.special.eos_id {
                ids.push(eos);
            }
        }
        ids
    }

    fn encode_word(&self, word: &str, out: &mut Vec<u32>) {
        let mut symbols: Vec<String> = word
            .bytes()
            .map(|b| BYTE_TO_CHAR[b as usize].to_string())
            .collect();

        while symbols.len() > 1 {
            let Some((left, right)) = self.best_pair(&symbols) else {
                break;
            };
            let mut merged = Vec::with_capacity(symbols.len());
            let mut i = 0;
            while i < symbols.len() {
                if i + 1 < symbols.len() && symbols[i] == left && symbols[i + 1] == right {
                    merged.push(format!("{}{}", left, right));
                    i += 2;
                } else {
                    merged.push(symbols[i].clone());
                    i += 1;
                }
            }
            symbols = merged;
        }

        for symbol in symbols {
            if let Some(&id) = self.vocab.get(&symbol) {
                out.push(id);
            } else if let Some(unk) = self.special.unk_id {
                out.push(unk);
            }
        }
    }

    /// The adjacent pair with the lowest merge rank, if any pair has one.
    fn best_pair(&self, symbols: &[String]) -> Option<(String, String)> {
        let mut best: Option<(String, String)> = None;
        let mut best_rank = u32::MAX;
        for window in symbols.windows(2) {
            let pair = (window[0].clone(), window[1].clone());
            if let Some(&rank) = self.merge_ranks.get(&pair) {
                if rank < best_rank {
                    best_rank = rank;
                    best = Some(pair);
                }
            }
        }
        best
    }

    /// Convert token ids back to text.
    ///
    /// Beginning/end-of-sequence ids are skipped, other special ids are
    /// emitted literally, and unmapped ids render the unknown marker.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut out = String::new();
        let mut pending = String::new();
        for &id in ids {
            if Some(id) == self.special.bos_id || Some(id) == self.special.eos_id {
                continue;
            }
            if self.special_ids.contains(&id) {
                flush_symbols(&mut pending, &mut out);
                if let Some(token) = self.id_to_token.get(&id) {
                    out.push_str(token);
                }
                continue;
            }
            match self.id_to_token.get(&id) {
                Some(token) => pending.push_str(token),
                None => {
                    flush_symbols(&mut pending, &mut out);
                    out.push_str(UNKNOWN_MARKER);
                }
            }
        }
        flush_symbols(&mut pending, &mut out);
        out
    }

    /// Number of distinct tokens in the vocabulary.
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// The end-of-sequence id, when configured.
    pub fn eos_id(&self) -> Option<u32> {
        self.special.eos_id
    }

    /// Look up a token's id.
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.vocab.get(token).copied()
    }

    /// Look up an id's token text.
    pub fn id_to_token(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(&id).map(String::as_str)
    }
}

/// Map accumulated byte-level symbols back to bytes and append the decoded
/// text. Symbols outside the byte table pass through as themselves.
fn flush_symbols(pending: &mut String, out: &mut String) {
    if pending.is_empty() {
        return;
    }
    let mut bytes = Vec::with_capacity(pending.len());
    for ch in pending.chars() {
        match CHAR_TO_BYTE.get(&ch) {
            Some(&byte) => bytes.push(byte),
            None => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push_str(&String::from_utf8_lossy(&bytes));
    pending.clear();
}

/// Read bos/eos/unk wiring from `tokenizer_config.json`. Token entries may
/// be plain strings or `{"content": ...}` objects.
fn read_special_config(dir: &Path, vocab: &HashMap<String, u32>) -> SpecialTokens {
    let mut special = SpecialTokens::default();
    let path = dir.join("tokenizer_config.json");
    let Ok(text) = fs::read_to_string(&path) else {
        return special;
    };
    let Ok(root) = serde_json::from_str::<Value>(&text) else {
        return special;
    };

    let token_text = |key: &str| -> Option<String> {
        match root.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => obj.get("content")?.as_str().map(String::from),
            _ => None,
        }
    };

    special.bos_id = token_text("bos_token").and_then(|t| vocab.get(&t).copied());
    special.eos_id = token_text("eos_token").and_then(|t| vocab.get(&t).copied());
    special.unk_id = token_text("unk_token").and_then(|t| vocab.get(&t).copied());
    special.add_bos = root.get("add_bos_token").and_then(Value::as_bool).unwrap_or(false);
    special.add_eos = root.get("add_eos_token").and_then(Value::as_bool).unwrap_or(false);
    special
}
