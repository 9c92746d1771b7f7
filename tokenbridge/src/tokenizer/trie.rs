//! Byte-level prefix tree over a token vocabulary

use std::collections::HashMap;

use crate::{Error, Result};

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<u8, TrieNode>,
    /// Id of the vocabulary entry ending at this node.
    token_id: Option<u32>,
}

/// Immutable prefix tree used for greedy longest-prefix matching.
#[derive(Debug, Default)]
pub struct VocabularyTrie {
    root: TrieNode,
    entries: usize,
}

impl VocabularyTrie {
    /// Build the trie from `(token bytes, id)` pairs.
    ///
    /// Empty tokens are skipped: a zero-length match would never advance.
    /// When two entries share the same bytes the smaller id wins.
    pub fn new<'a>(entries: impl IntoIterator<Item = (&'a [u8], u32)>) -> Self {
        let mut trie = Self::default();
        for (bytes, id) in entries {
            if bytes.is_empty() {
                continue;
            }
            let mut node = &mut trie.root;
            for &b in bytes {
                node = node.children.entry(b).or_default();
            }
            match node.token_id {
                None => {
                    node.token_id = Some(id);
                    trie.entries += 1;
                }
                Some(existing) if id < existing => node.token_id = Some(id),
                Some(_) => {}
            }
        }
        trie
    }

    /// Longest vocabulary entry that is a prefix of `text`.
    ///
    /// Returns the matched slice of `text` and its id.
    ///
    /// # Errors
    /// Returns [`Error::Integrity`] if no entry matches: the vocabulary lacks
    /// a single-byte fallback for `text[0]`.
    pub fn find_longest_prefix<'t>(&self, text: &'t [u8]) -> Result<(&'t [u8], u32)> {
        let mut node = &self.root;
        let mut best = None;
        for (depth, b) in text.iter().enumerate() {
            let Some(child) = node.children.get(b) else {
                break;
            };
            node = child;
            if let Some(id) = node.token_id {
                best = Some((depth + 1, id));
            }
        }
        match best {
            Some((len, id)) => Ok((&text[..len], id)),
            None => Err(Error::Integrity(match text.first() {
                Some(b) => format!("no vocabulary entry covers byte 0x{b:02x}"),
                None => "longest-prefix lookup on empty input".into(),
            })),
        }
    }

    /// Bytes with no single-byte entry. Inputs containing them can fail to
    /// tokenize.
    #[must_use]
    pub fn uncovered_bytes(&self) -> Vec<u8> {
        (0..=u8::MAX)
            .filter(|b| {
                self.root
                    .children
                    .get(b)
                    .map_or(true, |n| n.token_id.is_none())
            })
            .collect()
    }

    /// Number of distinct token texts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}
