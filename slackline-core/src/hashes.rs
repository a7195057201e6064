// ABOUTME: Short, prefix-unique message hashes derived from timestamp digests
// ABOUTME: Bidirectional ts<->hash index with minimal-length assignment and collision repair

use crate::metrics;
use crate::timestamp::ConversationTimestamp;
use sha1::{Digest, Sha1};
use std::collections::HashMap;

const MIN_HASH_LEN: usize = 3;

/// Maps a timestamp to its full-length hash string.
pub type DigestFn = fn(&ConversationTimestamp) -> String;

/// Lowercase hex SHA-1 of the timestamp's original text.
pub fn sha1_hex(ts: &ConversationTimestamp) -> String {
    format!("{:x}", Sha1::digest(ts.as_str().as_bytes()))
}

/// An older message whose hash had to be lengthened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashBump {
    pub ts: ConversationTimestamp,
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashAssignment {
    pub hash: String,
    /// Set when assigning this hash lengthened another message's hash.
    pub bumped: Option<HashBump>,
}

/// Per-conversation hash index. No live hash is a prefix of another.
#[derive(Debug, Clone)]
pub struct MessageHashes {
    by_ts: HashMap<ConversationTimestamp, String>,
    by_hash: HashMap<String, ConversationTimestamp>,
    digest: DigestFn,
}

impl Default for MessageHashes {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHashes {
    pub fn new() -> Self {
        Self::with_digest(sha1_hex)
    }

    pub fn with_digest(digest: DigestFn) -> Self {
        Self {
            by_ts: HashMap::new(),
            by_hash: HashMap::new(),
            digest,
        }
    }

    pub fn len(&self) -> usize {
        self.by_ts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ts.is_empty()
    }

    pub fn get(&self, ts: &ConversationTimestamp) -> Option<&str> {
        self.by_ts.get(ts).map(String::as_str)
    }

    /// Resolve a user-typed hash, with or without its leading `$`.
    pub fn ts_for(&self, hash: &str) -> Option<&ConversationTimestamp> {
        self.by_hash.get(hash.strip_prefix('$').unwrap_or(hash))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConversationTimestamp, &str)> {
        self.by_ts.iter().map(|(ts, hash)| (ts, hash.as_str()))
    }

    /// Drop `ts` from both directions of the index.
    pub fn remove(&mut self, ts: &ConversationTimestamp) -> Option<String> {
        let hash = self.by_ts.remove(ts)?;
        self.by_hash.remove(&hash);
        Some(hash)
    }

    /// The hash for `ts`, assigning the shortest non-colliding one on first use.
    ///
    /// If the new hash would extend an existing shorter hash, that older entry
    /// is lengthened until the two differ and reported in `bumped` so the
    /// caller can refresh its display.
    pub fn hash_for(&mut self, ts: &ConversationTimestamp) -> HashAssignment {
        if let Some(hash) = self.by_ts.get(ts) {
            return HashAssignment {
                hash: hash.clone(),
                bumped: None,
            };
        }

        let full = (self.digest)(ts);
        let mut len = MIN_HASH_LEN.min(full.len());
        while len < full.len() && self.by_hash.keys().any(|h| h.starts_with(&full[..len])) {
            len += 1;
        }

        let mut bumped = None;
        if len > 1 {
            if let Some(other_ts) = self.by_hash.remove(&full[..len - 1]) {
                let other_full = (self.digest)(&other_ts);
                let old = full[..len - 1].to_string();
                while len < full.len() && len < other_full.len() && full[..len] == other_full[..len] {
                    len += 1;
                }
                let new = other_full[..len.min(other_full.len())].to_string();
                tracing::debug!(ts = %other_ts, old = %old, new = %new, "Lengthened colliding message hash");
                metrics::record_hash_bump();
                self.by_ts.insert(other_ts.clone(), new.clone());
                self.by_hash.insert(new.clone(), other_ts.clone());
                bumped = Some(HashBump {
                    ts: other_ts,
                    old,
                    new,
                });
            }
        }

        let hash = full[..len].to_string();
        if self.by_hash.contains_key(&hash) {
            tracing::warn!(ts = %ts, hash = %hash, "Digest exhausted without a unique hash");
        }
        self.by_ts.insert(ts.clone(), hash.clone());
        self.by_hash.insert(hash.clone(), ts.clone());
        HashAssignment { hash, bumped }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(raw: &str) -> ConversationTimestamp {
        raw.parse().unwrap()
    }

    /// Digest that makes "1.0" and "2.0" share "abc", "3.0" share "ab".
    fn colliding_digest(ts: &ConversationTimestamp) -> String {
        match ts.as_str() {
            "1.0" => "abc1111".to_string(),
            "2.0" => "abc1222".to_string(),
            "3.0" => "ab93333".to_string(),
            _ => sha1_hex(ts),
        }
    }

    #[test]
    fn test_sha1_hex_of_raw_text() {
        assert_eq!(sha1_hex(&ts("1.0")), "e8dc057d3346e56aed7cf252185dbe1fa6454411");
        assert_eq!(sha1_hex(&ts("1.0")).len(), 40);
        assert_ne!(sha1_hex(&ts("1.0")), sha1_hex(&ts("1.00")));
    }

    #[test]
    fn test_distinct_prefixes_get_three_chars() {
        let mut hashes = MessageHashes::new();
        for raw in ["1.0", "2.0", "3.0"] {
            let assigned = hashes.hash_for(&ts(raw));
            assert_eq!(assigned.hash.len(), 3);
            assert_eq!(assigned.hash, sha1_hex(&ts(raw))[..3]);
            assert!(assigned.bumped.is_none());
        }
    }

    #[test]
    fn test_second_colliding_message_bumps_first() {
        let mut hashes = MessageHashes::with_digest(colliding_digest);
        assert_eq!(hashes.hash_for(&ts("1.0")).hash, "abc");

        let second = hashes.hash_for(&ts("2.0"));
        assert_eq!(second.hash, "abc12");
        assert_eq!(
            second.bumped,
            Some(HashBump {
                ts: ts("1.0"),
                old: "abc".to_string(),
                new: "abc11".to_string(),
            })
        );
        assert_eq!(hashes.get(&ts("1.0")), Some("abc11"));
        assert_eq!(hashes.ts_for("abc11"), Some(&ts("1.0")));
        assert_eq!(hashes.ts_for("abc"), None);
    }

    #[test]
    fn test_hash_is_stable_once_assigned() {
        let mut hashes = MessageHashes::with_digest(colliding_digest);
        let first = hashes.hash_for(&ts("3.0")).hash;
        hashes.hash_for(&ts("1.0"));
        assert_eq!(hashes.hash_for(&ts("3.0")).hash, first);
    }

    #[test]
    fn test_ts_for_accepts_dollar_prefix() {
        let mut hashes = MessageHashes::with_digest(colliding_digest);
        hashes.hash_for(&ts("3.0"));
        assert_eq!(hashes.ts_for("$ab9"), Some(&ts("3.0")));
        assert_eq!(hashes.ts_for("ab9"), Some(&ts("3.0")));
    }

    #[test]
    fn test_remove_clears_both_directions() {
        let mut hashes = MessageHashes::with_digest(colliding_digest);
        hashes.hash_for(&ts("1.0"));
        assert_eq!(hashes.remove(&ts("1.0")), Some("abc".to_string()));
        assert!(hashes.ts_for("abc").is_none());
        assert!(hashes.is_empty());
        // Without the old entry, the next collider keeps the short form.
        assert_eq!(hashes.hash_for(&ts("2.0")).hash, "abc");
    }
}
