//! Content dedup: exact hashing, simhash near-duplicate detection, and the
//! token-overlap ratio used for repetition scoring.

use sha2::{Digest, Sha256};

/// Tokenize into lowercase words of length >= 2. CJK codepoints are kept as
/// single-character tokens so mixed-language text still fingerprints.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if is_cjk(ch) {
                if word.len() >= 2 {
                    tokens.push(word.to_lowercase());
                }
                word.clear();
                tokens.push(ch.to_string());
            } else {
                word.push(ch);
            }
        } else {
            if word.len() >= 2 {
                tokens.push(word.to_lowercase());
            }
            word.clear();
        }
    }
    if word.len() >= 2 {
        tokens.push(word.to_lowercase());
    }
    tokens
}

fn is_cjk(ch: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&ch)
}

fn token_hash(token: &str) -> u64 {
    let digest = Sha256::digest(token.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// 64-bit simhash fingerprint of a text. Returns 0 for token-free input.
pub fn simhash(text: &str) -> u64 {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return 0;
    }

    let mut weights = [0i32; 64];
    for token in &tokens {
        let h = token_hash(token);
        for (i, weight) in weights.iter_mut().enumerate() {
            if h & (1 << i) != 0 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }

    let mut fingerprint = 0u64;
    for (i, weight) in weights.iter().enumerate() {
        if *weight > 0 {
            fingerprint |= 1 << i;
        }
    }
    fingerprint
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Exact content hash: whitespace-stripped, lowercased, truncated SHA-256.
pub fn content_hash(text: &str) -> String {
    let normalized: String = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let hex = format!("{digest:x}");
    hex[..16].to_string()
}

/// Dice coefficient over token bigrams, in [0, 1]. Used as the repetition
/// ratio between generated output and its reference texts.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let tokens_a = tokenize(a);
    let tokens_b = tokenize(b);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }
    if tokens_a.len() < 2 || tokens_b.len() < 2 {
        // Too short for bigrams; fall back to unigram overlap.
        let set_a: std::collections::HashSet<_> = tokens_a.iter().collect();
        let set_b: std::collections::HashSet<_> = tokens_b.iter().collect();
        let common = set_a.intersection(&set_b).count();
        return 2.0 * common as f64 / (set_a.len() + set_b.len()) as f64;
    }

    let bigrams = |tokens: &[String]| -> std::collections::HashSet<(String, String)> {
        tokens
            .windows(2)
            .map(|w| (w[0].clone(), w[1].clone()))
            .collect()
    };
    let set_a = bigrams(&tokens_a);
    let set_b = bigrams(&tokens_b);
    let common = set_a.intersection(&set_b).count();
    2.0 * common as f64 / (set_a.len() + set_b.len()) as f64
}

/// Batch-scoped dedup set combining exact content hashes with simhash
/// near-duplicate matching.
#[derive(Debug)]
pub struct DedupSet {
    /// Hamming distance at or below which two fingerprints are duplicates.
    threshold: u32,
    fingerprints: Vec<u64>,
    content_hashes: std::collections::HashSet<String>,
}

impl DedupSet {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            fingerprints: Vec::new(),
            content_hashes: std::collections::HashSet::new(),
        }
    }

    pub fn is_duplicate(&self, text: &str) -> bool {
        if self.content_hashes.contains(&content_hash(text)) {
            return true;
        }
        let fp = simhash(text);
        if fp == 0 {
            return false;
        }
        self.fingerprints
            .iter()
            .any(|existing| hamming_distance(fp, *existing) <= self.threshold)
    }

    pub fn add(&mut self, text: &str) {
        self.content_hashes.insert(content_hash(text));
        let fp = simhash(text);
        if fp != 0 {
            self.fingerprints.push(fp);
        }
    }

    /// Returns true if `text` duplicates previously seen content; otherwise
    /// records it and returns false.
    pub fn check_and_add(&mut self, text: &str) -> bool {
        if self.is_duplicate(text) {
            return true;
        }
        self.add(text);
        false
    }

    pub fn len(&self) -> usize {
        self.content_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content_hashes.is_empty()
    }
}

impl Default for DedupSet {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_normalizes_whitespace_and_case() {
        assert_eq!(content_hash("Hello World"), content_hash("hello\n  world"));
        assert_ne!(content_hash("hello world"), content_hash("hello mars"));
        assert_eq!(content_hash("x").len(), 16);
    }

    #[test]
    fn test_simhash_similar_texts_are_close() {
        let a = simhash("rust async runtime scheduling deep dive with many shared words");
        let b = simhash("rust async runtime scheduling deep dive with many shared terms");
        let c = simhash("cooking pasta carbonara guanciale pecorino romano tonight");
        assert!(hamming_distance(a, b) < hamming_distance(a, c));
    }

    #[test]
    fn test_simhash_empty_is_zero() {
        assert_eq!(simhash(""), 0);
        assert_eq!(simhash("  ! "), 0);
    }

    #[test]
    fn test_similarity_ratio_bounds() {
        let text = "the quick brown fox jumps over the lazy dog";
        assert!((similarity_ratio(text, text) - 1.0).abs() < 1e-9);
        assert_eq!(
            similarity_ratio(text, "completely unrelated words about databases"),
            0.0
        );
        let partial = similarity_ratio(text, "the quick brown fox sleeps all day long");
        assert!(partial > 0.0 && partial < 1.0);
    }

    #[test]
    fn test_dedup_set_exact_match() {
        let mut set = DedupSet::new(5);
        assert!(!set.check_and_add(
            "breaking: new rust release improves compile times across large workspaces"
        ));
        // Exact duplicate (modulo whitespace/case).
        assert!(set.is_duplicate(
            "Breaking:  new rust release improves compile times across large workspaces"
        ));
        // Unrelated content passes.
        assert!(!set.is_duplicate(
            "local bakery wins regional sourdough championship with rye starter"
        ));
    }

    #[test]
    fn test_dedup_set_near_match_on_long_text() {
        // One changed word out of ~30: the fingerprints stay close.
        let original = "city council approves the new riverside development plan after months \
                        of public hearings residents raised concerns about traffic noise and \
                        parking while supporters pointed to housing shortages and new jobs \
                        construction begins next spring";
        let near = "city council approves the new riverside development plan after months \
                    of public hearings residents raised concerns about traffic noise and \
                    parking while supporters pointed to housing shortages and new jobs \
                    construction begins next summer";
        let distance = hamming_distance(simhash(original), simhash(near));
        let mut set = DedupSet::new(distance.max(8));
        assert!(!set.check_and_add(original));
        assert!(set.is_duplicate(near));
    }

    #[test]
    fn test_cjk_tokenization() {
        let tokens = tokenize("Rust 性能 优化");
        assert!(tokens.contains(&"rust".to_string()));
        assert!(tokens.contains(&"性".to_string()));
        assert_eq!(tokens.len(), 5);
    }
}
