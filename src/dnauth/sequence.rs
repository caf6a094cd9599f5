//! Nucleotide sequence helpers: validation, the standard genetic code,
//! edit distance, match modes, and complexity analysis.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Valid nucleotides.
pub const ALPHABET: [u8; 4] = *b"ATGC";

/// Standard genetic code in TCAG order; `*` marks a stop codon.
const GENETIC_CODE: &[u8; 64] =
    b"FFLLSSSSYY**CC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG";

/// Shortest run counted as a long repeat or a palindrome.
const MOTIF_LEN: usize = 6;

/// How a candidate sequence is compared to the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchMode {
    /// Byte equality.
    Exact,
    /// Edit-distance tolerance through `authenticate_fuzzy`; plain
    /// authentication stays exact.
    Fuzzy,
    /// Triplet-wise comparison where synonymous codons match.
    Codon,
    /// Equality of the translated amino-acid strings.
    Protein,
}

impl MatchMode {
    /// Upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "EXACT",
            Self::Fuzzy => "FUZZY",
            Self::Codon => "CODON",
            Self::Protein => "PROTEIN",
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse sequence strength.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Low entropy or long simple repeats.
    Low,
    /// Moderate entropy, or a nucleotide is missing.
    Medium,
    /// Good entropy.
    High,
    /// Near-maximal entropy with every nucleotide present.
    Genomic,
}

impl Complexity {
    /// Lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Genomic => "genomic",
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uppercase and drop whitespace.
pub fn normalize(seq: &str) -> String {
    seq.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Normalise and check alphabet and length bounds.
///
/// # Errors
///
/// Returns [`CoreError::InvalidInput`] for a foreign symbol or a length
/// outside `min..=max`.
pub fn validate(seq: &str, min: usize, max: usize) -> Result<String, CoreError> {
    let seq = normalize(seq);
    if let Some(bad) = seq.bytes().find(|b| !ALPHABET.contains(b)) {
        return Err(CoreError::InvalidInput(format!(
            "invalid nucleotide {:?}",
            char::from(bad)
        )));
    }
    if seq.len() < min {
        return Err(CoreError::InvalidInput(format!(
            "sequence too short: {} < {min}",
            seq.len()
        )));
    }
    if seq.len() > max {
        return Err(CoreError::InvalidInput(format!(
            "sequence too long: {} > {max}",
            seq.len()
        )));
    }
    Ok(seq)
}

/// Watson-Crick partner of one nucleotide; other bytes pass through.
pub fn complement_base(b: u8) -> u8 {
    match b {
        b'A' => b'T',
        b'T' => b'A',
        b'G' => b'C',
        b'C' => b'G',
        other => other,
    }
}

/// Complement strand.
pub fn complement(seq: &str) -> String {
    seq.bytes().map(|b| char::from(complement_base(b))).collect()
}

/// Reverse complement strand.
pub fn reverse_complement(seq: &str) -> String {
    seq.bytes()
        .rev()
        .map(|b| char::from(complement_base(b)))
        .collect()
}

/// DNA to RNA (T becomes U).
pub fn transcribe(seq: &str) -> String {
    seq.chars().map(|c| if c == 'T' { 'U' } else { c }).collect()
}

fn base_index(b: u8) -> Option<usize> {
    match b {
        b'T' | b'U' => Some(0),
        b'C' => Some(1),
        b'A' => Some(2),
        b'G' => Some(3),
        _ => None,
    }
}

/// Amino acid for one codon; `None` for a malformed triplet.
pub fn amino_acid(codon: &[u8]) -> Option<char> {
    let [a, b, c] = codon else {
        return None;
    };
    let idx = base_index(*a)?
        .checked_mul(16)?
        .checked_add(base_index(*b)?.checked_mul(4)?)?
        .checked_add(base_index(*c)?)?;
    GENETIC_CODE.get(idx).map(|aa| char::from(*aa))
}

/// Translate whole codons; trailing bases are ignored. Stops render as `*`.
pub fn translate(seq: &str) -> String {
    seq.as_bytes()
        .chunks_exact(3)
        .map(|codon| amino_acid(codon).unwrap_or('X'))
        .collect()
}

/// Levenshtein distance.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len().saturating_add(1)];
    for (i, ca) in a.iter().enumerate() {
        if let Some(first) = curr.first_mut() {
            *first = i.saturating_add(1);
        }
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            let substitute = prev.get(j).copied().unwrap_or(0).saturating_add(cost);
            let delete = prev.get(j.saturating_add(1)).copied().unwrap_or(0).saturating_add(1);
            let insert = curr.get(j).copied().unwrap_or(0).saturating_add(1);
            if let Some(slot) = curr.get_mut(j.saturating_add(1)) {
                *slot = substitute.min(delete).min(insert);
            }
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev.last().copied().unwrap_or(0)
}

/// `1 - distance / max(len)`; 1.0 for two empty strings.
#[allow(clippy::cast_precision_loss)]
pub fn similarity(distance: usize, a_len: usize, b_len: usize) -> f64 {
    let longest = a_len.max(b_len);
    if longest == 0 {
        return 1.0;
    }
    (1.0 - distance as f64 / longest as f64).max(0.0)
}

/// Triplet-wise comparison. Synonymous codons match; one in ten whole
/// triplets may differ outright. Lengths and trailing bases must agree.
pub fn codon_match(stored: &str, candidate: &str) -> bool {
    if stored.len() != candidate.len() {
        return false;
    }
    let s = stored.as_bytes();
    let c = candidate.as_bytes();
    let whole = s.len().checked_div(3).unwrap_or(0).saturating_mul(3);
    if s.get(whole..) != c.get(whole..) {
        return false;
    }
    let allowed = whole.checked_div(30).unwrap_or(0);
    let mismatched = s
        .chunks_exact(3)
        .zip(c.chunks_exact(3))
        .filter(|(x, y)| x != y && amino_acid(x) != amino_acid(y))
        .count();
    mismatched <= allowed
}

/// Equality of translations.
pub fn protein_match(stored: &str, candidate: &str) -> bool {
    let a = translate(stored);
    !a.is_empty() && a == translate(candidate)
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Composition and strength of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceAnalysis {
    /// Normalised length.
    pub length: usize,
    /// Shannon entropy in bits per base (0.0 to 2.0).
    pub entropy: f64,
    /// Fraction of G and C.
    pub gc_content: f64,
    /// Longest homopolymer or dinucleotide run.
    pub longest_repeat: usize,
    /// Whether `longest_repeat` reaches six.
    pub has_repeats: bool,
    /// Whether a reverse-complement palindrome of six or more occurs.
    pub has_palindrome: bool,
    /// Distinct codons among whole triplets.
    pub codon_diversity: usize,
    /// Strength class.
    pub complexity: Complexity,
    /// Human-readable problems.
    pub warnings: Vec<String>,
    /// Medium or better, no long repeats, entropy of at least 1.5.
    pub acceptable: bool,
}

fn counts(seq: &[u8]) -> [usize; 4] {
    let mut out = [0usize; 4];
    for b in seq {
        if let Some(slot) = ALPHABET
            .iter()
            .position(|a| a == b)
            .and_then(|i| out.get_mut(i))
        {
            *slot = slot.saturating_add(1);
        }
    }
    out
}

/// Shannon entropy in bits per base.
#[allow(clippy::cast_precision_loss)]
pub fn entropy(seq: &str) -> f64 {
    let len = seq.len();
    if len == 0 {
        return 0.0;
    }
    counts(seq.as_bytes())
        .iter()
        .filter(|c| **c > 0)
        .map(|c| {
            let p = *c as f64 / len as f64;
            -p * p.log2()
        })
        .sum()
}

/// Fraction of G and C.
#[allow(clippy::cast_precision_loss)]
pub fn gc_content(seq: &str) -> f64 {
    if seq.is_empty() {
        return 0.0;
    }
    let gc = seq.bytes().filter(|b| matches!(b, b'G' | b'C')).count();
    gc as f64 / seq.len() as f64
}

/// Longest homopolymer run, or dinucleotide run counted in bases.
pub fn longest_repeat(seq: &str) -> usize {
    let s = seq.as_bytes();
    let mut best = usize::from(!s.is_empty());
    let mut run = 1usize;
    for w in s.windows(2) {
        run = if w.first() == w.get(1) {
            run.saturating_add(1)
        } else {
            1
        };
        best = best.max(run);
    }
    let mut pairs = 1usize;
    let mut chunks = s.chunks_exact(2);
    let mut prev = chunks.next();
    for pair in chunks {
        pairs = if Some(pair) == prev {
            pairs.saturating_add(1)
        } else {
            1
        };
        if pairs > 1 {
            best = best.max(pairs.saturating_mul(2));
        }
        prev = Some(pair);
    }
    best
}

/// Whether a window of at least `min_len` equals its reverse complement.
pub fn has_palindrome(seq: &str, min_len: usize) -> bool {
    let s = seq.as_bytes();
    let is_pal = |w: &[u8]| {
        w.iter()
            .zip(w.iter().rev())
            .take(w.len().checked_div(2).unwrap_or(0))
            .all(|(l, r)| complement_base(*l) == *r)
    };
    // A longer palindrome always contains a centred one of `min_len` or `min_len + 1`.
    s.windows(min_len.max(1)).any(is_pal)
        || s.windows(min_len.max(1).saturating_add(1)).any(is_pal)
}

/// Distinct codons among whole triplets.
pub fn codon_diversity(seq: &str) -> usize {
    let mut seen = [false; 64];
    for codon in seq.as_bytes().chunks_exact(3) {
        let idx = codon
            .iter()
            .try_fold(0usize, |acc, b| {
                acc.checked_mul(4)?.checked_add(base_index(*b)?)
            });
        if let Some(slot) = idx.and_then(|i| seen.get_mut(i)) {
            *slot = true;
        }
    }
    seen.iter().filter(|s| **s).count()
}

/// Strength class from entropy, repeats, and base coverage.
pub fn complexity(seq: &str) -> Complexity {
    let h = entropy(seq);
    let has_all = counts(seq.as_bytes()).iter().all(|c| *c > 0);
    if h < 1.0 || longest_repeat(seq) >= MOTIF_LEN {
        Complexity::Low
    } else if h < 1.5 || !has_all {
        Complexity::Medium
    } else if h < 1.9 {
        Complexity::High
    } else {
        Complexity::Genomic
    }
}

/// Full analysis of a normalised sequence.
pub fn analyze(seq: &str) -> SequenceAnalysis {
    let seq = normalize(seq);
    let h = entropy(&seq);
    let longest = longest_repeat(&seq);
    let class = complexity(&seq);
    let mut warnings = Vec::new();
    if class == Complexity::Low {
        warnings.push("Low complexity sequence".to_owned());
    }
    if longest >= MOTIF_LEN {
        warnings.push("Contains long repeats".to_owned());
    }
    if h < 1.5 {
        warnings.push("Low entropy".to_owned());
    }
    if counts(seq.as_bytes()).iter().any(|c| *c == 0) {
        warnings.push("Missing nucleotide types".to_owned());
    }
    SequenceAnalysis {
        length: seq.len(),
        entropy: h,
        gc_content: gc_content(&seq),
        longest_repeat: longest,
        has_repeats: longest >= MOTIF_LEN,
        has_palindrome: has_palindrome(&seq, MOTIF_LEN),
        codon_diversity: codon_diversity(&seq),
        complexity: class,
        acceptable: class >= Complexity::Medium && longest < MOTIF_LEN && h >= 1.5,
        warnings,
    }
}

/// Deterministic fitness in `0.1..=1.0`, weighting entropy, codon diversity,
/// and GC balance.
#[allow(clippy::cast_precision_loss)]
pub fn fitness(seq: &str) -> f64 {
    let triplets = seq.len().checked_div(3).unwrap_or(0).min(64);
    let diversity = if triplets == 0 {
        0.0
    } else {
        codon_diversity(seq) as f64 / triplets as f64
    };
    let balance = 1.0 - ((gc_content(seq) - 0.5).abs() * 2.0);
    let score = 0.5 * (entropy(seq) / 2.0) + 0.3 * diversity + 0.2 * balance;
    score.clamp(0.1, 1.0)
}
