//! String-level request classifier.
//!
//! Matching is purely syntactic and runs over ASCII-lowercased text. A
//! pattern that begins with an identifier character only matches at an
//! identifier boundary, so `link(` does not fire inside `unlink(`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::Regex;

use super::patterns::{BehaviorRule, Detector, PatternTable};
use super::types::{BehaviorReport, BehaviorSet, CapSet, Capability, Classification, ThreatLevel};
use crate::crypto::canonical::CanonicalWriter;
use crate::crypto::Digest;
use crate::error::CoreError;

/// Upper bound on behaviour score.
pub const MAX_SCORE: u8 = 100;

/// Upper bound on descriptions returned by behaviour analysis.
pub const MAX_DESCRIPTIONS: usize = 16;

enum Compiled {
    Contains {
        any: Vec<String>,
        with_any: Vec<String>,
    },
    InLoop {
        any: Vec<String>,
        loops: Regex,
    },
    Regex {
        regex: Regex,
        decode_base64: bool,
    },
}

/// Loop constructs over lowercased text. Keywords need both boundaries, so
/// `fork(` and `format` are not loops.
const LOOP_PATTERN: &str =
    r"(?:for|while)\s*\(|while\s+(?:true|1)|loop\s*\{|for\s+\w+\s+in";

struct CompiledBehavior {
    rule: BehaviorRule,
    matcher: Compiled,
}

/// Classifier over a [`PatternTable`].
pub struct Classifier {
    table: PatternTable,
    behaviors: Vec<CompiledBehavior>,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("capability_rules", &self.table.capabilities.len())
            .field("behavior_rules", &self.table.behaviors.len())
            .finish()
    }
}

impl Classifier {
    /// Compile a table.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] if the table fails validation.
    pub fn new(table: PatternTable) -> Result<Self, CoreError> {
        table.validate()?;
        let behaviors = table
            .behaviors
            .iter()
            .map(|rule| {
                compile(rule).map(|matcher| CompiledBehavior {
                    rule: rule.clone(),
                    matcher,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { table, behaviors })
    }

    /// Classifier over the built-in table.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] only if the built-in table is broken.
    pub fn builtin() -> Result<Self, CoreError> {
        Self::new(PatternTable::builtin())
    }

    /// The table in use.
    pub fn table(&self) -> &PatternTable {
        &self.table
    }

    /// Classify a request. Deterministic in `(text, name)`.
    pub fn classify(&self, text: &str, _name: &str) -> Classification {
        let lowered = text.to_ascii_lowercase();
        let mut caps = CapSet::empty();
        let mut weights = [0u32; Capability::ALL.len()];
        for rule in &self.table.capabilities {
            if contains_at_boundary(&lowered, &rule.pattern.to_ascii_lowercase()) {
                caps.insert(rule.capability);
                if let Some(slot) = weights.get_mut(rule.capability.index()) {
                    *slot = (*slot).max(rule.weight);
                }
            }
        }
        let weight = weights.iter().fold(0u32, |acc, w| acc.saturating_add(*w));
        let report = self.analyze_lowered(text, &lowered);
        Classification {
            caps,
            threat: ThreatLevel::from_weight(weight),
            behaviors: report.flags,
            score: report.score,
        }
    }

    /// Behaviour flags, score, and findings for `text`.
    pub fn analyze_behavior(&self, text: &str) -> BehaviorReport {
        self.analyze_lowered(text, &text.to_ascii_lowercase())
    }

    fn analyze_lowered(&self, text: &str, lowered: &str) -> BehaviorReport {
        let mut flags = BehaviorSet::empty();
        let mut score = 0u8;
        let mut descriptions = Vec::new();
        for compiled in &self.behaviors {
            if flags.contains(compiled.rule.behavior) || !matches(&compiled.matcher, text, lowered) {
                continue;
            }
            flags.insert(compiled.rule.behavior);
            score = score.saturating_add(compiled.rule.weight).min(MAX_SCORE);
            if descriptions.len() < MAX_DESCRIPTIONS {
                descriptions.push(compiled.rule.description.clone());
            }
        }
        BehaviorReport {
            flags,
            score,
            descriptions,
        }
    }

    /// Safer substitutes for every destructive pattern in `text`, in table order.
    pub fn alternatives(&self, text: &str) -> Vec<String> {
        let lowered = text.to_ascii_lowercase();
        let mut out: Vec<String> = Vec::new();
        for rule in &self.table.capabilities {
            let Some(alt) = &rule.alternative else {
                continue;
            };
            if contains_at_boundary(&lowered, &rule.pattern.to_ascii_lowercase())
                && !out.contains(alt)
            {
                out.push(alt.clone());
            }
        }
        out
    }

    /// Render the substitution table entries that apply to `text`.
    pub fn alternatives_text(&self, text: &str) -> String {
        let lowered = text.to_ascii_lowercase();
        let mut seen: Vec<&str> = Vec::new();
        let mut parts = Vec::new();
        for rule in &self.table.capabilities {
            let Some(alt) = &rule.alternative else {
                continue;
            };
            let verb = rule.pattern.trim_end_matches(['(', ' ']);
            if contains_at_boundary(&lowered, &rule.pattern.to_ascii_lowercase())
                && !seen.contains(&verb)
            {
                seen.push(verb);
                parts.push(format!("{verb} -> {alt}"));
            }
        }
        parts.join("; ")
    }
}

fn compile(rule: &BehaviorRule) -> Result<Compiled, CoreError> {
    let regex = |pattern: &str| {
        Regex::new(pattern).map_err(|e| CoreError::InvalidInput(format!("detector regex: {e}")))
    };
    Ok(match &rule.detector {
        Detector::Contains { any, with_any } => Compiled::Contains {
            any: any.iter().map(|s| s.to_ascii_lowercase()).collect(),
            with_any: with_any.iter().map(|s| s.to_ascii_lowercase()).collect(),
        },
        Detector::InLoop { any } => Compiled::InLoop {
            any: any.iter().map(|s| s.to_ascii_lowercase()).collect(),
            loops: regex(LOOP_PATTERN)?,
        },
        Detector::Base64Literal { min_len } => Compiled::Regex {
            regex: regex(&format!(r#"["']([A-Za-z0-9+/]{{{min_len},}}={{0,2}})["']"#))?,
            decode_base64: true,
        },
        Detector::ShellInterpolation => Compiled::Regex {
            regex: regex(r#""[^"]*(\$\(|`|\$\{)[^"]*""#)?,
            decode_base64: false,
        },
        Detector::BusyLoop => Compiled::Regex {
            regex: regex(r"while\s*\([^)]*\)\s*(;|\{\s*\})")?,
            decode_base64: false,
        },
    })
}

fn matches(matcher: &Compiled, text: &str, lowered: &str) -> bool {
    match matcher {
        Compiled::Contains { any, with_any } => {
            any.iter().any(|p| contains_at_boundary(lowered, p))
                && (with_any.is_empty() || with_any.iter().any(|p| contains_at_boundary(lowered, p)))
        }
        Compiled::InLoop { any, loops } => {
            any.iter().any(|p| contains_at_boundary(lowered, p)) && loops.is_match(lowered)
        }
        Compiled::Regex {
            regex,
            decode_base64: false,
        } => regex.is_match(text),
        Compiled::Regex {
            regex,
            decode_base64: true,
        } => regex.captures_iter(text).any(|caps| {
            caps.get(1)
                .is_some_and(|m| STANDARD.decode(m.as_str()).is_ok())
        }),
    }
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Whether `pattern` occurs in `haystack`, honouring identifier boundaries.
pub fn contains_at_boundary(haystack: &str, pattern: &str) -> bool {
    let needs_boundary = pattern.as_bytes().first().copied().is_some_and(is_ident);
    if !needs_boundary {
        return haystack.contains(pattern);
    }
    let bytes = haystack.as_bytes();
    haystack.match_indices(pattern).any(|(at, _)| {
        at.checked_sub(1)
            .and_then(|prev| bytes.get(prev))
            .map_or(true, |b| !is_ident(*b))
    })
}

/// Normalise request text: CRLF to LF, trailing whitespace trimmed per line,
/// leading and trailing blank space removed.
pub fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_owned()
}

/// Request fingerprint over normalised text and name.
pub fn fingerprint(text: &str, name: &str) -> Digest {
    let mut w = CanonicalWriter::new("phantom.governor.request");
    w.put_str(&normalize(text)).put_str(name);
    w.digest()
}
