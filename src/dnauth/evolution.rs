//! Key evolution: a bounded random walk of single-base edits.

use serde::{Deserialize, Serialize};

use super::sequence::{self, ALPHABET};
use super::verifier::SecretSequence;
use crate::clock::Tick;
use crate::entropy::EntropySource;

/// Attempts before giving up on a walk that keeps cancelling itself out.
const MAX_WALK_ATTEMPTS: usize = 16;

/// Kind of a single edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Any base replaced by a different one.
    Point,
    /// Purine to purine or pyrimidine to pyrimidine.
    Transition,
    /// Purine to pyrimidine or back.
    Transversion,
    /// One base inserted.
    Insertion,
    /// One base removed.
    Deletion,
}

impl MutationKind {
    const ALL: [MutationKind; 5] = [
        Self::Point,
        Self::Transition,
        Self::Transversion,
        Self::Insertion,
        Self::Deletion,
    ];
}

/// One applied edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// Edit kind.
    pub kind: MutationKind,
    /// Position in the sequence at the time of the edit.
    pub position: usize,
    /// Base before (`None` for insertions).
    pub before: Option<char>,
    /// Base after (`None` for deletions).
    pub after: Option<char>,
}

/// Result of [`DnaStore::evolve`](super::DnaStore::evolve).
#[derive(Debug, Clone, PartialEq)]
pub struct EvolutionEvent {
    /// User that evolved.
    pub user: String,
    /// Generation evolved from.
    pub from_generation: u32,
    /// New current generation.
    pub to_generation: u32,
    /// Edits applied.
    pub mutation_count: usize,
    /// Fitness of the prior generation.
    pub fitness_before: f64,
    /// Fitness of the new generation.
    pub fitness_after: f64,
    /// Edit distance from the prior generation.
    pub distance: usize,
    /// Edits in application order.
    pub mutations: Vec<Mutation>,
    /// The new sequence, handed back once to the caller.
    pub sequence: SecretSequence,
    /// Commit tick.
    pub tick: Tick,
}

/// An evolution event as kept in history, without the sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvolutionRecord {
    /// Generation evolved from.
    pub from_generation: u32,
    /// Generation evolved to.
    pub to_generation: u32,
    /// Edits applied.
    pub mutation_count: usize,
    /// Fitness before.
    pub fitness_before: f64,
    /// Fitness after.
    pub fitness_after: f64,
    /// Edits, positions only.
    pub mutations: Vec<Mutation>,
    /// Commit tick.
    pub tick: Tick,
}

impl From<&EvolutionEvent> for EvolutionRecord {
    fn from(e: &EvolutionEvent) -> Self {
        Self {
            from_generation: e.from_generation,
            to_generation: e.to_generation,
            mutation_count: e.mutation_count,
            fitness_before: e.fitness_before,
            fitness_after: e.fitness_after,
            mutations: e.mutations.clone(),
            tick: e.tick,
        }
    }
}

/// A finished walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Walk {
    pub(crate) sequence: String,
    pub(crate) mutations: Vec<Mutation>,
    pub(crate) distance: usize,
}

fn is_purine(b: u8) -> bool {
    matches!(b, b'A' | b'G')
}

fn pick(entropy: &dyn EntropySource, options: &[u8]) -> u8 {
    options.get(entropy.below(options.len())).copied().unwrap_or(b'A')
}

fn mutate_once(
    seq: &mut Vec<u8>,
    min_len: usize,
    max_len: usize,
    entropy: &dyn EntropySource,
) -> Option<Mutation> {
    let mut kind = MutationKind::ALL
        .get(entropy.below(MutationKind::ALL.len()))
        .copied()
        .unwrap_or(MutationKind::Point);
    if (kind == MutationKind::Deletion && seq.len() <= min_len)
        || (kind == MutationKind::Insertion && seq.len() >= max_len)
    {
        kind = MutationKind::Point;
    }
    if seq.is_empty() {
        kind = MutationKind::Insertion;
    }
    match kind {
        MutationKind::Insertion => {
            let position = entropy.below(seq.len().saturating_add(1));
            let base = pick(entropy, &ALPHABET);
            seq.insert(position, base);
            Some(Mutation {
                kind,
                position,
                before: None,
                after: Some(char::from(base)),
            })
        }
        MutationKind::Deletion => {
            let position = entropy.below(seq.len());
            let removed = seq.remove(position);
            Some(Mutation {
                kind,
                position,
                before: Some(char::from(removed)),
                after: None,
            })
        }
        MutationKind::Point | MutationKind::Transition | MutationKind::Transversion => {
            let position = entropy.below(seq.len());
            let slot = seq.get_mut(position)?;
            let old = *slot;
            let new = match kind {
                MutationKind::Transition => match old {
                    b'A' => b'G',
                    b'G' => b'A',
                    b'C' => b'T',
                    _ => b'C',
                },
                MutationKind::Transversion if is_purine(old) => pick(entropy, b"CT"),
                MutationKind::Transversion => pick(entropy, b"AG"),
                _ => {
                    let others: Vec<u8> = ALPHABET.iter().copied().filter(|b| *b != old).collect();
                    pick(entropy, &others)
                }
            };
            *slot = new;
            Some(Mutation {
                kind,
                position,
                before: Some(char::from(old)),
                after: Some(char::from(new)),
            })
        }
    }
}

/// Apply between one and `delta` edits to `current`, retrying until the
/// result differs. Distance from `current` never exceeds `delta`.
pub(crate) fn walk(
    current: &str,
    delta: u32,
    min_len: usize,
    max_len: usize,
    entropy: &dyn EntropySource,
) -> Option<Walk> {
    let delta = usize::try_from(delta.max(1)).unwrap_or(1);
    for _ in 0..MAX_WALK_ATTEMPTS {
        let count = entropy.below(delta).saturating_add(1);
        let mut seq = current.as_bytes().to_vec();
        let mutations: Vec<Mutation> = (0..count)
            .filter_map(|_| mutate_once(&mut seq, min_len, max_len, entropy))
            .collect();
        let sequence = String::from_utf8_lossy(&seq).into_owned();
        let distance = sequence::levenshtein(current, &sequence);
        if distance > 0 && distance <= delta {
            return Some(Walk {
                sequence,
                mutations,
                distance,
            });
        }
    }
    None
}
