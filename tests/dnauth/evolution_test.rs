//! Tests for key evolution, ancestor matching and key changes.

use phantom_trust::dnauth::sequence::MatchMode;
use phantom_trust::dnauth::Privilege;
use phantom_trust::error::ErrorKind;
use phantom_trust::geology::EventKind;

use super::{enroll, store, SEQ};

#[test]
fn evolved_key_leaves_the_original_as_an_ancestor() {
    let (store, audit, _clock) = store();
    enroll(&store, "bob", MatchMode::Fuzzy);

    let g2 = store.evolve("bob").expect("evolve should succeed");
    assert_eq!(g2.from_generation, 1);
    assert_eq!(g2.to_generation, 2);
    assert!(g2.mutation_count >= 1);
    assert_ne!(g2.sequence.expose(), SEQ);
    assert!((0.1..=1.0).contains(&g2.fitness_after));

    let err = store
        .authenticate("bob", SEQ)
        .expect_err("the original no longer matches the current generation");
    assert_eq!(err.kind(), ErrorKind::BadCredential);

    let m = store
        .authenticate_ancestor("bob", SEQ, 2)
        .expect("the original is one generation back");
    assert_eq!(m.depth, 1);
    assert_eq!(m.matched_generation, 1);
    assert_eq!(
        m.privilege,
        Privilege::Reduced {
            generations_back: 1,
            penalty_percent: 10
        }
    );

    let evolved = audit
        .tail(audit.len())
        .into_iter()
        .find(|e| e.kind == EventKind::KeyEvolved)
        .expect("evolution should be logged");
    assert!(!String::from_utf8_lossy(&evolved.payload).contains(g2.sequence.expose()));
}

#[test]
fn each_evolution_is_reachable_one_generation_back() {
    let (store, _audit, _clock) = store();
    enroll(&store, "bob", MatchMode::Exact);

    let g2 = store.evolve("bob").expect("first evolve");
    let g3 = store.evolve("bob").expect("second evolve");

    let current = store
        .authenticate_ancestor("bob", g3.sequence.expose(), 0)
        .expect("current generation matches at depth 0");
    assert_eq!(current.privilege, Privilege::Full);

    let parent = store
        .authenticate_ancestor("bob", g2.sequence.expose(), 1)
        .expect("parent matches one back");
    assert_eq!(parent.depth, 1);

    let too_far = store
        .authenticate_ancestor("bob", SEQ, 1)
        .expect_err("the original is two back");
    assert_eq!(too_far.kind(), ErrorKind::BadCredential);

    let grand = store
        .authenticate_ancestor("bob", SEQ, 2)
        .expect("the original is reachable with depth 2");
    assert_eq!(
        grand.privilege,
        Privilege::Reduced {
            generations_back: 2,
            penalty_percent: 20
        }
    );
    assert_eq!(store.stats().ancestor_matches, 2);
}

#[test]
fn lineage_and_history_are_oldest_first() {
    let (store, _audit, _clock) = store();
    enroll(&store, "bob", MatchMode::Exact);
    store.evolve("bob").expect("first evolve");
    store.evolve("bob").expect("second evolve");

    let lineage = store.lineage("bob").expect("lineage should exist");
    assert_eq!(lineage.current, 3);
    let ids: Vec<u32> = lineage.generations.iter().map(|g| g.generation_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(lineage.generations[0].mutations_from_prior, 0);

    let history = store.evolution_history("bob").expect("history should exist");
    assert_eq!(history.len(), 2);
    assert_eq!((history[0].from_generation, history[0].to_generation), (1, 2));
    assert_eq!((history[1].from_generation, history[1].to_generation), (2, 3));
    assert_eq!(store.lookup("bob").expect("lookup").generation, 3);
    assert_eq!(store.stats().evolutions, 2);
}

#[test]
fn identity_key_survives_evolution() {
    let (store, _audit, _clock) = store();
    enroll(&store, "bob", MatchMode::Exact);
    let before = store.identity_key("bob").expect("key should derive");
    store.evolve("bob").expect("evolve should succeed");
    assert_eq!(store.identity_key("bob").expect("key should derive"), before);
    enroll(&store, "carol", MatchMode::Exact);
    assert_ne!(store.identity_key("carol").expect("key should derive"), before);
}

#[test]
fn change_key_requires_the_current_sequence() {
    let (store, audit, _clock) = store();
    enroll(&store, "dana", MatchMode::Exact);

    let err = store
        .change_key("dana", "GGGGATGCATGC", "GATTACAGATTACA")
        .expect_err("wrong old sequence");
    assert_eq!(err.kind(), ErrorKind::BadCredential);

    let generation = store
        .change_key("dana", SEQ, "GATTACAGATTACA")
        .expect("change should succeed");
    assert_eq!(generation, 2);
    assert!(audit
        .tail(1)
        .first()
        .is_some_and(|e| e.kind == EventKind::KeyChanged));

    store
        .authenticate("dana", "GATTACAGATTACA")
        .expect("new key should match");
    assert!(store.authenticate("dana", SEQ).is_err());
    assert_eq!(store.lookup("dana").expect("lookup").fail_count, 1);
}

#[test]
fn revoked_keys_cannot_evolve() {
    let (store, _audit, _clock) = store();
    enroll(&store, "bob", MatchMode::Exact);
    store.revoke("bob", "compromised").expect("revoke should log");
    let err = store.evolve("bob").expect_err("revoked key should not evolve");
    assert_eq!(err.kind(), ErrorKind::Revoked);
}
