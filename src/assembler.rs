//! Feed assembly.
//!
//! Merges a score-ranked candidate list with the sparse table of pinned
//! positions.
//!
//! ## Algorithm
//!
//! 1. Stable-sort candidates by score, descending
//! 2. Pull out every candidate whose id is pinned, keyed by its position
//! 3. Walk positions in ascending order and insert each pinned item at its
//!    index, appending when the index is past the end
//!
//! Earlier insertions only shift later elements, so every pinned item
//! lands on its index once all insertions before it are applied.
//!
//! ## Guarantees
//!
//! - The output is a permutation of the input
//! - Equal scores keep their input order
//! - Pins for ids that are not candidates are skipped

use std::collections::{BTreeMap, HashMap};

use rand::seq::{index, SliceRandom};
use rand::Rng;

use crate::types::{Feed, Position, Scorable};

/// Cold-start sampling bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColdstartParams {
    /// Maximum number of cold-start items injected.
    pub limit: usize,
    /// Items are injected within the first `window` slots.
    pub window: usize,
}

impl Default for ColdstartParams {
    fn default() -> Self {
        Self { limit: 5, window: 10 }
    }
}

/// Wrap and stable-sort candidates by descending score.
///
/// NaN scores rank as negative infinity, so they sink to the tail.
pub fn rank<T: Scorable>(candidates: Vec<T>) -> Vec<Feed<T>> {
    let mut feeds: Vec<Feed<T>> = candidates.into_iter().map(Feed::from_item).collect();
    // sort_by is stable
    feeds.sort_by(|a, b| sort_key(b.score()).total_cmp(&sort_key(a.score())));
    feeds
}

/// Total-order key: NaN sinks to the bottom and `-0.0` ties with `0.0`.
fn sort_key(score: f64) -> f64 {
    if score.is_nan() {
        f64::NEG_INFINITY
    } else if score == 0.0 {
        0.0
    } else {
        score
    }
}

/// Assemble the feed from candidates and pinned positions.
pub fn assemble<T: Scorable>(candidates: Vec<T>, positions: &[Position]) -> Vec<Feed<T>> {
    let ranked = rank(candidates);

    let position_of: HashMap<&str, u32> = positions
        .iter()
        .map(|p| (p.feed_id.as_str(), p.position))
        .collect();

    let mut pinned: BTreeMap<u32, Vec<Feed<T>>> = BTreeMap::new();
    let mut feeds: Vec<Feed<T>> = Vec::with_capacity(ranked.len());
    for feed in ranked {
        match position_of.get(feed.id.as_str()) {
            Some(&slot) => pinned.entry(slot).or_default().push(feed),
            None => feeds.push(feed),
        }
    }

    // BTreeMap iterates positions in ascending order.
    for (slot, items) in pinned {
        let mut at = slot as usize;
        for feed in items {
            insert_clamped(&mut feeds, at, feed);
            at += 1;
        }
    }

    feeds
}

/// Assemble the cold-start feed.
///
/// Up to `params.limit` entries of `pool` are drawn uniformly at random;
/// the matching candidates are removed from the ranked list and spliced
/// back at random distinct slots within the first `params.window`
/// indices.
pub fn assemble_coldstart<T: Scorable, R: Rng + ?Sized>(
    candidates: Vec<T>,
    pool: &[Position],
    params: ColdstartParams,
    rng: &mut R,
) -> Vec<Feed<T>> {
    let mut feeds = rank(candidates);

    let mut sampled: Vec<&Position> = pool.iter().collect();
    if sampled.len() > params.limit {
        sampled.shuffle(rng);
        sampled.truncate(params.limit);
    }

    let mut coldstart = Vec::new();
    let mut kept = Vec::with_capacity(feeds.len());
    for feed in feeds.drain(..) {
        if sampled.iter().any(|p| p.feed_id == feed.id) {
            coldstart.push(feed);
        } else {
            kept.push(feed);
        }
    }
    feeds = kept;

    // A window smaller than the number of picks still needs distinct slots.
    let window = params.window.max(coldstart.len());
    let mut slots = index::sample(rng, window, coldstart.len()).into_vec();
    slots.sort_unstable();

    for (slot, feed) in slots.into_iter().zip(coldstart) {
        insert_clamped(&mut feeds, slot, feed);
    }

    feeds
}

fn insert_clamped<T>(feeds: &mut Vec<T>, at: usize, item: T) {
    if at >= feeds.len() {
        feeds.push(item);
    } else {
        feeds.insert(at, item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeedType;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[derive(Debug, Clone, PartialEq)]
    struct Post {
        id: &'static str,
        score: f64,
    }

    impl Scorable for Post {
        fn feed_id(&self) -> &str {
            self.id
        }
        fn feed_type(&self) -> FeedType {
            FeedType::Single
        }
        fn score(&self) -> f64 {
            self.score
        }
    }

    fn posts(items: &[(&'static str, f64)]) -> Vec<Post> {
        items.iter().map(|&(id, score)| Post { id, score }).collect()
    }

    fn ids<T>(feeds: &[Feed<T>]) -> Vec<&str> {
        feeds.iter().map(|f| f.id.as_str()).collect()
    }

    fn pin(id: &str, position: u32) -> Position {
        Position::new(id, FeedType::Single, position)
    }

    #[test]
    fn test_rank_sorts_descending() {
        let feeds = rank(posts(&[("post1", 50.0), ("post2", 100.0), ("post3", 75.0)]));
        assert_eq!(ids(&feeds), vec!["post2", "post3", "post1"]);
    }

    #[test]
    fn test_rank_is_stable_for_equal_scores() {
        let feeds = rank(posts(&[("a", 1.0), ("b", 2.0), ("c", 1.0), ("d", 2.0), ("e", 1.0)]));
        assert_eq!(ids(&feeds), vec!["b", "d", "a", "c", "e"]);
    }

    #[test]
    fn test_rank_puts_nan_last() {
        let feeds = rank(posts(&[
            ("a", f64::NAN),
            ("b", 1.0),
            ("c", f64::NAN),
            ("d", 2.0),
            ("e", f64::NEG_INFINITY),
            ("f", -0.0),
            ("g", 0.0),
        ]));
        assert_eq!(ids(&feeds), vec!["d", "b", "f", "g", "a", "c", "e"]);
    }

    #[test]
    fn test_pin_at_zero() {
        let feeds = assemble(
            posts(&[("post1", 50.0), ("post2", 100.0), ("post3", 75.0)]),
            &[pin("post1", 0)],
        );
        assert_eq!(ids(&feeds), vec!["post1", "post2", "post3"]);
    }

    #[test]
    fn test_pin_in_middle_and_end() {
        let input = posts(&[("post1", 50.0), ("post2", 100.0), ("post3", 75.0)]);
        let feeds = assemble(input.clone(), &[pin("post1", 1)]);
        assert_eq!(ids(&feeds), vec!["post2", "post1", "post3"]);

        let feeds = assemble(input, &[pin("post2", 2)]);
        assert_eq!(ids(&feeds), vec!["post3", "post1", "post2"]);
    }

    #[test]
    fn test_multiple_pins() {
        let feeds = assemble(
            posts(&[("post1", 50.0), ("post2", 100.0), ("post3", 75.0), ("post4", 60.0)]),
            &[pin("post1", 0), pin("post4", 2)],
        );
        assert_eq!(ids(&feeds), vec!["post1", "post2", "post4", "post3"]);
    }

    #[test]
    fn test_pins_out_of_order_are_applied_ascending() {
        let feeds = assemble(
            posts(&[("post1", 50.0), ("post2", 100.0), ("post3", 75.0), ("post4", 60.0)]),
            &[pin("post4", 2), pin("post1", 0)],
        );
        assert_eq!(ids(&feeds), vec!["post1", "post2", "post4", "post3"]);
    }

    #[test]
    fn test_pin_past_end_appends() {
        let feeds = assemble(posts(&[("a", 3.0), ("b", 2.0), ("c", 1.0)]), &[pin("a", 99)]);
        assert_eq!(ids(&feeds), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_pin_for_absent_id_is_skipped() {
        let feeds = assemble(
            posts(&[("a", 3.0), ("b", 2.0)]),
            &[pin("ghost", 0), pin("b", 0)],
        );
        assert_eq!(ids(&feeds), vec!["b", "a"]);
    }

    #[test]
    fn test_duplicate_candidate_ids_are_kept() {
        let feeds = assemble(posts(&[("a", 3.0), ("a", 1.0), ("b", 2.0)]), &[pin("a", 0)]);
        assert_eq!(feeds.len(), 3);
        assert_eq!(ids(&feeds), vec!["a", "a", "b"]);
    }

    #[test]
    fn test_empty_inputs() {
        let feeds: Vec<Feed<Post>> = assemble(Vec::new(), &[pin("a", 0)]);
        assert!(feeds.is_empty());
    }

    #[test]
    fn test_coldstart_injects_within_window() {
        let candidates: Vec<Post> = (0..30)
            .map(|i| Post {
                id: Box::leak(format!("p{i}").into_boxed_str()),
                score: 100.0 - i as f64,
            })
            .collect();
        let pool: Vec<Position> = ["p20", "p21", "p22", "p23", "p24", "p25", "p26"]
            .iter()
            .enumerate()
            .map(|(i, id)| pin(id, i as u32))
            .collect();

        let mut rng = StdRng::seed_from_u64(7);
        let feeds = assemble_coldstart(candidates, &pool, ColdstartParams::default(), &mut rng);

        assert_eq!(feeds.len(), 30);
        let injected: Vec<usize> = feeds
            .iter()
            .enumerate()
            .filter(|(_, f)| pool.iter().any(|p| p.feed_id == f.id))
            .map(|(i, _)| i)
            .collect();
        // Five of the seven pool entries are pulled into the first ten slots.
        assert_eq!(injected.iter().filter(|&&i| i < 10).count(), 5);
    }

    #[test]
    fn test_coldstart_is_reproducible_with_seed() {
        let input = posts(&[("a", 5.0), ("b", 4.0), ("c", 3.0), ("d", 2.0), ("e", 1.0)]);
        let pool = vec![pin("d", 0), pin("e", 1)];

        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let feeds = assemble_coldstart(input.clone(), &pool, ColdstartParams::default(), &mut rng);
            ids(&feeds).into_iter().map(str::to_string).collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_coldstart_short_feed_appends() {
        let mut rng = StdRng::seed_from_u64(1);
        let feeds = assemble_coldstart(
            posts(&[("a", 2.0), ("b", 1.0)]),
            &[pin("b", 0)],
            ColdstartParams::default(),
            &mut rng,
        );
        let mut got = ids(&feeds);
        got.sort();
        assert_eq!(got, vec!["a", "b"]);
    }
}
