//! Assignment of DRM objects to resource slots
//!
//! Used to bind connectors to CRTCs and planes to CRTCs. Object `i` can take
//! resource slot `j` iff bit `j` of `objs[i]` is set. [`match_obj`] fills
//! `out[j]` with the index of the object bound to slot `j`, or [`UNMATCHED`],
//! maximising the number of bound slots.
//!
//! `res` doubles as a hint: `res[j]` holds the object previously bound to slot
//! `j` (or `UNMATCHED`), and [`SKIP`] excludes the slot from the search. Among
//! maximum matchings the one with the fewest changes from the hint wins; the
//! remaining ties go to the lowest object index, slot by slot, so results are
//! reproducible.
//!
//! The search is an exhaustive backtracking over at most 32 slots, pruned by
//! an upper bound on what the remaining slots can still add: only slots with
//! an untaken compatible object, and only objects fitting such a slot, count
//! towards it.

/// Slot left without an object.
pub const UNMATCHED: u32 = u32::MAX;

/// Slot excluded from matching by the caller.
pub const SKIP: u32 = u32::MAX - 1;

/// Largest number of slots a `u32` compatibility mask can describe.
pub const MAX_RESOURCES: usize = 32;

struct MatchState<'a> {
    objs: &'a [u32],
    orig: &'a [u32],
    /// Solution being built.
    res: Vec<u32>,
    taken: Vec<bool>,
    best: Vec<u32>,
    best_score: usize,
    best_replaced: usize,
    /// Target score; reaching it with zero replacements ends the search.
    ceiling: usize,
    exit_early: bool,
}

fn compatible(mask: u32, slot: usize) -> bool {
    slot < MAX_RESOURCES && mask & (1 << slot) != 0
}

impl MatchState<'_> {
    fn search(&mut self, i: usize, score: usize, replaced: usize) -> bool {
        if i >= self.orig.len() {
            if score > self.best_score || (score == self.best_score && replaced < self.best_replaced) {
                self.best_score = score;
                self.best_replaced = replaced;
                self.best.copy_from_slice(&self.res);
                self.exit_early = score == self.ceiling && replaced == 0;
                return true;
            }
            return false;
        }

        // Nothing left to gain down this branch
        let bound = score + self.reachable(i);
        if bound < self.best_score || (bound == self.best_score && replaced >= self.best_replaced) {
            return false;
        }

        let hint = self.orig[i];
        if hint == SKIP {
            self.res[i] = SKIP;
            return self.search(i + 1, score, replaced);
        }

        let mut has_best = false;
        let hint_usable = (hint as usize) < self.objs.len()
            && compatible(self.objs[hint as usize], i)
            && !self.taken[hint as usize];

        // Keep the previous binding first
        if hint_usable {
            if self.try_candidate(i, hint as usize, score, replaced) {
                has_best = true;
            }
            if self.exit_early {
                return true;
            }
        }

        let replaced = if hint != UNMATCHED { replaced + 1 } else { replaced };

        for candidate in 0..self.objs.len() {
            if hint_usable && candidate == hint as usize {
                continue;
            }
            if !compatible(self.objs[candidate], i) || self.taken[candidate] {
                continue;
            }
            if self.try_candidate(i, candidate, score, replaced) {
                has_best = true;
            }
            if self.exit_early {
                return true;
            }
        }

        // This slot may simply stay empty
        self.res[i] = UNMATCHED;
        if self.search(i + 1, score, replaced) {
            has_best = true;
        }
        has_best
    }

    /// Upper bound on how many slots from `i` on can still be bound: open
    /// slots with an untaken compatible object, capped by the untaken objects
    /// fitting any of those slots.
    fn reachable(&self, i: usize) -> usize {
        let mut slots = 0;
        let mut slot_mask = 0u32;
        for slot in i..self.orig.len() {
            if self.orig[slot] == SKIP {
                continue;
            }
            let fits = (0..self.objs.len()).any(|obj| !self.taken[obj] && compatible(self.objs[obj], slot));
            if fits {
                slots += 1;
                slot_mask |= 1 << slot;
            }
        }
        let objects = (0..self.objs.len())
            .filter(|&obj| !self.taken[obj] && self.objs[obj] & slot_mask != 0)
            .count();
        slots.min(objects)
    }

    fn try_candidate(&mut self, i: usize, candidate: usize, score: usize, replaced: usize) -> bool {
        self.res[i] = candidate as u32;
        self.taken[candidate] = true;
        let improved = self.search(i + 1, score + 1, replaced);
        self.taken[candidate] = false;
        self.res[i] = UNMATCHED;
        improved
    }
}

/// Bind objects to resource slots.
///
/// `res` and `out` must have the same length, at most [`MAX_RESOURCES`].
/// Slots marked [`SKIP`] in `res` come back as `SKIP`. Returns the number of
/// slots bound to an object.
pub fn match_obj(objs: &[u32], res: &[u32], out: &mut [u32]) -> usize {
    assert_eq!(res.len(), out.len(), "match_obj: res and out lengths differ");
    debug_assert!(
        res.len() <= MAX_RESOURCES,
        "match_obj: {} resource slots exceed the {} a mask can address",
        res.len(),
        MAX_RESOURCES
    );

    let num_res = res.len();
    let open = res.iter().filter(|slot| **slot != SKIP).count();
    let ceiling = open.min(objs.len());

    let mut state = MatchState {
        objs,
        orig: res,
        res: vec![UNMATCHED; num_res],
        taken: vec![false; objs.len()],
        best: vec![UNMATCHED; num_res],
        best_score: 0,
        best_replaced: usize::MAX,
        ceiling,
        exit_early: false,
    };

    state.search(0, 0, 0);
    out.copy_from_slice(&state.best);
    state.best_score
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(objs: &[u32], res: &[u32]) -> (usize, Vec<u32>) {
        let mut out = vec![0; res.len()];
        let matched = match_obj(objs, res, &mut out);
        (matched, out)
    }

    #[test]
    fn test_first_fit_assignment() {
        let (matched, out) = run(&[0b11, 0b10, 0b01], &[UNMATCHED, UNMATCHED]);
        assert_eq!(matched, 2);
        assert_eq!(out, vec![0, 1]);
    }

    #[test]
    fn test_backtracks_to_reach_maximum() {
        // Object 0 fits both slots, object 1 only slot 0: greedy would strand object 1
        let (matched, out) = run(&[0b11, 0b01], &[UNMATCHED, UNMATCHED]);
        assert_eq!(matched, 2);
        assert_eq!(out, vec![1, 0]);
    }

    #[test]
    fn test_skip_slots_are_preserved() {
        let (matched, out) = run(&[0b111, 0b111], &[SKIP, UNMATCHED, UNMATCHED]);
        assert_eq!(matched, 2);
        assert_eq!(out, vec![SKIP, 0, 1]);
    }

    #[test]
    fn test_previous_assignment_is_kept() {
        let (matched, out) = run(&[0b11, 0b11], &[1, 0]);
        assert_eq!(matched, 2);
        assert_eq!(out, vec![1, 0]);
    }

    #[test]
    fn test_incompatible_hint_is_replaced() {
        // Object 1 can no longer drive slot 0
        let (matched, out) = run(&[0b01, 0b10], &[1, UNMATCHED]);
        assert_eq!(matched, 2);
        assert_eq!(out, vec![0, 1]);
    }

    #[test]
    fn test_out_of_range_hint_is_ignored() {
        let (matched, out) = run(&[0b1], &[7]);
        assert_eq!(matched, 1);
        assert_eq!(out, vec![0]);
    }

    #[test]
    fn test_unplugged_object_leaves_slots_empty() {
        let (matched, out) = run(&[0, 0b10], &[0, UNMATCHED]);
        assert_eq!(matched, 1);
        assert_eq!(out, vec![UNMATCHED, 1]);
    }

    #[test]
    fn test_no_objects_or_slots() {
        assert_eq!(run(&[], &[UNMATCHED, UNMATCHED]), (0, vec![UNMATCHED, UNMATCHED]));
        assert_eq!(run(&[0b1, 0b1], &[]), (0, vec![]));
    }

    #[test]
    fn test_more_objects_than_slots() {
        let (matched, out) = run(&[0b1, 0b1, 0b1], &[UNMATCHED]);
        assert_eq!(matched, 1);
        assert_eq!(out, vec![0]);
    }

    #[test]
    fn test_unfillable_slots_do_not_explode_search() {
        // Every object only fits the first half of the slots
        let size = 24;
        let objs = vec![(1u32 << (size / 2)) - 1; size];
        let res = vec![UNMATCHED; size];

        let started = std::time::Instant::now();
        let (matched, out) = run(&objs, &res);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));

        assert_eq!(matched, size / 2);
        for (slot, obj) in out.iter().enumerate() {
            let expected = if slot < size / 2 { slot as u32 } else { UNMATCHED };
            assert_eq!(*obj, expected);
        }
    }

    #[test]
    fn test_contended_slots_with_stale_hints() {
        let size = MAX_RESOURCES;
        let objs: Vec<u32> = (0..size).map(|i| 1 | (1u32 << i)).collect();
        let res: Vec<u32> = (0..size).map(|i| ((i + 1) % size) as u32).collect();

        let started = std::time::Instant::now();
        let (matched, _) = run(&objs, &res);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(matched, size);
    }

    fn brute_force_max(objs: &[u32], res: &[u32], i: usize, taken: &mut Vec<bool>) -> usize {
        if i == res.len() {
            return 0;
        }
        let mut best = brute_force_max(objs, res, i + 1, taken);
        if res[i] == SKIP {
            return best;
        }
        for candidate in 0..objs.len() {
            if !taken[candidate] && compatible(objs[candidate], i) {
                taken[candidate] = true;
                best = best.max(1 + brute_force_max(objs, res, i + 1, taken));
                taken[candidate] = false;
            }
        }
        best
    }

    proptest! {
        #[test]
        fn prop_full_compatibility_matches_min(num_objs in 0usize..8, num_res in 0usize..8) {
            let mask = if num_res == 0 { 0 } else { (1u32 << num_res) - 1 };
            let objs = vec![mask; num_objs];
            let res = vec![UNMATCHED; num_res];
            let (matched, out) = run(&objs, &res);

            prop_assert_eq!(matched, num_objs.min(num_res));
            for (slot, obj) in out.iter().enumerate() {
                if slot < num_objs {
                    prop_assert_eq!(*obj, slot as u32);
                } else {
                    prop_assert_eq!(*obj, UNMATCHED);
                }
            }
        }

        #[test]
        fn prop_assignment_is_valid_and_maximal(
            objs in prop::collection::vec(0u32..64, 0..6),
            slots in prop::collection::vec(prop_oneof![Just(UNMATCHED), Just(SKIP), 0u32..6], 0..6),
        ) {
            let (matched, out) = run(&objs, &slots);

            let mut seen = vec![false; objs.len()];
            let mut bound = 0;
            for (slot, obj) in out.iter().enumerate() {
                if slots[slot] == SKIP {
                    prop_assert_eq!(*obj, SKIP);
                    continue;
                }
                if *obj == UNMATCHED {
                    continue;
                }
                let obj = *obj as usize;
                prop_assert!(obj < objs.len());
                prop_assert!(compatible(objs[obj], slot));
                prop_assert!(!seen[obj], "object {} bound twice", obj);
                seen[obj] = true;
                bound += 1;
            }
            prop_assert_eq!(bound, matched);

            let mut taken = vec![false; objs.len()];
            prop_assert_eq!(matched, brute_force_max(&objs, &slots, 0, &mut taken));
        }
    }
}
