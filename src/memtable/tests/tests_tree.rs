#[cfg(test)]
mod tests {
    use crate::memtable::tree::{Tree, TreeGet};
    use rand::seq::SliceRandom;

    #[test]
    fn insert_and_find() {
        let mut tree: Tree<String, String> = Tree::new();
        tree.insert("b".into(), "2".into());
        tree.insert("a".into(), "1".into());
        tree.insert("c".into(), "3".into());

        assert_eq!(tree.find(&"a".into()), TreeGet::Put(&"1".into()));
        assert_eq!(tree.find(&"b".into()), TreeGet::Put(&"2".into()));
        assert_eq!(tree.find(&"c".into()), TreeGet::Put(&"3".into()));
        assert_eq!(tree.find(&"d".into()), TreeGet::NotFound);
    }

    #[test]
    fn insert_overwrites_value() {
        let mut tree: Tree<String, u64> = Tree::new();
        tree.insert("k".into(), 1);
        tree.insert("k".into(), 2);
        assert_eq!(tree.find(&"k".into()), TreeGet::Put(&2));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn invariants_hold_under_random_insertions() {
        let mut keys: Vec<u64> = (0..2000).collect();
        keys.shuffle(&mut rand::rng());

        let mut tree: Tree<u64, u64> = Tree::new();
        for (i, &k) in keys.iter().enumerate() {
            tree.insert(k, k * 2);
            if i % 97 == 0 {
                tree.check_invariants();
            }
        }
        tree.check_invariants();
        assert_eq!(tree.len(), 2000);
    }

    #[test]
    fn invariants_hold_for_sorted_insertions() {
        // Ascending insertions are the classic degenerate case for
        // unbalanced trees.
        let mut tree: Tree<u64, u64> = Tree::new();
        for k in 0..1000 {
            tree.insert(k, k);
        }
        tree.check_invariants();
    }

    #[test]
    fn traversal_is_in_key_order() {
        let mut keys: Vec<u64> = (0..500).collect();
        keys.shuffle(&mut rand::rng());

        let mut tree: Tree<u64, u64> = Tree::new();
        for &k in &keys {
            tree.insert(k, k);
        }

        let visited: Vec<u64> = tree.iter().map(|(k, _)| *k).collect();
        let expected: Vec<u64> = (0..500).collect();
        assert_eq!(visited, expected);
    }

    #[test]
    fn soft_delete_routes_to_deleted_visitor() {
        let mut tree: Tree<String, String> = Tree::new();
        tree.insert("keep".into(), "v".into());
        tree.insert("drop".into(), "v".into());
        assert!(tree.delete(&"drop".into()));
        assert!(!tree.delete(&"missing".into()));

        let mut live = Vec::new();
        let mut dead = Vec::new();
        tree.traverse(
            |k, _| live.push(k.clone()),
            |k| dead.push(k.clone()),
        );

        assert_eq!(live, vec!["keep".to_string()]);
        assert_eq!(dead, vec!["drop".to_string()]);
        assert_eq!(tree.find(&"drop".into()), TreeGet::Deleted);
    }

    #[test]
    fn tombstone_for_absent_key_is_recorded() {
        let mut tree: Tree<String, String> = Tree::new();
        tree.insert_tombstone("ghost".into());
        assert_eq!(tree.find(&"ghost".into()), TreeGet::Deleted);

        // A later insert revives the key.
        tree.insert("ghost".into(), "back".into());
        assert_eq!(tree.find(&"ghost".into()), TreeGet::Put(&"back".into()));
    }

    #[test]
    fn successor_scan_visits_all_keys() {
        let mut tree: Tree<u64, u64> = Tree::new();
        for k in [5u64, 1, 9, 3, 7] {
            tree.insert(k, k * 10);
        }

        let mut seen = Vec::new();
        let mut last: Option<u64> = None;
        while let Some((k, v)) = tree.next_after(last.as_ref()) {
            seen.push((*k, v.copied()));
            last = Some(*k);
        }

        assert_eq!(
            seen,
            vec![
                (1, Some(10)),
                (3, Some(30)),
                (5, Some(50)),
                (7, Some(70)),
                (9, Some(90)),
            ]
        );
        assert!(tree.next_after(Some(&9)).is_none());
    }

    #[test]
    fn deep_copy_is_independent() {
        let mut tree: Tree<String, String> = Tree::new();
        tree.insert("a".into(), "1".into());
        tree.insert("b".into(), "2".into());

        let copy = tree.deep_copy();
        tree.insert("c".into(), "3".into());
        tree.delete(&"a".into());

        // The copy sees the state at copy time.
        assert_eq!(copy.find(&"a".into()), TreeGet::Put(&"1".into()));
        assert_eq!(copy.find(&"c".into()), TreeGet::NotFound);
        assert_eq!(copy.len(), 2);

        // The original moved on.
        assert_eq!(tree.find(&"a".into()), TreeGet::Deleted);
        assert_eq!(tree.find(&"c".into()), TreeGet::Put(&"3".into()));
    }

    #[test]
    fn iter_yields_tombstones_as_none() {
        let mut tree: Tree<u64, u64> = Tree::new();
        tree.insert(1, 10);
        tree.insert_tombstone(2);
        tree.insert(3, 30);

        let items: Vec<(u64, Option<u64>)> =
            tree.iter().map(|(k, v)| (*k, v.copied())).collect();
        assert_eq!(items, vec![(1, Some(10)), (2, None), (3, Some(30))]);
    }
}
