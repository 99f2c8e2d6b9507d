#[cfg(test)]
mod tests {
    use crate::memtable::{FrozenMemtable, FrozenQueue, MemTable, MemTableGet, Tree};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    fn frozen_from_pairs(pairs: &[(&str, Option<&str>)], seq: u64) -> FrozenMemtable<String, String> {
        let mut tree: Tree<String, String> = Tree::new();
        for (k, v) in pairs {
            match v {
                Some(v) => tree.insert((*k).into(), (*v).into()),
                None => tree.insert_tombstone((*k).into()),
            }
        }
        FrozenMemtable::from_tree(tree, PathBuf::from(format!("/nonexistent/wal_{seq}.log")), seq)
    }

    #[test]
    fn newest_frozen_table_wins() {
        init_tracing();
        let queue: FrozenQueue<String, String> = FrozenQueue::new();

        queue.push(frozen_from_pairs(&[("k", Some("old")), ("only-old", Some("o"))], 1));
        queue.push(frozen_from_pairs(&[("k", Some("new"))], 2));

        assert_eq!(queue.get(&"k".into()), MemTableGet::Put("new".into()));
        assert_eq!(queue.get(&"only-old".into()), MemTableGet::Put("o".into()));
        assert_eq!(queue.get(&"absent".into()), MemTableGet::NotFound);
    }

    #[test]
    fn tombstone_in_newer_table_shadows_older_value() {
        init_tracing();
        let queue: FrozenQueue<String, String> = FrozenQueue::new();

        queue.push(frozen_from_pairs(&[("k", Some("v"))], 1));
        queue.push(frozen_from_pairs(&[("k", None)], 2));

        assert_eq!(queue.get(&"k".into()), MemTableGet::Deleted);
    }

    #[test]
    fn queue_drains_oldest_first() {
        init_tracing();
        let queue: FrozenQueue<String, String> = FrozenQueue::new();

        queue.push(frozen_from_pairs(&[("a", Some("1"))], 1));
        queue.push(frozen_from_pairs(&[("b", Some("2"))], 2));
        queue.push(frozen_from_pairs(&[("c", Some("3"))], 3));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.oldest().unwrap().wal_seq, 1);
        assert_eq!(queue.pop_oldest().unwrap().wal_seq, 1);
        assert_eq!(queue.pop_oldest().unwrap().wal_seq, 2);
        assert_eq!(queue.pop_oldest().unwrap().wal_seq, 3);
        assert!(queue.pop_oldest().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn frozen_iteration_is_sorted_with_tombstones() {
        init_tracing();
        let frozen = frozen_from_pairs(
            &[("b", None), ("a", Some("1")), ("c", Some("3"))],
            1,
        );

        let items: Vec<(String, Option<String>)> = frozen
            .iter()
            .map(|(k, v)| (k.clone(), v.cloned()))
            .collect();
        assert_eq!(
            items,
            vec![
                ("a".into(), Some("1".into())),
                ("b".into(), None),
                ("c".into(), Some("3".into())),
            ]
        );
        assert_eq!(frozen.len(), 3);
    }

    #[test]
    fn multiple_freezes_stack_in_order() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(FrozenQueue::new());
        let table: MemTable<String, String> =
            MemTable::new(dir.path(), 1, 1 << 20, queue.clone()).unwrap();

        table.put("x".into(), "gen1".into()).unwrap();
        assert!(table.freeze().unwrap());
        table.put("x".into(), "gen2".into()).unwrap();
        assert!(table.freeze().unwrap());

        assert_eq!(queue.len(), 2);
        // Reads resolve to the newest generation.
        assert_eq!(queue.get(&"x".into()), MemTableGet::Put("gen2".into()));
        // Drain order is oldest first.
        assert_eq!(queue.pop_oldest().unwrap().get(&"x".into()), MemTableGet::Put("gen1".into()));
    }
}
