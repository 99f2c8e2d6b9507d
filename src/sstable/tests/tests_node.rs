#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::sstable::{Node, SstWriter};
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    fn build_node(conf: &Config, name: &str, records: &[(Vec<u8>, Vec<u8>)]) -> Node {
        let path = conf.dir.join(name);
        let mut writer = SstWriter::new(&path, conf).unwrap();
        for (k, v) in records {
            writer.append(k, v).unwrap();
        }
        let (size, filter, index) = writer.finish().unwrap();
        Node::new(filter, index, 0, 1, "t", size, &path).unwrap()
    }

    fn sample_records(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| {
                (
                    format!("key{i:04}").into_bytes(),
                    format!("value{i}").into_bytes(),
                )
            })
            .collect()
    }

    #[test]
    fn get_finds_every_stored_key() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut conf = Config::new(dir.path());
        conf.sst_data_block_size = 512; // several blocks

        let records = sample_records(1000);
        let node = build_node(&conf, "0_1_t.sst", &records);

        for (k, v) in &records {
            assert_eq!(node.get(k).unwrap().as_deref(), Some(v.as_slice()));
        }
    }

    #[test]
    fn get_thousand_keys_spot_check() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let conf = Config::new(dir.path());

        let records: Vec<(Vec<u8>, Vec<u8>)> = (0..1000)
            .map(|i| {
                (
                    format!("key{i}").into_bytes(),
                    format!("value{i}").into_bytes(),
                )
            })
            .collect();
        let mut sorted = records.clone();
        sorted.sort();

        let node = build_node(&conf, "0_1_t.sst", &sorted);
        assert_eq!(
            node.get(b"key777").unwrap().as_deref(),
            Some(&b"value777"[..])
        );
    }

    #[test]
    fn get_misses_cleanly() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut conf = Config::new(dir.path());
        conf.sst_data_block_size = 512;

        let records = sample_records(500);
        let node = build_node(&conf, "0_1_t.sst", &records);

        // Out of range on both sides.
        assert_eq!(node.get(b"a-before-everything").unwrap(), None);
        assert_eq!(node.get(b"zzz-after-everything").unwrap(), None);
        // In range but absent (between key0100 and key0101).
        assert_eq!(node.get(b"key0100a").unwrap(), None);
    }

    #[test]
    fn range_metadata_brackets_contents() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let conf = Config::new(dir.path());
        let records = sample_records(100);
        let node = build_node(&conf, "0_1_t.sst", &records);

        assert!(node.start_key() <= records[0].0.as_slice());
        assert_eq!(node.end_key(), records.last().unwrap().0.as_slice());

        assert!(node.overlaps(b"key0050", b"key0060"));
        assert!(node.overlaps(b"key0099", b"zzz"));
        assert!(!node.overlaps(b"zzz0", b"zzz9"));
    }

    #[test]
    fn next_record_iterates_in_order() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut conf = Config::new(dir.path());
        conf.sst_data_block_size = 256;

        let records = sample_records(300);
        let node = build_node(&conf, "0_1_t.sst", &records);

        let mut out = Vec::new();
        while let Some((k, v)) = node.next_record().unwrap() {
            out.push((k, v));
        }
        assert_eq!(out, records);

        // Exhausted iterators stay exhausted.
        assert!(node.next_record().unwrap().is_none());
    }

    #[test]
    fn compacting_flag_claims_once() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let conf = Config::new(dir.path());
        let node = build_node(&conf, "0_1_t.sst", &sample_records(10));

        assert!(!node.is_compacting());
        assert!(node.mark_compacting());
        assert!(node.is_compacting());
        assert!(!node.mark_compacting());
    }

    #[test]
    fn load_reconstructs_node_from_disk() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut conf = Config::new(dir.path());
        conf.sst_data_block_size = 512;

        let records = sample_records(400);
        let path = conf.dir.join("3_7_t.sst");
        let mut writer = SstWriter::new(&path, &conf).unwrap();
        for (k, v) in &records {
            writer.append(k, v).unwrap();
        }
        let (size, _, _) = writer.finish().unwrap();

        let node = Node::load(&path, 3, 7, "t").unwrap();
        assert_eq!(node.level, 3);
        assert_eq!(node.seq_no, 7);
        assert_eq!(node.file_size, size);
        for (k, v) in records.iter().step_by(37) {
            assert_eq!(node.get(k).unwrap().as_deref(), Some(v.as_slice()));
        }
    }

    #[test]
    fn destroy_deletes_file_and_disables_reads() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let conf = Config::new(dir.path());
        let records = sample_records(50);
        let node = build_node(&conf, "0_1_t.sst", &records);
        let path = conf.dir.join("0_1_t.sst");

        assert!(path.exists());
        node.destroy().unwrap();
        assert!(!path.exists());

        // A destroyed node answers "absent" rather than erroring.
        assert_eq!(node.get(&records[0].0).unwrap(), None);
        assert!(node.next_record().unwrap().is_none());
    }
}
