#[cfg(test)]
mod tests {
    use crate::config::{Config, SST_FOOTER_SIZE};
    use crate::sstable::{SstError, SstReader, SstWriter};
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    fn build_sample(conf: &Config, name: &str) {
        let mut writer = SstWriter::new(conf.dir.join(name), conf).unwrap();
        for i in 0..100 {
            writer
                .append(
                    format!("key{i:03}").as_bytes(),
                    format!("value{i}").as_bytes(),
                )
                .unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn corrupted_data_block_fails_checksum() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let conf = Config::new(dir.path());
        build_sample(&conf, "0_1_t.sst");
        let path = conf.dir.join("0_1_t.sst");

        // Flip a byte inside the first data block.
        let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(10)).unwrap();
        f.write_all(&[0xFF]).unwrap();
        f.sync_all().unwrap();

        let mut reader = SstReader::open(&path).unwrap();
        let index = reader.read_index().unwrap();
        let entry = index.iter().find(|e| e.block_size > 0).unwrap();
        let err = reader
            .read_block(entry.block_offset, entry.block_size)
            .unwrap_err();
        assert!(matches!(err, SstError::ChecksumMismatch { .. }));
    }

    #[test]
    fn zeroed_footer_is_rejected() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let conf = Config::new(dir.path());
        build_sample(&conf, "0_1_t.sst");
        let path = conf.dir.join("0_1_t.sst");

        let size = std::fs::metadata(&path).unwrap().len();
        let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(size - SST_FOOTER_SIZE as u64))
            .unwrap();
        f.write_all(&[0u8; SST_FOOTER_SIZE]).unwrap();
        f.sync_all().unwrap();

        let mut reader = SstReader::open(&path).unwrap();
        let err = reader.read_footer().unwrap_err();
        assert!(matches!(err, SstError::Footer(_)));
    }

    #[test]
    fn out_of_range_footer_offsets_rejected() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let conf = Config::new(dir.path());
        build_sample(&conf, "0_1_t.sst");
        let path = conf.dir.join("0_1_t.sst");

        let size = std::fs::metadata(&path).unwrap().len();
        let mut footer = Vec::new();
        // filter_offset far past the file end.
        crate::encoding::put_uvarint(&mut footer, size * 10);
        crate::encoding::put_uvarint(&mut footer, 1);
        crate::encoding::put_uvarint(&mut footer, 1);
        crate::encoding::put_uvarint(&mut footer, 1);
        footer.resize(SST_FOOTER_SIZE, 0);

        let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(size - SST_FOOTER_SIZE as u64))
            .unwrap();
        f.write_all(&footer).unwrap();
        f.sync_all().unwrap();

        let mut reader = SstReader::open(&path).unwrap();
        let err = reader.read_footer().unwrap_err();
        assert!(matches!(err, SstError::Footer(_)));
    }

    #[test]
    fn truncated_file_is_rejected_at_open() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0_1_t.sst");
        std::fs::write(&path, b"tiny").unwrap();
        assert!(matches!(
            SstReader::open(&path).unwrap_err(),
            SstError::Footer(_)
        ));
    }

    #[test]
    fn destroy_removes_backing_file() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let conf = Config::new(dir.path());
        build_sample(&conf, "0_1_t.sst");
        let path = conf.dir.join("0_1_t.sst");

        let reader = SstReader::open(&path).unwrap();
        assert!(path.exists());
        reader.destroy().unwrap();
        assert!(!path.exists());
    }
}
