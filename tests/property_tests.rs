//! Property-based tests for the invariants the container format and
//! commit protocol are required to uphold.

use proptest::prelude::*;
use secure_object_store::config::EngineConfig;
use secure_object_store::crypto::AeadKeyManager;
use secure_object_store::file::{SecureStorageEngine, StorageBackend, Whence};
use secure_object_store::session::StaticSessionAccessor;
use secure_object_store::transport::{FaultInjectingTransport, LocalRpcTransport, RpcTransport};

const NUM_BLOCKS: usize = 32;

fn config() -> EngineConfig {
    EngineConfig {
        num_blocks_per_file: NUM_BLOCKS,
        name_max: 256,
    }
}

fn engine_on(dir: &std::path::Path) -> SecureStorageEngine {
    SecureStorageEngine::new(
        Box::new(AeadKeyManager::random()),
        Box::new(LocalRpcTransport::new(dir)),
        Box::new(StaticSessionAccessor::random()),
        config(),
    )
}

proptest! {
    /// Round-trip: for all (pos, data) within MAX_FILE_SIZE, a
    /// seek-write-close-open-seek-read cycle returns exactly what was
    /// written.
    #[test]
    fn round_trip_write_then_read(
        pos in 0u64..(NUM_BLOCKS as u64 * 256 - 64),
        data in proptest::collection::vec(any::<u8>(), 1..64),
    ) {
        prop_assume!(pos + data.len() as u64 <= NUM_BLOCKS as u64 * 256);
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_on(dir.path());

        let mut h = engine.create("/obj/rt").unwrap();
        engine.seek(&mut h, pos as i64, Whence::Set).unwrap();
        engine.write(&mut h, &data).unwrap();
        engine.close(h).unwrap();

        let mut h = engine.open("/obj/rt").unwrap();
        engine.seek(&mut h, pos as i64, Whence::Set).unwrap();
        let mut buf = vec![0u8; data.len()];
        let n = engine.read(&mut h, &mut buf).unwrap();
        prop_assert_eq!(n, data.len());
        prop_assert_eq!(buf, data);
    }

    /// Zero-fill of holes: after create, seek(k) with k > 0, write(x),
    /// reading [0, k) yields zeros and length == k + |x|.
    #[test]
    fn zero_fill_of_holes(
        k in 1u64..(NUM_BLOCKS as u64 * 256 / 2),
        data in proptest::collection::vec(any::<u8>(), 1..64),
    ) {
        prop_assume!(k + data.len() as u64 <= NUM_BLOCKS as u64 * 256);
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_on(dir.path());

        let mut h = engine.create("/obj/zf").unwrap();
        engine.seek(&mut h, k as i64, Whence::Set).unwrap();
        engine.write(&mut h, &data).unwrap();

        prop_assert_eq!(h.len(), k + data.len() as u64);

        engine.seek(&mut h, 0, Whence::Set).unwrap();
        let mut prefix = vec![0xFFu8; k as usize];
        engine.read(&mut h, &mut prefix).unwrap();
        prop_assert!(prefix.iter().all(|&b| b == 0));
    }

    /// Length clamp on read: read past length returns max(0, length - pos)
    /// bytes, never more.
    #[test]
    fn length_clamp_on_read(
        written in 1usize..128,
        seek_to in 0u64..512,
        want in 1usize..128,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_on(dir.path());
        let mut h = engine.create("/obj/lc").unwrap();
        engine.write(&mut h, &vec![0x7u8; written]).unwrap();

        engine.seek(&mut h, seek_to as i64, Whence::Set).unwrap();
        let mut buf = vec![0u8; want];
        let n = engine.read(&mut h, &mut buf).unwrap();

        let expected = if seek_to >= written as u64 {
            0
        } else {
            ((written as u64 - seek_to) as usize).min(want)
        };
        prop_assert_eq!(n, expected);
    }

    /// Crash-atomicity: for an arbitrary sequence of whole-block writes
    /// and an arbitrary byte-granular crash point (a `write_at` call
    /// count after which every further write is silently dropped), the
    /// reopened object's content always equals some prefix-of-successful-
    /// writes checkpoint, never a mix of two writes' data.
    #[test]
    fn crash_atomicity_any_sequence_any_crash_point(
        patterns in proptest::collection::vec(any::<u8>(), 1..6),
        drop_after in 0u64..30,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let device_secret = [0x17u8; 32];
        let session_id = uuid::Uuid::new_v4();

        let faulty = FaultInjectingTransport::new(dir.path(), drop_after);
        let engine = SecureStorageEngine::new(
            Box::new(AeadKeyManager::new(device_secret)),
            Box::new(faulty),
            Box::new(StaticSessionAccessor::new(session_id)),
            config(),
        );

        // Checkpoints reachable after a crash: nothing committed yet, or
        // the state left behind by each write that fully committed.
        let mut checkpoints: Vec<(Vec<u8>, u64)> = Vec::new();
        let created = engine.create("/obj/ca");
        if let Ok(mut h) = created {
            checkpoints.push((Vec::new(), 0));
            for &pattern in &patterns {
                engine.seek(&mut h, 0, Whence::Set).unwrap();
                let data = vec![pattern; 256];
                match engine.write(&mut h, &data) {
                    Ok(_) => checkpoints.push((data, 256)),
                    Err(_) => break,
                }
            }
        }
        drop(engine);

        let reopened = SecureStorageEngine::new(
            Box::new(AeadKeyManager::new(device_secret)),
            Box::new(LocalRpcTransport::new(dir.path())),
            Box::new(StaticSessionAccessor::new(session_id)),
            config(),
        );

        match reopened.open("/obj/ca") {
            Err(_) => {
                // Nothing ever committed: only valid if create() itself
                // never reached a successful checkpoint.
                prop_assert!(checkpoints.is_empty());
            }
            Ok(mut h) => {
                let len = h.len();
                let mut buf = vec![0u8; len as usize];
                reopened.read(&mut h, &mut buf).unwrap();
                let matches_checkpoint = checkpoints
                    .iter()
                    .any(|(content, l)| *l == len && content.as_slice() == buf.as_slice());
                prop_assert!(matches_checkpoint);
            }
        }
    }

    /// Monotone counter: the on-disk counter never decreases, and
    /// strictly increases on every successful write/truncate.
    #[test]
    fn monotone_counter_across_writes(writes in proptest::collection::vec(1usize..32, 1..6)) {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_on(dir.path());
        let mut h = engine.create("/obj/mc").unwrap();

        let mut last_counter = read_counter(dir.path(), "/obj/mc");
        for len in writes {
            engine.seek(&mut h, 0, Whence::Set).unwrap();
            engine.write(&mut h, &vec![0xAAu8; len]).unwrap();
            let counter = read_counter(dir.path(), "/obj/mc");
            prop_assert!(counter > last_counter);
            last_counter = counter;
        }
    }
}

fn read_counter(dir: &std::path::Path, path: &str) -> u32 {
    let transport = LocalRpcTransport::new(dir);
    let fd = transport.open(path, false).unwrap();
    let mut buf = [0u8; 4];
    transport.read_at(fd, &mut buf, 0).unwrap();
    u32::from_le_bytes(buf)
}

/// Tamper detection: flipping any bit in a block's active ciphertext
/// causes the next read touching it to fail with CorruptObject.
#[test]
fn tamper_detection_on_block_ciphertext() {
    use secure_object_store::FsError;

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_on(dir.path());
    let mut h = engine.create("/obj/td").unwrap();
    engine.write(&mut h, &[0x9u8; 256]).unwrap();
    engine.close(h).unwrap();

    let transport = LocalRpcTransport::new(dir.path());
    let fd = transport.open("/obj/td", false).unwrap();
    let mut byte = [0u8; 1];
    transport.read_at(fd, &mut byte, 500).unwrap();
    byte[0] ^= 0x01;
    transport.write_at(fd, &byte, 500).unwrap();
    transport.close(fd).unwrap();

    let mut h = engine.open("/obj/td").unwrap();
    let mut buf = [0u8; 256];
    let err = engine.read(&mut h, &mut buf).unwrap_err();
    assert!(matches!(err, FsError::CorruptObject(_)));
}
