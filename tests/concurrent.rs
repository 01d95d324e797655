//! Concurrency: parallel appenders must interleave without tearing, and
//! positional writers to disjoint ranges must not disturb each other.

use std::sync::Arc;

use tempfile::tempdir;
use ulayfs::File;

const CHUNK: usize = 512;

#[test]
fn concurrent_appends_do_not_tear() {
    const THREADS: usize = 8;
    const APPENDS: usize = 250;

    let dir = tempdir().unwrap();
    let path = dir.path().join("data.bin");
    let file = Arc::new(File::create(&path).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let file = Arc::clone(&file);
            std::thread::spawn(move || {
                let payload = [0xA0 + tid as u8; CHUNK];
                for _ in 0..APPENDS {
                    assert_eq!(file.write(&payload).unwrap(), CHUNK);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let total = THREADS * APPENDS * CHUNK;
    assert_eq!(file.file_size().unwrap(), total as u64);

    // every 512-byte chunk belongs to exactly one thread
    let mut counts = [0usize; THREADS];
    let mut buf = vec![0u8; total];
    assert_eq!(file.pread(&mut buf, 0).unwrap(), total);
    for chunk in buf.chunks(CHUNK) {
        let owner = chunk[0];
        assert!((0xA0..0xA0 + THREADS as u8).contains(&owner));
        assert!(chunk.iter().all(|&b| b == owner), "torn chunk");
        counts[(owner - 0xA0) as usize] += 1;
    }
    assert!(counts.iter().all(|&c| c == APPENDS));
}

#[test]
fn concurrent_appends_survive_reopen() {
    const THREADS: usize = 4;
    const APPENDS: usize = 100;

    let dir = tempdir().unwrap();
    let path = dir.path().join("data.bin");
    {
        let file = Arc::new(File::create(&path).unwrap());
        let handles: Vec<_> = (0..THREADS)
            .map(|tid| {
                let file = Arc::clone(&file);
                std::thread::spawn(move || {
                    let payload = [tid as u8 + 1; CHUNK];
                    for _ in 0..APPENDS {
                        file.write(&payload).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    let file = File::open(&path).unwrap();
    let total = THREADS * APPENDS * CHUNK;
    assert_eq!(file.file_size().unwrap(), total as u64);
    let mut buf = vec![0u8; total];
    file.pread(&mut buf, 0).unwrap();
    for chunk in buf.chunks(CHUNK) {
        assert!(chunk.iter().all(|&b| b == chunk[0]));
        assert!((1..=THREADS as u8).contains(&chunk[0]));
    }
}

#[test]
fn disjoint_pwrites_from_many_threads() {
    const THREADS: usize = 8;
    const PER_THREAD_BYTES: usize = 64 * 1024;

    let dir = tempdir().unwrap();
    let file = Arc::new(File::create(dir.path().join("data.bin")).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let file = Arc::clone(&file);
            std::thread::spawn(move || {
                let base = (tid * PER_THREAD_BYTES) as u64;
                let payload = [tid as u8 + 1; 1000];
                // deliberately unaligned writes inside this thread's region
                let mut offset = base;
                while offset + 1000 <= base + PER_THREAD_BYTES as u64 {
                    file.pwrite(&payload, offset).unwrap();
                    offset += 1000;
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for tid in 0..THREADS {
        let base = (tid * PER_THREAD_BYTES) as u64;
        let span = (PER_THREAD_BYTES / 1000) * 1000;
        let mut buf = vec![0u8; span];
        assert_eq!(file.pread(&mut buf, base).unwrap(), span);
        assert!(
            buf.iter().all(|&b| b == tid as u8 + 1),
            "thread {tid} region corrupted"
        );
    }
}

#[test]
fn mixed_readers_and_writers() {
    let dir = tempdir().unwrap();
    let file = Arc::new(File::create(dir.path().join("data.bin")).unwrap());
    file.pwrite(&[0u8; 8192], 0).unwrap();

    let writer = {
        let file = Arc::clone(&file);
        std::thread::spawn(move || {
            for round in 1u8..=100 {
                file.pwrite(&[round; 4096], 0).unwrap();
            }
        })
    };
    let reader = {
        let file = Arc::clone(&file);
        std::thread::spawn(move || {
            for _ in 0..100 {
                let mut buf = [0u8; 4096];
                assert_eq!(file.pread(&mut buf, 0).unwrap(), 4096);
                // a block overwrite is atomic: never a mix of two rounds
                assert!(buf.iter().all(|&b| b == buf[0]), "torn block read");
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
}
