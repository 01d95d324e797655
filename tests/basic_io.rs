//! Single-threaded end-to-end behavior: aligned and unaligned writes,
//! reopen cycles, holes, implicit-offset I/O and seeking.

use tempfile::tempdir;
use ulayfs::config::BLOCK_SIZE;
use ulayfs::File;

#[test]
fn aligned_write_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.bin");

    {
        let file = File::create(&path).unwrap();
        assert!(file.is_core());
        let payload = vec![b'x'; BLOCK_SIZE];
        assert_eq!(file.pwrite(&payload, 0).unwrap(), BLOCK_SIZE);
        assert_eq!(file.file_size().unwrap(), BLOCK_SIZE as u64);
    }

    let file = File::open(&path).unwrap();
    assert!(file.is_core());
    assert_eq!(file.file_size().unwrap(), BLOCK_SIZE as u64);
    let mut buf = vec![0u8; BLOCK_SIZE];
    assert_eq!(file.pread(&mut buf, 0).unwrap(), BLOCK_SIZE);
    assert!(buf.iter().all(|&b| b == b'x'));
}

#[test]
fn unaligned_write_in_one_block() {
    let dir = tempdir().unwrap();
    let file = File::create(dir.path().join("data.bin")).unwrap();
    file.pwrite(&[b'a'; BLOCK_SIZE], 0).unwrap();

    assert_eq!(file.pwrite(b"XYZ", 100).unwrap(), 3);

    let mut buf = vec![0u8; BLOCK_SIZE];
    assert_eq!(file.pread(&mut buf, 0).unwrap(), BLOCK_SIZE);
    assert!(buf[..100].iter().all(|&b| b == b'a'));
    assert_eq!(&buf[100..103], b"XYZ");
    assert!(buf[103..].iter().all(|&b| b == b'a'));
    assert_eq!(file.file_size().unwrap(), BLOCK_SIZE as u64);
}

#[test]
fn non_overlapping_pwrites_round_trip() {
    let dir = tempdir().unwrap();
    let file = File::create(dir.path().join("data.bin")).unwrap();

    // a mix of aligned, sub-block and straddling ranges
    let writes: &[(u64, usize)] = &[
        (0, 512),
        (512, 100),
        (4096, 4096),
        (9000, 5000),
        (20000, 1),
        (100_000, 12288),
    ];
    for (i, &(offset, len)) in writes.iter().enumerate() {
        let payload = vec![i as u8 + 1; len];
        assert_eq!(file.pwrite(&payload, offset).unwrap(), len);
    }

    for (i, &(offset, len)) in writes.iter().enumerate() {
        let mut buf = vec![0u8; len];
        assert_eq!(file.pread(&mut buf, offset).unwrap(), len);
        assert!(buf.iter().all(|&b| b == i as u8 + 1), "range {i} mismatch");
    }
}

#[test]
fn holes_read_as_zeros() {
    let dir = tempdir().unwrap();
    let file = File::create(dir.path().join("data.bin")).unwrap();

    file.pwrite(b"tail", 3 * BLOCK_SIZE as u64).unwrap();

    let mut buf = vec![0xFFu8; 2 * BLOCK_SIZE];
    assert_eq!(file.pread(&mut buf, 0).unwrap(), 2 * BLOCK_SIZE);
    assert!(buf.iter().all(|&b| b == 0));
    assert_eq!(file.file_size().unwrap(), 3 * BLOCK_SIZE as u64 + 4);
}

#[test]
fn reads_stop_at_eof() {
    let dir = tempdir().unwrap();
    let file = File::create(dir.path().join("data.bin")).unwrap();
    file.pwrite(b"0123456789", 0).unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(file.pread(&mut buf, 0).unwrap(), 10);
    assert_eq!(file.pread(&mut buf, 8).unwrap(), 2);
    assert_eq!(&buf[..2], b"89");
    assert_eq!(file.pread(&mut buf, 10).unwrap(), 0);
    assert_eq!(file.pread(&mut buf, 999).unwrap(), 0);
}

#[test]
fn implicit_offset_read_write() {
    let dir = tempdir().unwrap();
    let file = File::create(dir.path().join("data.bin")).unwrap();

    assert_eq!(file.write(b"hello ").unwrap(), 6);
    assert_eq!(file.write(b"world").unwrap(), 5);
    assert_eq!(file.file_size().unwrap(), 11);

    file.lseek(std::io::SeekFrom::Start(0)).unwrap();
    let mut buf = [0u8; 6];
    assert_eq!(file.read(&mut buf).unwrap(), 6);
    assert_eq!(&buf, b"hello ");
    assert_eq!(file.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"world");
    // at EOF the implicit read comes back empty
    assert_eq!(file.read(&mut buf).unwrap(), 0);
}

#[test]
fn lseek_variants() {
    let dir = tempdir().unwrap();
    let file = File::create(dir.path().join("data.bin")).unwrap();
    file.pwrite(&vec![b'z'; 1000], 0).unwrap();

    assert_eq!(file.lseek(std::io::SeekFrom::Start(10)).unwrap(), 10);
    assert_eq!(file.lseek(std::io::SeekFrom::Current(5)).unwrap(), 15);
    assert_eq!(file.lseek(std::io::SeekFrom::End(-100)).unwrap(), 900);

    let mut buf = [0u8; 200];
    assert_eq!(file.read(&mut buf).unwrap(), 100);
    assert!(buf[..100].iter().all(|&b| b == b'z'));
}

#[test]
fn overwrite_then_extend() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.bin");
    let file = File::create(&path).unwrap();

    file.pwrite(&vec![1u8; 8192], 0).unwrap();
    file.pwrite(&vec![2u8; 300], 4000).unwrap();
    file.pwrite(&vec![3u8; 100], 8192).unwrap();

    drop(file);
    let file = File::open(&path).unwrap();

    let mut buf = vec![0u8; 8292];
    assert_eq!(file.pread(&mut buf, 0).unwrap(), 8292);
    assert!(buf[..4000].iter().all(|&b| b == 1));
    assert!(buf[4000..4300].iter().all(|&b| b == 2));
    assert!(buf[4300..8192].iter().all(|&b| b == 1));
    assert!(buf[8192..].iter().all(|&b| b == 3));
}

#[test]
fn fsync_returns_ok() {
    let dir = tempdir().unwrap();
    let file = File::create(dir.path().join("data.bin")).unwrap();
    file.pwrite(b"durable", 0).unwrap();

    file.fsync().unwrap();
}
