/// Journal damage handling
///
/// A record cut short at the tail (a crash mid-append) is dropped and the
/// shortener opens; damage inside the journal is reported as an error
/// rather than silently skipped.

use shortlink_api::{ShortlinkError, Shortener, StatisticsScope};
use shortlink_core::runtime::{REMINDER_FILE, STATE_FILE};
use shortlink_test_utils::{counts, test_config, wait_for_statistics, TestShortener};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};

#[test]
fn test_torn_state_tail_is_dropped() {
    let test = TestShortener::new();
    for i in 0..10 {
        test.shortener
            .shorten(&format!("https://torn.example/{}", i), false, 600)
            .unwrap();
    }
    wait_for_statistics(&test.shortener, &StatisticsScope::Global, counts(10, 10)).unwrap();
    let path = test.path().unwrap().to_path_buf();
    let config = test.config.clone();
    test.shortener.shutdown();
    drop(test.shortener);

    let state_path = path.join(STATE_FILE);
    let len = fs::metadata(&state_path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&state_path).unwrap();
    file.set_len(len - 3).unwrap();

    let shortener = Shortener::open(config).unwrap();
    let segment = shortener.shorten("https://after-crash.example/", false, 600).unwrap();
    assert_eq!(
        shortener.get_url(&segment).unwrap(),
        "https://after-crash.example/"
    );
}

#[test]
fn test_flipped_byte_is_reported() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = test_config().with_disk_storage(dir.path());
    {
        let shortener = Shortener::open(config.clone()).unwrap();
        for i in 0..10 {
            shortener
                .shorten(&format!("https://flip.example/{}", i), false, 600)
                .unwrap();
        }
        shortener.shutdown();
    }

    // Flip a byte inside the first record's payload
    let reminder_path = dir.path().join(REMINDER_FILE);
    let mut file = OpenOptions::new().read(true).write(true).open(&reminder_path).unwrap();
    file.seek(SeekFrom::Start(16 + 12 + 4)).unwrap();
    file.write_all(&[0xFF]).unwrap();
    file.sync_all().unwrap();
    drop(file);

    match Shortener::open(config) {
        Ok(_) => panic!("Expected the damaged reminder journal to be rejected"),
        Err(e) => assert!(
            matches!(e.code(), "CHECKSUM_MISMATCH" | "CORRUPTION"),
            "unexpected error {:?}",
            e
        ),
    }
}

#[test]
fn test_foreign_file_is_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    fs::write(dir.path().join(STATE_FILE), b"definitely not a journal").unwrap();

    let result = Shortener::open(test_config().with_disk_storage(dir.path()));
    assert!(result.is_err());
}

#[test]
fn test_oversized_url_never_reaches_the_journal() {
    let test = TestShortener::new();
    let huge = format!("https://huge.example/{}", "a".repeat(17 * 1024 * 1024));
    let result = test.shortener.shorten(&huge, false, 600);
    assert!(matches!(result, Err(ShortlinkError::InvalidArgument(_))));

    let segment = test.shortener.shorten("https://small.example/", false, 600).unwrap();
    let test = test.reopen();
    assert_eq!(test.shortener.get_url(&segment).unwrap(), "https://small.example/");
}
