//! Delta encode/decode on image-sized inputs

use std::io::Cursor;

use rdfm_client::delta;

mod common;
use common::random_bytes;

const IMAGE_SIZE: usize = 1024 * 1024;

/// Base image and a target with a patched block, an insertion and a
/// truncated tail
fn images() -> (Vec<u8>, Vec<u8>) {
    let base = random_bytes(7, IMAGE_SIZE);

    let mut target = base.clone();
    target[4096..8192].copy_from_slice(&random_bytes(8, 4096));
    let inserted = random_bytes(9, 1500);
    target.splice(300_000..300_000, inserted);
    target.truncate(IMAGE_SIZE - 10_000);
    (base, target)
}

fn round_trip(algorithm: &str) {
    let engine = delta::parse(algorithm).unwrap();
    let (base, target) = images();

    let mut patch = Vec::new();
    engine
        .encode(&mut base.as_slice(), &mut target.as_slice(), &mut patch)
        .unwrap();
    assert!(
        patch.len() < IMAGE_SIZE / 4,
        "{algorithm} delta is {} bytes",
        patch.len()
    );

    let detected = delta::detect(&patch).unwrap();
    assert_eq!(detected.name(), engine.name());

    let mut rebuilt = Vec::new();
    detected
        .decode(&mut Cursor::new(&base), &mut patch.as_slice(), &mut rebuilt)
        .unwrap();
    assert_eq!(rebuilt.len(), target.len());
    assert!(rebuilt == target, "{algorithm} reconstruction differs");
}

#[test]
fn test_rsync_round_trip() {
    round_trip("rsync");
}

#[test]
fn test_xdelta_round_trip() {
    round_trip("xdelta");
}

/// Unrelated images sharing only a 64 KiB prefix
#[test]
fn test_random_images_with_common_prefix() {
    let base = random_bytes(21, IMAGE_SIZE);
    let mut target = random_bytes(22, IMAGE_SIZE);
    target[..64 * 1024].copy_from_slice(&base[..64 * 1024]);

    for engine in delta::supported() {
        let mut patch = Vec::new();
        engine
            .encode(&mut base.as_slice(), &mut target.as_slice(), &mut patch)
            .unwrap();
        let mut rebuilt = Vec::new();
        engine
            .decode(&mut Cursor::new(&base), &mut patch.as_slice(), &mut rebuilt)
            .unwrap();
        assert!(rebuilt == target, "{} reconstruction differs", engine.name());
    }
}

#[test]
fn test_wrong_base_is_detected_or_differs() {
    let engine = delta::parse("xdelta").unwrap();
    let (base, target) = images();
    let mut patch = Vec::new();
    engine
        .encode(&mut base.as_slice(), &mut target.as_slice(), &mut patch)
        .unwrap();

    let other_base = random_bytes(99, IMAGE_SIZE);
    let mut rebuilt = Vec::new();
    let result = engine.decode(&mut Cursor::new(&other_base), &mut patch.as_slice(), &mut rebuilt);
    assert!(result.is_err() || rebuilt != target);
}

#[test]
fn test_supported_engines_are_advertised() {
    let names: Vec<_> = delta::supported().iter().map(|e| e.name()).collect();
    assert!(names.contains(&"rsync"));
    assert!(names.contains(&"xdelta"));
    assert_eq!(delta::support_key("xdelta"), "rdfm.software.supports_xdelta");
}
