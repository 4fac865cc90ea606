// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Integration tests for bundle verification policy and tamper detection
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 7 tests (2 property-based)
//!
//! TEST_SCOPE:
//!   - Any flipped image byte is an integrity failure
//!   - Any flipped manifest byte of a signed bundle is rejected
//!   - Signature policy: required, untrusted, unchecked
//!   - Compatibility mismatch
//!   - Verification is repeatable

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use proptest::prelude::*;
use updates::bundle::MANIFEST_ENTRY;
use updates::{verify_bundle, VerifyError, VerifyPolicy};
use updates_host::{build_bundle, build_bundle_for, entry_span, signing_key, COMPAT};

struct Fixture {
    _dir: tempfile::TempDir,
    bytes: Vec<u8>,
}

fn signed_fixture() -> &'static Fixture {
    static FIXTURE: OnceLock<Fixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = build_bundle(dir.path(), "2.0.0", Some(&signing_key(7)));
        let bytes = fs::read(path).expect("read bundle");
        Fixture { _dir: dir, bytes }
    })
}

fn signed_policy() -> VerifyPolicy {
    VerifyPolicy::signed(COMPAT, vec![signing_key(7).verifying_key()])
}

fn write_tampered(dir: &Path, bytes: &[u8], at: usize) -> PathBuf {
    let mut tampered = bytes.to_vec();
    tampered[at] ^= 0x01;
    let path = dir.join("tampered.bundle");
    fs::write(&path, tampered).expect("write");
    path
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn flipped_image_byte_is_integrity_failure(pick in any::<usize>()) {
        let fixture = signed_fixture();
        let (offset, len) = entry_span(&fixture.bytes, "rootfs.img");
        prop_assume!(len > 0);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_tampered(dir.path(), &fixture.bytes, offset + pick % len);

        match verify_bundle(&path, &signed_policy()) {
            Err(VerifyError::Integrity { entry, .. }) => prop_assert_eq!(entry, "rootfs.img"),
            other => prop_assert!(false, "expected integrity failure, got {:?}", other),
        }
    }

    #[test]
    fn flipped_manifest_byte_is_rejected(pick in any::<usize>()) {
        let fixture = signed_fixture();
        let (offset, len) = entry_span(&fixture.bytes, MANIFEST_ENTRY);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_tampered(dir.path(), &fixture.bytes, offset + pick % len);

        prop_assert!(verify_bundle(&path, &signed_policy()).is_err());
    }
}

#[test]
fn test_signed_bundle_verifies() {
    let fixture = signed_fixture();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ok.bundle");
    fs::write(&path, &fixture.bytes).expect("write");

    let verified = verify_bundle(&path, &signed_policy()).expect("verify");
    assert!(verified.is_signed());
    assert_eq!(verified.version(), "2.0.0");
    assert_eq!(verified.compatible(), COMPAT);
}

#[test]
fn test_unsigned_bundle_rejected_when_signature_required() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = build_bundle(dir.path(), "2.0.0", None);

    let err = verify_bundle(&path, &signed_policy()).expect_err("unsigned must fail");
    assert!(matches!(err, VerifyError::Signature(_)), "{err}");
    assert!(verify_bundle(&path, &VerifyPolicy::unsigned(COMPAT)).is_ok());
}

#[test]
fn test_untrusted_key_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = build_bundle(dir.path(), "2.0.0", Some(&signing_key(9)));

    let err = verify_bundle(&path, &signed_policy()).expect_err("untrusted key");
    assert_eq!(err.kind(), "signature");

    // Signature present but no anchors and not required: accepted unchecked.
    let unchecked = verify_bundle(&path, &VerifyPolicy::unsigned(COMPAT)).expect("verify");
    assert!(!unchecked.is_signed());
}

#[test]
fn test_incompatible_bundle_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = build_bundle_for(dir.path(), "2.0.0", "board-y", None);

    match verify_bundle(&path, &VerifyPolicy::unsigned(COMPAT)) {
        Err(VerifyError::IncompatibleBundle { expected, found }) => {
            assert_eq!(expected, COMPAT);
            assert_eq!(found, "board-y");
        }
        other => panic!("expected incompatible, got {other:?}"),
    }
}

#[test]
fn test_verification_is_repeatable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = build_bundle(dir.path(), "2.0.0", Some(&signing_key(7)));

    let first = verify_bundle(&path, &signed_policy()).expect("first");
    let second = verify_bundle(&path, &signed_policy()).expect("second");
    assert_eq!(first, second);
    assert_eq!(first.manifest_sha256(), second.manifest_sha256());
}
