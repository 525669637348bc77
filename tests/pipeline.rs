// SPDX-License-Identifier: Apache-2.0

//! End-to-end pipeline tests over a synthetic enclave image.

mod common;

use common::{build_enclave, Fixture, GLOBAL_DATA_RVA, NOTE_DESC_OFFSET};

use std::sync::OnceLock;

use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};

use sgx_sign::arch::*;
use sgx_sign::config::Parameters;
use sgx_sign::css;
use sgx_sign::error::Error;
use sgx_sign::key::{parse_key, KeyKind};
use sgx_sign::metadata::{self, Layout, METADATA_MAGIC, METADATA_SIZE};
use sgx_sign::pipeline;

fn test_params() -> Parameters {
    let mut params = Parameters::default();
    params.heap_min_size = 0x1000;
    params.heap_init_size = 0x1000;
    params.heap_max_size = 0x1000;
    params.stack_min_size = 0x1000;
    params.stack_max_size = 0x1000;
    params.tcs_num = 1;
    params.tcs_max_num = 1;
    params.tcs_min_pool = 1;
    params
}

/// One RSA-3072 exponent-3 key pair for the whole test binary; generation
/// is too slow to repeat per test.
fn signing_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new_with_exp(&mut rng, 384 * 8, &BigUint::from(3u8)).unwrap()
    })
}

fn private_material() -> sgx_sign::key::RsaKeyMaterial {
    let pem = signing_key().to_pkcs1_pem(LineEnding::LF).unwrap();
    let (kind, material) = parse_key(&pem);
    assert_eq!(kind, KeyKind::Private);
    material
}

fn public_material() -> sgx_sign::key::RsaKeyMaterial {
    let pem = signing_key()
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    let (kind, material) = parse_key(&pem);
    assert_eq!(kind, KeyKind::Public);
    material
}

#[test]
fn sign_end_to_end() {
    let params = test_params();
    let mut image = build_enclave(Fixture::default());

    let mut measured = pipeline::measure_enclave(&mut image, &params).unwrap();
    pipeline::sign(&mut measured, &private_material()).unwrap();
    pipeline::install_metadata(&mut image, &measured).unwrap();

    // The metadata landed in the note slot.
    let slot = NOTE_DESC_OFFSET as usize;
    let magic = u64::from_le_bytes(image[slot..slot + 8].try_into().unwrap());
    assert_eq!(magic, METADATA_MAGIC);

    // The signature survives an independent verification.
    css::verify_signature(&measured.metadata.enclave_css, &public_material()).unwrap();

    // The patch fixups were applied to the image.
    assert_eq!(&image[0x3C..0x3E], &[0, 0]); // e_shnum
    assert_eq!(&image[0x28..0x30], &[0; 8]); // e_shoff

    // And the signed image dumps.
    let block = pipeline::find_metadata(&image).unwrap();
    let text = metadata::dump(block).unwrap();
    assert!(text.contains("metadata->enclave_size"));
}

// The minimal configuration produces exactly one heap entry, one thread
// block and no groups, with a power-of-two enclave size.
#[test]
fn minimal_layout_shape() {
    let params = test_params();
    let mut image = build_enclave(Fixture::default());
    let measured = pipeline::measure_enclave(&mut image, &params).unwrap();
    let meta = &measured.metadata;

    assert!(meta.enclave_size.is_power_of_two());
    assert!(meta
        .layouts
        .iter()
        .all(|l| matches!(l, Layout::Entry(_))));

    let heap_entries = meta
        .layouts
        .iter()
        .filter_map(Layout::as_entry)
        .filter(|e| {
            matches!(
                e.id,
                LAYOUT_ID_HEAP_MIN | LAYOUT_ID_HEAP_INIT | LAYOUT_ID_HEAP_MAX
            )
        })
        .count();
    assert_eq!(heap_entries, 1);

    // Materialized pages fit below the power-of-two size.
    let pages: u64 = meta
        .layouts
        .iter()
        .filter_map(Layout::as_entry)
        .map(|e| e.page_count as u64)
        .sum();
    assert!(pages << PAGE_SHIFT <= meta.enclave_size);
}

#[test]
fn thread_pools_produce_groups() {
    let mut params = test_params();
    params.tcs_num = 5;
    params.tcs_max_num = 10;
    params.tcs_min_pool = 2;
    params.tcs_max_num_set = true;
    params.tcs_min_pool_set = true;

    let mut image = build_enclave(Fixture::default());
    let measured = pipeline::measure_enclave(&mut image, &params).unwrap();

    let groups: Vec<_> = measured
        .metadata
        .layouts
        .iter()
        .filter_map(|l| match l {
            Layout::Group(g) => Some(g),
            _ => None,
        })
        .collect();
    assert_eq!(groups.len(), 3);
    assert_eq!(groups[0].load_times, 2);
    assert_eq!(groups[2].id, LAYOUT_ID_THREAD_GROUP_DYN);
    assert_eq!(groups[2].load_times, 7);

    // The compatible block collapses back to a single repeated group.
    let compat = measured.metadata.compatible().unwrap();
    let compat_groups: Vec<_> = compat
        .layouts
        .iter()
        .filter_map(|l| match l {
            Layout::Group(g) => Some(g),
            _ => None,
        })
        .collect();
    assert_eq!(compat_groups.len(), 1);
    assert_eq!(compat_groups[0].load_times, 4);
}

#[test]
fn measurement_is_deterministic() {
    let params = test_params();

    let mut first = build_enclave(Fixture::default());
    let mut second = build_enclave(Fixture::default());
    let a = pipeline::measure_enclave(&mut first, &params).unwrap();
    let b = pipeline::measure_enclave(&mut second, &params).unwrap();

    assert_eq!(a.enclave_hash(), b.enclave_hash());
    assert_eq!(first, second);

    // Signing the same measurement twice yields identical bytes.
    let material = private_material();
    let mut a = a;
    let mut b = b;
    // Align the dates so both containers sign the same payload.
    b.metadata.enclave_css.header.date = a.metadata.enclave_css.header.date;
    pipeline::sign(&mut a, &material).unwrap();
    pipeline::sign(&mut b, &material).unwrap();
    assert_eq!(
        a.metadata.enclave_css.key.signature.to_vec(),
        b.metadata.enclave_css.key.signature.to_vec()
    );
    assert_eq!(
        a.metadata.enclave_css.buffer.q1.to_vec(),
        b.metadata.enclave_css.buffer.q1.to_vec()
    );
}

#[test]
fn configuration_changes_the_measurement() {
    let params = test_params();
    let mut bigger = test_params();
    bigger.heap_min_size = 0x2000;
    bigger.heap_init_size = 0x2000;
    bigger.heap_max_size = 0x2000;

    let mut first = build_enclave(Fixture::default());
    let mut second = build_enclave(Fixture::default());
    let a = pipeline::measure_enclave(&mut first, &params).unwrap();
    let b = pipeline::measure_enclave(&mut second, &bigger).unwrap();
    assert_ne!(a.enclave_hash(), b.enclave_hash());
}

// An unsupported relocation halts the pipeline before any mutation.
#[test]
fn unsupported_relocation_is_rejected() {
    let params = test_params();
    let mut image = build_enclave(Fixture {
        bad_reloc: true,
        ..Fixture::default()
    });
    let pristine = image.clone();

    match pipeline::measure_enclave(&mut image, &params) {
        Err(Error::Validation(msg)) => assert!(msg.contains("relocation")),
        other => panic!("expected a validation error, got {:?}", other.map(|_| ())),
    }
    assert_eq!(image, pristine);
}

#[test]
fn already_signed_image_is_rejected() {
    let params = test_params();
    let mut image = build_enclave(Fixture::default());
    let slot = NOTE_DESC_OFFSET as usize;
    image[slot..slot + 8].copy_from_slice(&METADATA_MAGIC.to_le_bytes());

    assert!(matches!(
        pipeline::measure_enclave(&mut image, &params),
        Err(Error::Validation(_))
    ));
}

#[test]
fn tls_extends_the_thread_descriptor() {
    let params = test_params();
    let mut image = build_enclave(Fixture {
        tls: true,
        ..Fixture::default()
    });
    let measured = pipeline::measure_enclave(&mut image, &params).unwrap();

    let td = measured
        .metadata
        .entry_by_id(LAYOUT_ID_TD)
        .expect("thread descriptor entry");
    assert_eq!(td.page_count, 2);
}

#[test]
fn gendata_and_catsig_round_trip() {
    let params = test_params();

    // gendata: measure and export the signing payload.
    let mut image = build_enclave(Fixture::default());
    let measured = pipeline::measure_enclave(&mut image, &params).unwrap();
    let unsigned = pipeline::signing_data(&measured);

    // External facility: sign the payload hash.
    let digest = Sha256::digest(unsigned);
    let signature = signing_key()
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest[..])
        .unwrap();

    // catsig: rebuild, compare and attach.
    let mut image = build_enclave(Fixture::default());
    let mut measured = pipeline::measure_enclave(&mut image, &params).unwrap();
    pipeline::catsig(&mut measured, &public_material(), &unsigned, &signature).unwrap();
    pipeline::install_metadata(&mut image, &measured).unwrap();

    // The container date was adopted from the payload dump.
    assert_eq!(
        measured.metadata.enclave_css.header.date,
        u32::from_le_bytes(unsigned[20..24].try_into().unwrap())
    );
    css::verify_signature(&measured.metadata.enclave_css, &public_material()).unwrap();
}

#[test]
fn catsig_rejects_a_mismatched_payload() {
    let params = test_params();

    let mut image = build_enclave(Fixture::default());
    let measured = pipeline::measure_enclave(&mut image, &params).unwrap();
    let mut unsigned = pipeline::signing_data(&measured);
    unsigned[200] ^= 1; // corrupt the enclave hash

    let signature = vec![0u8; 384];
    let mut image = build_enclave(Fixture::default());
    let mut measured = pipeline::measure_enclave(&mut image, &params).unwrap();
    assert!(matches!(
        pipeline::catsig(&mut measured, &public_material(), &unsigned, &signature),
        Err(Error::Validation(_))
    ));
}

#[test]
fn global_data_is_patched_over_its_symbol() {
    let params = test_params();
    let mut image = build_enclave(Fixture::default());
    let measured = pipeline::measure_enclave(&mut image, &params).unwrap();

    // The first global-data word is the enclave size.
    let dst = GLOBAL_DATA_RVA as usize; // rva equals file offset in the fixture
    let word = u64::from_le_bytes(image[dst..dst + 8].try_into().unwrap());
    assert_eq!(word, measured.metadata.enclave_size);
}

#[test]
fn note_area_fits_both_blocks() {
    let mut params = test_params();
    params.tcs_num = 4;
    params.tcs_max_num = 8;
    params.tcs_min_pool = 2;
    params.tcs_max_num_set = true;
    params.tcs_min_pool_set = true;

    let mut image = build_enclave(Fixture::default());
    let measured = pipeline::measure_enclave(&mut image, &params).unwrap();
    let area = measured.metadata.note_area().unwrap();
    assert_eq!(area.len(), METADATA_SIZE);

    let primary_size = u32::from_le_bytes(area[16..20].try_into().unwrap()) as usize;
    let compat_magic = u64::from_le_bytes(area[primary_size..primary_size + 8].try_into().unwrap());
    assert_eq!(compat_magic, METADATA_MAGIC);
}
