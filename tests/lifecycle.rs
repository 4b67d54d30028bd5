use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use aes::Aes128;
use base64::{engine::general_purpose, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs8::LineEnding;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};

use rusty_ota::bundle::{BundleInfo, BundleLayout, BundleStatus};
use rusty_ota::delay::{DelayCondition, DelayConditionKind, DelayGate};
use rusty_ota::error::BundleError;
use rusty_ota::integrity::{digest_directory, SessionDecryptor};
use rusty_ota::lifecycle::{BundleManager, EndpointKind, LifecyclePolicy};
use rusty_ota::store::{ManifestStore, PersistPolicy};

fn keep_everything() -> LifecyclePolicy {
    LifecyclePolicy {
        auto_delete_previous: false,
        auto_delete_failed: false,
        ..LifecyclePolicy::default()
    }
}

fn open_manager(root: &Path, policy: LifecyclePolicy) -> BundleManager {
    let store = ManifestStore::new(root.join("data").join("manifest.json"))
        .with_persist_policy(PersistPolicy {
            custom_id: true,
            endpoints: true,
        })
        .load();
    let layout = BundleLayout::new(root.join("data").join("bundles"), root.join("public"));
    BundleManager::new(store, layout)
        .expect("manager")
        .with_policy(policy)
}

async fn install(manager: &BundleManager, root: &Path, version: &str) -> BundleInfo {
    let source = root.join("sources").join(version);
    fs::create_dir_all(source.join("assets")).expect("mkdir source");
    fs::write(source.join("index.html"), format!("<html>{version}</html>")).expect("write index");
    fs::write(
        source.join("assets").join("app.js"),
        format!("boot('{version}')"),
    )
    .expect("write js");
    let checksum = digest_directory(&source).expect("digest");
    manager
        .import_directory(&source, version, Some(checksum))
        .await
        .expect("import bundle")
}

fn tamper(manager: &BundleManager, id: &str) {
    fs::write(
        manager.layout().bundle_dir(id).join("assets").join("app.js"),
        "evil()",
    )
    .expect("tamper");
}

#[tokio::test]
async fn delete_refuses_builtin_current_and_next_bundles() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(temp.path(), keep_everything());
    let current = install(&manager, temp.path(), "1.0.0").await;
    let queued = install(&manager, temp.path(), "1.1.0").await;
    let spare = install(&manager, temp.path(), "1.2.0").await;
    manager.set(&current.id).await.expect("set");
    manager.next(&queued.id).await.expect("next");

    for id in ["builtin", current.id.as_str(), queued.id.as_str()] {
        let err = manager.delete_bundle(id).await.expect_err("must refuse");
        assert!(matches!(err, BundleError::InvalidState { .. }), "{id}: {err}");
    }
    let err = manager.delete_bundle("nope").await.expect_err("unknown");
    assert!(matches!(err, BundleError::NotFound { .. }));

    manager.delete_bundle(&spare.id).await.expect("delete spare");
    assert!(!manager.layout().bundle_dir(&spare.id).exists());
    assert!(matches!(
        manager.get(&spare.id).await,
        Err(BundleError::NotFound { .. })
    ));
}

#[tokio::test]
async fn next_requires_success_status_and_intact_files() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(
        temp.path(),
        LifecyclePolicy {
            allow_manual_bundle_error: true,
            ..keep_everything()
        },
    );
    assert!(matches!(
        manager.next("missing").await,
        Err(BundleError::NotFound { .. })
    ));

    let failed = install(&manager, temp.path(), "1.0.0").await;
    manager.set_bundle_error(&failed.id).await.expect("mark error");
    assert!(matches!(
        manager.next(&failed.id).await,
        Err(BundleError::InvalidState { .. })
    ));

    let tampered = install(&manager, temp.path(), "1.1.0").await;
    tamper(&manager, &tampered.id);
    assert!(matches!(
        manager.next(&tampered.id).await,
        Err(BundleError::IntegrityFailure { .. })
    ));
    assert!(manager.next_bundle().await.is_none());

    let good = install(&manager, temp.path(), "1.2.0").await;
    manager.next(&good.id).await.expect("next");
    assert_eq!(manager.next_bundle().await.map(|b| b.id), Some(good.id));
}

#[tokio::test]
async fn set_builtin_skips_verification_and_emits_reload() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(temp.path(), keep_everything());
    let activation = manager.set("builtin").await.expect("set builtin");
    assert!(activation.bundle.is_builtin());
    let names = manager
        .events()
        .drain()
        .iter()
        .map(|event| event.name())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["appReloaded"]);
}

#[tokio::test]
async fn apply_pending_update_is_idempotent_and_clears_delay() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(temp.path(), LifecyclePolicy::default());
    let first = install(&manager, temp.path(), "1.0.0").await;
    manager.set(&first.id).await.expect("set");
    let second = install(&manager, temp.path(), "2.0.0").await;
    manager.next(&second.id).await.expect("next");
    manager
        .set_delay_conditions(vec![DelayCondition::new(
            DelayConditionKind::NativeVersion,
            Some("1.0.0"),
        )])
        .await
        .expect("delay");

    let gate = DelayGate::new("1.0.0", &[], false);
    let outcome = manager.apply_pending_update(&gate).await.expect("apply");
    assert!(outcome.swapped);
    assert_eq!(outcome.current.id, second.id);
    assert_eq!(outcome.previous_id.as_deref(), Some(first.id.as_str()));
    assert!(manager.delay_conditions().await.is_empty());
    assert!(manager.next_bundle().await.is_none());
    assert!(
        !manager.layout().bundle_dir(&first.id).exists(),
        "previous bundle is removed when auto delete is on"
    );

    let again = manager.apply_pending_update(&gate).await.expect("apply again");
    assert!(!again.swapped);
    assert_eq!(again.current.id, second.id);
}

#[tokio::test]
async fn apply_pending_update_respects_delay_gate() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(temp.path(), keep_everything());
    let queued = install(&manager, temp.path(), "1.0.0").await;
    manager.next(&queued.id).await.expect("next");
    let kill = vec![DelayCondition::new(DelayConditionKind::Kill, None)];
    manager
        .set_delay_conditions(kill.clone())
        .await
        .expect("delay");

    let clean_start = DelayGate::new("1.0.0", &kill, false);
    let outcome = manager
        .apply_pending_update(&clean_start)
        .await
        .expect("apply");
    assert!(outcome.deferred);
    assert!(outcome.current.is_builtin());

    let after_kill = DelayGate::new("1.0.0", &kill, true);
    let outcome = manager.apply_pending_update(&after_kill).await.expect("apply");
    assert!(outcome.swapped);
    assert_eq!(outcome.current.id, queued.id);
}

#[tokio::test]
async fn tampered_pending_bundle_is_never_activated() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(temp.path(), keep_everything());
    let queued = install(&manager, temp.path(), "1.0.0").await;
    manager.next(&queued.id).await.expect("next");
    tamper(&manager, &queued.id);

    let gate = DelayGate::new("1.0.0", &[], false);
    let outcome = manager.apply_pending_update(&gate).await.expect("apply");
    assert!(!outcome.swapped);
    assert!(outcome.current.is_builtin());
    assert!(manager.next_bundle().await.is_none());
    assert_eq!(
        manager.get(&queued.id).await.expect("bundle").status,
        BundleStatus::Error
    );
}

#[tokio::test]
async fn rollback_restores_last_successful_and_records_failure_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(temp.path(), keep_everything());
    let stable = install(&manager, temp.path(), "1.0.0").await;
    manager.set(&stable.id).await.expect("set stable");
    manager.mark_bundle_successful().await.expect("confirm");

    let broken = install(&manager, temp.path(), "2.0.0").await;
    manager.set(&broken.id).await.expect("set broken");
    manager.events().drain();

    let report = manager.rollback().await.expect("rollback");
    assert!(report.rolled_back);
    assert_eq!(report.current.id, stable.id);
    assert_eq!(
        report.failed.as_ref().map(|bundle| bundle.id.as_str()),
        Some(broken.id.as_str())
    );
    assert_eq!(
        manager.get(&broken.id).await.expect("broken").status,
        BundleStatus::Error
    );

    let names = manager
        .events()
        .drain()
        .iter()
        .map(|event| event.name())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["updateFailed"]);

    let failed = manager
        .get_failed_update()
        .await
        .expect("failed update")
        .expect("recorded");
    assert_eq!(failed.bundle.id, broken.id);
    assert!(manager.get_failed_update().await.expect("second read").is_none());
}

#[tokio::test]
async fn rollback_falls_back_to_builtin_when_last_successful_is_gone() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(temp.path(), keep_everything());
    let stable = install(&manager, temp.path(), "1.0.0").await;
    manager.set(&stable.id).await.expect("set stable");
    manager.mark_bundle_successful().await.expect("confirm");

    let broken = install(&manager, temp.path(), "2.0.0").await;
    manager.set(&broken.id).await.expect("set broken");
    assert_eq!(
        manager.manifest().await.last_successful_bundle_id,
        Some(stable.id.clone())
    );
    fs::remove_dir_all(manager.layout().bundle_dir(&stable.id)).expect("wipe stable files");

    let report = manager.rollback().await.expect("rollback");
    assert!(report.rolled_back);
    assert!(report.current.is_builtin());
    let failed = manager.get(&broken.id).await.expect("failed bundle is kept");
    assert_eq!(failed.status, BundleStatus::Error);
}

#[tokio::test]
async fn manual_error_on_queued_bundle_clears_next_and_auto_deletes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(
        temp.path(),
        LifecyclePolicy {
            allow_manual_bundle_error: true,
            ..LifecyclePolicy::default()
        },
    );
    let current = install(&manager, temp.path(), "1.0.0").await;
    manager.set(&current.id).await.expect("set current");
    let queued = install(&manager, temp.path(), "1.1.0").await;
    manager.next(&queued.id).await.expect("queue");

    let failed = manager.set_bundle_error(&queued.id).await.expect("mark failed");
    assert_eq!(failed.status, BundleStatus::Error);
    assert!(manager.next_bundle().await.is_none());
    assert_eq!(manager.manifest().await.next_bundle_id, None);
    assert!(!manager.layout().bundle_dir(&queued.id).exists());
    let err = manager.get(&queued.id).await.expect_err("deleted");
    assert_eq!(err.kind(), "not_found");

    let reopened = open_manager(temp.path(), keep_everything());
    assert!(reopened.next_bundle().await.is_none());
    assert_eq!(reopened.current().await.id, current.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_operations_leave_a_consistent_manifest() {
    for _ in 0..4 {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = Arc::new(open_manager(temp.path(), LifecyclePolicy::default()));
        let stable = install(&manager, temp.path(), "1.0.0").await;
        manager.set(&stable.id).await.expect("set stable");
        manager.mark_bundle_successful().await.expect("confirm");
        let queued = install(&manager, temp.path(), "1.1.0").await;
        let other = install(&manager, temp.path(), "1.2.0").await;
        manager.next(&queued.id).await.expect("queue");

        let (m1, m2, m3, m4, m5) = (
            Arc::clone(&manager),
            Arc::clone(&manager),
            Arc::clone(&manager),
            Arc::clone(&manager),
            Arc::clone(&manager),
        );
        let queued_id = queued.id.clone();
        let _ = tokio::join!(
            async move { m1.set(&other.id).await.map(|_| ()) },
            async move { m2.next(&queued.id).await.map(|_| ()) },
            async move { m3.delete_bundle(&stable.id).await },
            async move { m4.rollback().await.map(|_| ()) },
            async move { m5.delete_bundle(&queued_id).await },
        );
        drop(manager);

        let reopened = open_manager(temp.path(), keep_everything());
        let manifest = reopened.manifest().await;
        let current = reopened.current().await;
        assert_eq!(current.id, manifest.current_bundle_id);
        if !current.is_builtin() {
            assert!(manifest.bundles.contains_key(&current.id));
            assert!(reopened.layout().files_present(&current.id));
        }
        if let Some(next_id) = manifest.next_bundle_id.as_deref() {
            let next = manifest.bundles.get(next_id).expect("next is registered");
            assert_eq!(next.status, BundleStatus::Success);
            assert!(reopened.layout().files_present(next_id));
        }
    }
}

fn encrypt_cbc(key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8> {
    cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
        .expect("cipher")
        .encrypt_padded_vec_mut::<Pkcs7>(data)
}

fn brotli_compress(data: &[u8]) -> Vec<u8> {
    let mut compressed = Vec::new();
    {
        let mut writer = brotli::CompressorWriter::new(&mut compressed, 4096, 9, 22);
        writer.write_all(data).expect("compress");
    }
    compressed
}

#[tokio::test]
async fn encrypted_import_decrypts_files_and_checksum() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("rsa key");
    let public_pem = private_key
        .to_public_key()
        .to_pkcs1_pem(LineEnding::LF)
        .expect("pem");
    let aes_key = [9u8; 16];
    let iv = [4u8; 16];
    let wrapped_key = private_key
        .sign(Pkcs1v15Sign::new_unprefixed(), &aes_key)
        .expect("wrap key");
    let session_key = format!(
        "{}:{}",
        general_purpose::STANDARD.encode(iv),
        general_purpose::STANDARD.encode(wrapped_key)
    );

    let files: [(&str, &[u8]); 2] = [
        ("index.html", b"<html>2.0.0</html>"),
        ("assets/app.js", b"boot('2.0.0')"),
    ];
    let plain = temp.path().join("plain");
    let encrypted = temp.path().join("encrypted");
    for (name, content) in files {
        for root in [&plain, &encrypted] {
            fs::create_dir_all(root.join("assets")).expect("mkdir");
        }
        fs::write(plain.join(name), content).expect("write plain");
        let sealed = encrypt_cbc(&aes_key, &iv, &brotli_compress(content));
        fs::write(encrypted.join(name), sealed).expect("write encrypted");
    }
    let checksum = digest_directory(&plain).expect("digest");
    let sealed_checksum =
        general_purpose::STANDARD.encode(encrypt_cbc(&aes_key, &iv, checksum.as_bytes()));

    let manager = open_manager(temp.path(), keep_everything())
        .with_decryptor(SessionDecryptor::new(Some(public_pem.as_str())).expect("decryptor"));
    let bundle = manager
        .import_encrypted_directory(&encrypted, "2.0.0", Some(sealed_checksum), &session_key)
        .await
        .expect("encrypted import");
    assert_eq!(bundle.status, BundleStatus::Success);
    assert_eq!(bundle.checksum, checksum);
    let dir = manager.layout().bundle_dir(&bundle.id);
    assert_eq!(
        fs::read(dir.join("index.html")).expect("read index"),
        b"<html>2.0.0</html>".to_vec()
    );
    assert_eq!(
        fs::read(dir.join("assets").join("app.js")).expect("read js"),
        b"boot('2.0.0')".to_vec()
    );

    let keyless = open_manager(&temp.path().join("keyless"), keep_everything());
    let err = keyless
        .import_encrypted_directory(&encrypted, "2.0.0", None, &session_key)
        .await
        .expect_err("no public key to recover the session key");
    assert_eq!(err.kind(), "integrity_failure");
    assert!(keyless
        .list(true)
        .await
        .iter()
        .all(|bundle| bundle.status != BundleStatus::Success || bundle.is_builtin()));
}

#[tokio::test]
async fn rollback_on_builtin_is_a_no_op() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(temp.path(), keep_everything());
    let report = manager.rollback().await.expect("rollback");
    assert!(!report.rolled_back);
    assert!(manager.get_failed_update().await.expect("read").is_none());
}

#[tokio::test]
async fn reset_returns_to_builtin_or_last_successful() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(temp.path(), keep_everything());
    let stable = install(&manager, temp.path(), "1.0.0").await;
    manager.set(&stable.id).await.expect("set");
    manager.mark_bundle_successful().await.expect("confirm");
    let newer = install(&manager, temp.path(), "1.1.0").await;
    manager.set(&newer.id).await.expect("set newer");

    let current = manager.reset(true).await.expect("reset to last successful");
    assert_eq!(current.id, stable.id);
    let current = manager.reset(false).await.expect("reset to builtin");
    assert!(current.is_builtin());
}

#[tokio::test]
async fn cleanup_removes_failed_bundles_and_orphan_directories() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(
        temp.path(),
        LifecyclePolicy {
            auto_delete_failed: true,
            auto_delete_previous: false,
            allow_manual_bundle_error: true,
            allow_modify_url: false,
        },
    );
    let bundle = install(&manager, temp.path(), "1.0.0").await;
    let orphan = manager.layout().bundles_dir().join("leftover");
    fs::create_dir_all(&orphan).expect("orphan");

    let staged = manager.stage_download("2.0.0").await.expect("stage");
    manager.fail_download(&staged.id, "network").await.expect("fail");

    let report = manager.cleanup().await;
    assert_eq!(report.deleted_failed, vec![staged.id.clone()]);
    assert_eq!(report.removed_orphans, vec!["leftover".to_string()]);
    assert!(!orphan.exists());
    assert!(manager.layout().bundle_dir(&bundle.id).exists());
}

#[tokio::test]
async fn manifest_changes_survive_reload() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (bundle, device_id) = {
        let manager = open_manager(
            temp.path(),
            LifecyclePolicy {
                allow_modify_url: true,
                ..keep_everything()
            },
        );
        let bundle = install(&manager, temp.path(), "1.0.0").await;
        manager.set(&bundle.id).await.expect("set");
        manager
            .set_custom_id(Some("customer-42".to_string()))
            .await
            .expect("custom id");
        manager
            .set_channel(Some("beta".to_string()))
            .await
            .expect("channel");
        manager
            .set_endpoint(
                EndpointKind::Update,
                Some("https://updates.example.com/check".to_string()),
            )
            .await
            .expect("endpoint");
        (bundle, manager.device_id().await)
    };

    let reopened = open_manager(temp.path(), keep_everything());
    assert_eq!(reopened.current().await.id, bundle.id);
    assert_eq!(reopened.device_id().await, device_id);
    assert_eq!(reopened.custom_id().await.as_deref(), Some("customer-42"));
    assert_eq!(reopened.channel().await.as_deref(), Some("beta"));
    assert_eq!(
        reopened.endpoint_overrides().await.update_url.as_deref(),
        Some("https://updates.example.com/check")
    );
}

#[tokio::test]
async fn list_hides_bundles_with_missing_files_unless_raw() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = open_manager(temp.path(), keep_everything());
    let bundle = install(&manager, temp.path(), "1.0.0").await;
    fs::remove_file(manager.layout().entry_point(&bundle.id)).expect("remove index");

    let visible = manager.list(false).await;
    assert_eq!(visible.len(), 1);
    assert!(visible[0].is_builtin());
    assert_eq!(manager.list(true).await.len(), 2);
}
