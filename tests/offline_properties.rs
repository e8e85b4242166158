//! End-to-end behaviour of the offline service through its public API.

mod common;

use common::{device_secret, fingerprint, registration, Harness};
use offline_warden::crypto::cipher::decrypt_chunked;
use offline_warden::crypto::signing::sign_request_header;
use offline_warden::crypto::verify::verify_signed_url;
use offline_warden::crypto::wrap::unwrap_on_device;
use offline_warden::protocol::range::parse_range_header;
use offline_warden::{
    AuditAction, AuditQuery, DownloadParams, JobStatus, LicenseStatus, ObjectStorage,
    OfflineError, OfflineEvent, SystemClock,
};
use std::sync::Arc;
use tokio::sync::Barrier;
use uuid::Uuid;

const BODY: &[u8] = b"Lecture notes: chunked, encrypted, and delivered for offline study. \
Each chunk is sealed with AES-256-GCM under a per-material key.";

fn params(material_id: Uuid, device_id: Uuid, n: usize, license_id: Uuid) -> DownloadParams {
    DownloadParams {
        material_id,
        device_id,
        fingerprint: fingerprint(n),
        license_id,
        range: None,
    }
}

#[tokio::test]
async fn test_device_cap_and_slot_release() {
    let h = Harness::new(true);
    let mut devices = Vec::new();
    for n in 0..5 {
        devices.push(h.register(n).await);
    }

    let sixth = h.service.register_device(&h.ctx(), registration(5, "ios")).await;
    assert!(matches!(sixth, Err(OfflineError::DeviceLimitExceeded { max: 5 })));

    h.service
        .deregister_device(&h.ctx(), devices[2].id)
        .await
        .unwrap();
    h.register(5).await;
    assert!(matches!(
        h.service.register_device(&h.ctx(), registration(6, "ios")).await,
        Err(OfflineError::DeviceLimitExceeded { .. })
    ));

    let listed = h.service.list_devices(&h.ctx()).await.unwrap();
    assert_eq!(listed.len(), 5);
    assert!(listed.iter().all(|d| d.id != devices[2].id));
}

const RACERS: usize = 4;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_issue_yields_one_license() {
    for round in 0..25 {
        let h = Harness::new(round % 2 == 0);
        let device = h.register(1).await;
        let material = h.add_material("pdf", BODY).await;

        let barrier = Arc::new(Barrier::new(RACERS));
        let racers: Vec<_> = (0..RACERS)
            .map(|_| {
                let (service, ctx, barrier) = (h.service.clone(), h.ctx(), barrier.clone());
                let device_id = device.id;
                tokio::spawn(async move {
                    barrier.wait().await;
                    service
                        .issue_license(&ctx, material, device_id, &fingerprint(1))
                        .await
                })
            })
            .collect();

        let mut issued = Vec::new();
        for racer in racers {
            issued.push(racer.await.unwrap().unwrap());
        }
        let id = issued[0].license.id;
        assert!(issued.iter().all(|i| i.license.id == id), "round {}", round);
        assert_eq!(issued.iter().filter(|i| i.created).count(), 1, "round {}", round);
        assert_eq!(h.licenses.active_count(h.user, material, device.id), 1);
    }
}

#[tokio::test]
async fn test_validate_rotates_nonce_and_rejects_old_one() {
    let h = Harness::new(true);
    let device = h.register(1).await;
    let material = h.add_material("pdf", BODY).await;
    let fp = fingerprint(1);
    let issued = h
        .service
        .issue_license(&h.ctx(), material, device.id, &fp)
        .await
        .unwrap()
        .license;

    let validated = h
        .service
        .validate_license(&h.ctx(), issued.id, &fp, &issued.nonce)
        .await
        .unwrap();
    assert_ne!(validated.nonce, issued.nonce);
    assert!(validated.last_validated_at.is_some());

    assert!(matches!(
        h.service
            .validate_license(&h.ctx(), issued.id, &fp, &issued.nonce)
            .await,
        Err(OfflineError::NonceMismatch)
    ));

    // The rotated nonce keeps working
    assert!(h
        .service
        .validate_license(&h.ctx(), issued.id, &fp, &validated.nonce)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_lockout_after_five_failures() {
    let h = Harness::new(true);
    let device = h.register(1).await;
    let material = h.add_material("docx", BODY).await;
    let fp = fingerprint(1);
    let license = h
        .service
        .issue_license(&h.ctx(), material, device.id, &fp)
        .await
        .unwrap()
        .license;

    let wrong = fingerprint(99);
    for _ in 0..5 {
        assert!(matches!(
            h.service
                .validate_license(&h.ctx(), license.id, &wrong, &license.nonce)
                .await,
            Err(OfflineError::FingerprintMismatch)
        ));
    }
    let blocked = h
        .service
        .validate_license(&h.ctx(), license.id, &fp, &license.nonce)
        .await;
    assert!(matches!(blocked, Err(OfflineError::DeviceBlocked)));
    assert_eq!(blocked.unwrap_err().status(), http::StatusCode::FORBIDDEN);

    h.service.unblock_device(device.id).await.unwrap();
    assert!(h
        .service
        .validate_license(&h.ctx(), license.id, &fp, &license.nonce)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_operator_block() {
    let h = Harness::new(true);
    let device = h.register(1).await;
    let material = h.add_material("pdf", BODY).await;
    let fp = fingerprint(1);
    let license = h
        .service
        .issue_license(&h.ctx(), material, device.id, &fp)
        .await
        .unwrap()
        .license;

    h.service
        .block_device(device.id, std::time::Duration::from_secs(600))
        .await
        .unwrap();
    assert!(matches!(
        h.service
            .validate_license(&h.ctx(), license.id, &fp, &license.nonce)
            .await,
        Err(OfflineError::DeviceBlocked)
    ));
}

#[tokio::test]
async fn test_deregister_cascades_to_licenses() {
    for cache_enabled in [true, false] {
        let h = Harness::new(cache_enabled);
        let device = h.register(1).await;
        let fp = fingerprint(1);
        let first = h.add_material("pdf", BODY).await;
        let second = h.add_material("pptx", BODY).await;

        let l1 = h.service.issue_license(&h.ctx(), first, device.id, &fp).await.unwrap().license;
        let l2 = h.service.issue_license(&h.ctx(), second, device.id, &fp).await.unwrap().license;

        // Warm the license cache before the cascade
        let l1 = h.service.validate_license(&h.ctx(), l1.id, &fp, &l1.nonce).await.unwrap();

        let gone = h.service.deregister_device(&h.ctx(), device.id).await.unwrap();
        assert_eq!(gone.revoked_licenses.len(), 2);
        assert!(gone
            .revoked_licenses
            .iter()
            .all(|l| l.status == LicenseStatus::Revoked));

        for (id, nonce) in [(l1.id, l1.nonce.clone()), (l2.id, l2.nonce.clone())] {
            assert!(matches!(
                h.service.validate_license(&h.ctx(), id, &fp, &nonce).await,
                Err(OfflineError::LicenseRevoked)
            ));
        }
        assert!(matches!(
            h.service.deregister_device(&h.ctx(), device.id).await,
            Err(OfflineError::DeviceNotFound)
        ));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_downloads_share_one_job() {
    for round in 0..10 {
        let h = Harness::new(true);
        let device = h.register(1).await;
        let material = h.add_material("pdf", BODY).await;
        let license = h
            .service
            .issue_license(&h.ctx(), material, device.id, &fingerprint(1))
            .await
            .unwrap()
            .license;

        let race = || {
            let barrier = Arc::new(Barrier::new(RACERS));
            (0..RACERS)
                .map(|_| {
                    let (service, ctx, barrier) = (h.service.clone(), h.ctx(), barrier.clone());
                    let request = params(material, device.id, 1, license.id);
                    tokio::spawn(async move {
                        barrier.wait().await;
                        service.download_material(&ctx, request).await
                    })
                })
                .collect::<Vec<_>>()
        };

        let mut job_ids = Vec::new();
        for racer in race() {
            match racer.await.unwrap() {
                Err(OfflineError::ArtifactNotReady { job_id, .. }) => job_ids.push(job_id),
                other => panic!("round {}: expected ArtifactNotReady, got {:?}", round, other),
            }
        }
        assert!(job_ids.iter().all(|id| *id == job_ids[0]), "round {}", round);
        assert_eq!(h.jobs.len(), 1);

        assert_eq!(h.service.run_pending_jobs().await.unwrap(), 1);
        let job = h.service.job(job_ids[0]).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.license_id, Some(license.id));

        let mut hashes = Vec::new();
        for racer in race() {
            hashes.push(racer.await.unwrap().unwrap().manifest.encrypted_hash);
        }
        assert!(hashes.iter().all(|h| *h == hashes[0]));
        assert_eq!(h.jobs.len(), 1);
    }
}

#[tokio::test]
async fn test_download_manifest_decrypts_and_url_verifies() {
    let h = Harness::new(true);
    let device = h.register(1).await;
    let material = h.add_material("pdf", BODY).await;
    let license = h
        .service
        .issue_license(&h.ctx(), material, device.id, &fingerprint(1))
        .await
        .unwrap()
        .license;

    let _ = h
        .service
        .download_material(&h.ctx(), params(material, device.id, 1, license.id))
        .await;
    h.service.run_pending_jobs().await.unwrap();

    let ticket = h
        .service
        .download_material(&h.ctx(), params(material, device.id, 1, license.id))
        .await
        .unwrap();
    assert_eq!(ticket.status(), http::StatusCode::OK);

    let manifest = &ticket.manifest;
    assert_eq!(manifest.license_id, license.id);
    assert_eq!(manifest.chunk_size, 64);
    assert_eq!(manifest.total_chunks as usize, manifest.chunks.len());
    assert_eq!(
        manifest.total_size,
        manifest.chunks.iter().map(|c| c.size).sum::<u64>()
    );

    // Signed URL: {base}/{key}?expires=..&signature=..
    let (path, query) = ticket.url.split_once('?').unwrap();
    let object_key = path
        .strip_prefix(&format!("{}/", h.service.config().download.object_base_url))
        .unwrap();
    let mut expires = 0i64;
    let mut signature = "";
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("expires", v)) => expires = v.parse().unwrap(),
            Some(("signature", v)) => signature = v,
            _ => {}
        }
    }
    assert_eq!(expires, ticket.expires_at.timestamp());
    verify_signed_url(
        object_key,
        expires,
        signature,
        &h.service.url_public_key_hex(),
        &SystemClock,
    )
    .unwrap();
    assert!(matches!(
        verify_signed_url(
            "encrypted/other.enc",
            expires,
            signature,
            &h.service.url_public_key_hex(),
            &SystemClock,
        ),
        Err(OfflineError::SignatureInvalid)
    ));

    // Only the licensed device can unwrap the content key
    let sealed = h.storage.get(object_key).await.unwrap().unwrap();
    let key = unwrap_on_device(&ticket.wrapped_key, &device_secret(1)).unwrap();
    assert_eq!(decrypt_chunked(&sealed, &manifest.chunks, key.as_slice().try_into().unwrap()).unwrap(), BODY);
    assert!(unwrap_on_device(&ticket.wrapped_key, &device_secret(2)).is_err());
}

#[tokio::test]
async fn test_range_download_framing() {
    let h = Harness::new(true);
    let device = h.register(1).await;
    let material = h.add_material("pdf", BODY).await;
    let license = h
        .service
        .issue_license(&h.ctx(), material, device.id, &fingerprint(1))
        .await
        .unwrap()
        .license;
    let _ = h
        .service
        .download_material(&h.ctx(), params(material, device.id, 1, license.id))
        .await;
    h.service.run_pending_jobs().await.unwrap();

    let mut request = params(material, device.id, 1, license.id);
    request.range = Some("bytes=10-".to_string());
    let ticket = h.service.download_material(&h.ctx(), request).await.unwrap();
    let total = ticket.manifest.total_size;

    assert_eq!(ticket.status(), http::StatusCode::PARTIAL_CONTENT);
    let headers = ticket.headers();
    assert_eq!(headers["accept-ranges"], "bytes");
    assert_eq!(
        headers["content-range"].to_str().unwrap(),
        format!("bytes 10-{}/{}", total - 1, total)
    );
    assert_eq!(
        headers["content-length"].to_str().unwrap(),
        (total - 10).to_string()
    );
    assert_eq!(headers["x-ratelimit-limit"], "10");

    let mut past_end = params(material, device.id, 1, license.id);
    past_end.range = Some(format!("bytes={}-", total));
    assert!(matches!(
        h.service.download_material(&h.ctx(), past_end).await,
        Err(OfflineError::InvalidRange(_))
    ));

    let mut wrong_unit = params(material, device.id, 1, license.id);
    wrong_unit.range = Some("chars=0-100".to_string());
    let err = h.service.download_material(&h.ctx(), wrong_unit).await.unwrap_err();
    assert_eq!(err.status(), http::StatusCode::BAD_REQUEST);
}

#[test]
fn test_range_header_contract() {
    let closed = parse_range_header("bytes=0-999").unwrap();
    assert_eq!((closed.start, closed.end), (0, Some(999)));
    let open = parse_range_header("bytes=100-").unwrap();
    assert_eq!((open.start, open.end), (100, None));
    for bad in ["bytes=1000-500", "chars=0-100", "", "bytes="] {
        assert!(
            matches!(parse_range_header(bad), Err(OfflineError::InvalidRange(_))),
            "{:?} should be rejected",
            bad
        );
    }
}

#[tokio::test]
async fn test_download_quota() {
    let h = Harness::new(true);
    let device = h.register(1).await;
    let material = h.add_material("pdf", BODY).await;
    let license = h
        .service
        .issue_license(&h.ctx(), material, device.id, &fingerprint(1))
        .await
        .unwrap()
        .license;

    // Polling while the artifact is pending is free
    for _ in 0..3 {
        assert!(matches!(
            h.service
                .download_material(&h.ctx(), params(material, device.id, 1, license.id))
                .await,
            Err(OfflineError::ArtifactNotReady { .. })
        ));
    }
    h.service.run_pending_jobs().await.unwrap();

    for n in 0..10u64 {
        let ticket = h
            .service
            .download_material(&h.ctx(), params(material, device.id, 1, license.id))
            .await
            .unwrap();
        assert_eq!(ticket.rate_limit.remaining, 9 - n);
    }

    let err = h
        .service
        .download_material(&h.ctx(), params(material, device.id, 1, license.id))
        .await
        .unwrap_err();
    assert!(matches!(err, OfflineError::RateLimited { limit: 10, .. }));
    assert_eq!(err.status(), http::StatusCode::TOO_MANY_REQUESTS);
    assert!(err.retry_after().unwrap() > 0);
}

#[tokio::test]
async fn test_download_gates() {
    let h = Harness::new(true);
    let device = h.register(1).await;
    let other = h.register(2).await;
    let material = h.add_material("pdf", BODY).await;
    let license = h
        .service
        .issue_license(&h.ctx(), material, device.id, &fingerprint(1))
        .await
        .unwrap()
        .license;

    // License bound to another device
    assert!(matches!(
        h.service
            .download_material(&h.ctx(), params(material, other.id, 2, license.id))
            .await,
        Err(OfflineError::LicenseInvalid(_))
    ));

    // Wrong fingerprint for the bound device
    assert!(matches!(
        h.service
            .download_material(&h.ctx(), params(material, device.id, 2, license.id))
            .await,
        Err(OfflineError::FingerprintMismatch)
    ));

    // Material deleted upstream
    h.directory.delete_material(material);
    assert!(matches!(
        h.service
            .download_material(&h.ctx(), params(material, device.id, 1, license.id))
            .await,
        Err(OfflineError::AccessDenied)
    ));
}

#[tokio::test]
async fn test_unsupported_file_type() {
    let h = Harness::new(true);
    let device = h.register(1).await;
    let material = h.add_material("mp4", BODY).await;
    let license = h
        .service
        .issue_license(&h.ctx(), material, device.id, &fingerprint(1))
        .await
        .unwrap()
        .license;
    let err = h
        .service
        .download_material(&h.ctx(), params(material, device.id, 1, license.id))
        .await
        .unwrap_err();
    assert!(matches!(err, OfflineError::UnsupportedFileType(_)));
    assert_eq!(err.code(), "UNSUPPORTED_FILE_TYPE");
    assert!(h.jobs.is_empty());
}

#[tokio::test]
async fn test_revoke_material_licenses() {
    let h = Harness::new(true);
    let d1 = h.register(1).await;
    let d2 = h.register(2).await;
    let material = h.add_material("pdf", BODY).await;
    let l1 = h.service.issue_license(&h.ctx(), material, d1.id, &fingerprint(1)).await.unwrap().license;
    h.service.issue_license(&h.ctx(), material, d2.id, &fingerprint(2)).await.unwrap();

    let revoked = h.service.revoke_material_licenses(material).await.unwrap();
    assert_eq!(revoked.len(), 2);
    assert!(matches!(
        h.service.validate_license(&h.ctx(), l1.id, &fingerprint(1), &l1.nonce).await,
        Err(OfflineError::LicenseRevoked)
    ));
    assert!(matches!(
        h.service.renew_license(&h.ctx(), l1.id, d1.id, &fingerprint(1)).await,
        Err(OfflineError::LicenseRevoked)
    ));
}

#[tokio::test]
async fn test_signed_requests_are_single_use() {
    let h = Harness::new(true);
    let enrollment = h.enroll(1).await;
    let device = enrollment.device;
    let material = h.add_material("pdf", BODY).await;
    let fp = fingerprint(1);
    let license = h.service.issue_license(&h.ctx(), material, device.id, &fp).await.unwrap().license;

    // The device signs with the key it received at enrollment
    let path = format!("/licenses/{}/renew", license.id);
    let body = br#"{"device_id":"x"}"#.to_vec();
    let key = unwrap_on_device(&enrollment.wrapped_request_key, &device_secret(1)).unwrap();
    let header = sign_request_header(
        &key,
        "POST",
        &path,
        &body,
        chrono::Utc::now().timestamp(),
        "client-nonce-1",
        &device.id.to_string(),
    )
    .unwrap();
    let ctx = h.ctx().signed("POST", path.clone(), body.clone(), device.id, header);

    assert!(h.service.renew_license(&ctx, license.id, device.id, &fp).await.is_ok());
    assert!(matches!(
        h.service.renew_license(&ctx, license.id, device.id, &fp).await,
        Err(OfflineError::Replay)
    ));

    let forged = h.ctx().signed(
        "POST",
        path,
        body,
        device.id,
        format!("{}:client-nonce-2:AAAA", chrono::Utc::now().timestamp()),
    );
    assert!(matches!(
        h.service.renew_license(&forged, license.id, device.id, &fp).await,
        Err(OfflineError::SignatureInvalid)
    ));
}

#[tokio::test]
async fn test_audit_trail() {
    let h = Harness::new(true);
    let device = h.register(1).await;
    let material = h.add_material("pdf", BODY).await;
    let license = h
        .service
        .issue_license(&h.ctx(), material, device.id, &fingerprint(1))
        .await
        .unwrap()
        .license;
    let _ = h
        .service
        .validate_license(&h.ctx(), license.id, &fingerprint(7), &license.nonce)
        .await;
    h.service.flush_audit().await;

    let records = h.audit.records();
    let actions: Vec<_> = records.iter().map(|r| r.action).collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::DeviceRegister,
            AuditAction::LicenseIssue,
            AuditAction::LicenseValidate
        ]
    );
    assert!(records[..2].iter().all(|r| r.success));
    let failed = &records[2];
    assert!(!failed.success);
    assert_eq!(failed.error_code.as_deref(), Some("FINGERPRINT_MISMATCH"));
    assert_eq!(failed.ip.as_deref(), Some("203.0.113.7"));
    assert_eq!(failed.resource_id, Some(license.id));
}

#[tokio::test]
async fn test_cache_disabled_behaves_the_same() {
    let h = Harness::new(false);
    let device = h.register(1).await;
    let material = h.add_material("pdf", BODY).await;
    let fp = fingerprint(1);

    let first = h.service.issue_license(&h.ctx(), material, device.id, &fp).await.unwrap();
    let second = h.service.issue_license(&h.ctx(), material, device.id, &fp).await.unwrap();
    assert_eq!(first.license.id, second.license.id);

    let validated = h
        .service
        .validate_license(&h.ctx(), first.license.id, &fp, &first.license.nonce)
        .await
        .unwrap();
    assert!(matches!(
        h.service
            .validate_license(&h.ctx(), first.license.id, &fp, &first.license.nonce)
            .await,
        Err(OfflineError::NonceMismatch)
    ));
    let renewed = h
        .service
        .renew_license(&h.ctx(), first.license.id, device.id, &fp)
        .await
        .unwrap();
    assert_ne!(renewed.nonce, validated.nonce);
}

#[tokio::test]
async fn test_download_events_and_audit_query() {
    let h = Harness::new(true);
    let device = h.register(1).await;
    let material = h.add_material("pdf", BODY).await;
    let license = h
        .service
        .issue_license(&h.ctx(), material, device.id, &fingerprint(1))
        .await
        .unwrap()
        .license;
    let _ = h
        .service
        .download_material(&h.ctx(), params(material, device.id, 1, license.id))
        .await;
    h.service.run_pending_jobs().await.unwrap();
    h.service
        .download_material(&h.ctx(), params(material, device.id, 1, license.id))
        .await
        .unwrap();

    assert_eq!(
        h.events.subjects(),
        vec![
            "offline.device.registered",
            "offline.license.issued",
            "offline.encryption.requested",
            "offline.encryption.completed",
            "offline.material.downloaded",
        ]
    );
    match h.events.events().last() {
        Some(OfflineEvent::MaterialDownloaded(event)) => {
            assert_eq!(event.license_id, license.id);
            assert_eq!(event.device_id, device.id);
        }
        other => panic!("expected a download event, got {:?}", other),
    }

    let snap = h.service.metrics().snapshot();
    assert_eq!(snap.downloads, 1);
    assert_eq!(snap.downloads_failed, 1);
    assert_eq!(snap.encryption_jobs_succeeded, 1);

    h.service.flush_audit().await;
    let mut query = AuditQuery::for_user(h.user);
    query.action = Some(AuditAction::Download);
    let downloads = h.service.audit_logs(&h.ctx(), query).await.unwrap();
    assert_eq!(downloads.len(), 2);
    assert!(downloads[0].success);
    assert_eq!(downloads[1].error_code.as_deref(), Some("JOB_IN_PROGRESS"));
}

#[tokio::test]
async fn test_existing_artifact_served_while_reencrypting() {
    let h = Harness::new(true);
    let device = h.register(1).await;
    let material = h.add_material("pdf", BODY).await;
    let license = h
        .service
        .issue_license(&h.ctx(), material, device.id, &fingerprint(1))
        .await
        .unwrap()
        .license;
    let _ = h
        .service
        .download_material(&h.ctx(), params(material, device.id, 1, license.id))
        .await;
    h.service.run_pending_jobs().await.unwrap();

    // Force the material back into the queue, as a key rotation would
    let mut job = h.service.job_for_material(material).await.unwrap().unwrap();
    job.status = JobStatus::Pending;
    offline_warden::JobStore::update(h.jobs.as_ref(), &job).await.unwrap();

    let ticket = h
        .service
        .download_material(&h.ctx(), params(material, device.id, 1, license.id))
        .await
        .unwrap();
    assert_eq!(ticket.manifest.key_version, 1);
    let sealed = h
        .storage
        .get(&offline_warden::ArtifactStore::get(h.artifacts.as_ref(), material)
            .await
            .unwrap()
            .unwrap()
            .object_key)
        .await
        .unwrap()
        .unwrap();
    let key = unwrap_on_device(&ticket.wrapped_key, &device_secret(1)).unwrap();
    assert_eq!(decrypt_chunked(&sealed, &ticket.manifest.chunks, key.as_slice().try_into().unwrap()).unwrap(), BODY);
}

#[tokio::test]
async fn test_old_jobs_cleanup_keeps_artifacts() {
    let h = Harness::new(true);
    let device = h.register(1).await;
    let material = h.add_material("pdf", BODY).await;
    let license = h
        .service
        .issue_license(&h.ctx(), material, device.id, &fingerprint(1))
        .await
        .unwrap()
        .license;
    let _ = h
        .service
        .download_material(&h.ctx(), params(material, device.id, 1, license.id))
        .await;
    h.service.run_pending_jobs().await.unwrap();

    assert_eq!(h.service.cleanup_jobs(std::time::Duration::from_secs(3600)).await.unwrap(), 0);
    assert_eq!(h.service.cleanup_jobs(std::time::Duration::ZERO).await.unwrap(), 1);
    assert!(h.jobs.is_empty());

    // The stored artifact keeps serving without a job
    assert!(h
        .service
        .download_material(&h.ctx(), params(material, device.id, 1, license.id))
        .await
        .is_ok());
    assert!(h.jobs.is_empty());
}
