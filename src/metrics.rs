//! Operation counters with a Prometheus text rendering.
//!
//! Counters are lock-free and only ever increase. The host exposes
//! [`OfflineMetrics::prometheus`] on its metrics route.

use crate::audit::AuditAction;
use crate::OfflineError;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Successful device registrations.
    pub device_registrations: u64,
    /// Successful device deregistrations.
    pub device_deregistrations: u64,
    /// Licenses issued or returned by issuance.
    pub licenses_issued: u64,
    /// Successful offline validations.
    pub licenses_validated: u64,
    /// Successful renewals.
    pub licenses_renewed: u64,
    /// Licenses revoked by an operation.
    pub licenses_revoked: u64,
    /// Download URLs issued.
    pub downloads: u64,
    /// Download requests refused or failed.
    pub downloads_failed: u64,
    /// Encryption jobs queued.
    pub encryption_jobs_queued: u64,
    /// Encryption jobs completed.
    pub encryption_jobs_succeeded: u64,
    /// Encryption jobs failed for good.
    pub encryption_jobs_failed: u64,
    /// Requests refused by a quota.
    pub rate_limited: u64,
    /// Fingerprint or nonce mismatches.
    pub security_violations: u64,
    /// Replayed request nonces refused.
    pub replays_blocked: u64,
}

/// Subsystem counters.
#[derive(Debug, Default)]
pub struct OfflineMetrics {
    device_registrations: AtomicU64,
    device_deregistrations: AtomicU64,
    licenses_issued: AtomicU64,
    licenses_validated: AtomicU64,
    licenses_renewed: AtomicU64,
    licenses_revoked: AtomicU64,
    downloads: AtomicU64,
    downloads_failed: AtomicU64,
    encryption_jobs_queued: AtomicU64,
    encryption_jobs_succeeded: AtomicU64,
    encryption_jobs_failed: AtomicU64,
    rate_limited: AtomicU64,
    security_violations: AtomicU64,
    replays_blocked: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl OfflineMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count the outcome of an audited operation.
    pub fn observe<T>(&self, action: AuditAction, outcome: &Result<T, OfflineError>) {
        match outcome {
            Ok(_) => match action {
                AuditAction::DeviceRegister => bump(&self.device_registrations),
                AuditAction::DeviceDeregister => bump(&self.device_deregistrations),
                AuditAction::LicenseIssue => bump(&self.licenses_issued),
                AuditAction::LicenseValidate => bump(&self.licenses_validated),
                AuditAction::LicenseRenew => bump(&self.licenses_renewed),
                AuditAction::LicenseRevoke => bump(&self.licenses_revoked),
                AuditAction::Download => bump(&self.downloads),
            },
            Err(e) => {
                if action == AuditAction::Download {
                    bump(&self.downloads_failed);
                }
                match e {
                    OfflineError::RateLimited { .. } => bump(&self.rate_limited),
                    OfflineError::FingerprintMismatch | OfflineError::NonceMismatch => {
                        bump(&self.security_violations)
                    }
                    OfflineError::Replay => bump(&self.replays_blocked),
                    _ => {}
                }
            }
        }
    }

    /// Count licenses revoked in bulk.
    pub fn licenses_revoked(&self, count: usize) {
        self.licenses_revoked.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Count a queued encryption job.
    pub fn job_queued(&self) {
        bump(&self.encryption_jobs_queued);
    }

    /// Count a completed encryption job.
    pub fn job_succeeded(&self) {
        bump(&self.encryption_jobs_succeeded);
    }

    /// Count an encryption job that ran out of attempts.
    pub fn job_failed(&self) {
        bump(&self.encryption_jobs_failed);
    }

    /// Current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            device_registrations: load(&self.device_registrations),
            device_deregistrations: load(&self.device_deregistrations),
            licenses_issued: load(&self.licenses_issued),
            licenses_validated: load(&self.licenses_validated),
            licenses_renewed: load(&self.licenses_renewed),
            licenses_revoked: load(&self.licenses_revoked),
            downloads: load(&self.downloads),
            downloads_failed: load(&self.downloads_failed),
            encryption_jobs_queued: load(&self.encryption_jobs_queued),
            encryption_jobs_succeeded: load(&self.encryption_jobs_succeeded),
            encryption_jobs_failed: load(&self.encryption_jobs_failed),
            rate_limited: load(&self.rate_limited),
            security_violations: load(&self.security_violations),
            replays_blocked: load(&self.replays_blocked),
        }
    }

    /// Counters in the Prometheus text exposition format.
    pub fn prometheus(&self) -> String {
        let snap = self.snapshot();
        let counters: [(&str, &str, u64); 14] = [
            ("device_registrations_total", "Device registrations", snap.device_registrations),
            ("device_deregistrations_total", "Device deregistrations", snap.device_deregistrations),
            ("licenses_issued_total", "Licenses issued", snap.licenses_issued),
            ("licenses_validated_total", "Offline license validations", snap.licenses_validated),
            ("licenses_renewed_total", "License renewals", snap.licenses_renewed),
            ("licenses_revoked_total", "Licenses revoked", snap.licenses_revoked),
            ("downloads_total", "Download URLs issued", snap.downloads),
            ("downloads_failed_total", "Failed download requests", snap.downloads_failed),
            ("encryption_jobs_queued_total", "Encryption jobs queued", snap.encryption_jobs_queued),
            ("encryption_jobs_success_total", "Encryption jobs completed", snap.encryption_jobs_succeeded),
            ("encryption_jobs_failed_total", "Encryption jobs failed", snap.encryption_jobs_failed),
            ("rate_limit_exceeded_total", "Requests refused by a quota", snap.rate_limited),
            ("security_violations_total", "Fingerprint or nonce mismatches", snap.security_violations),
            ("replay_attacks_blocked_total", "Replayed request nonces refused", snap.replays_blocked),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP offline_{name} {help}\n# TYPE offline_{name} counter\noffline_{name} {value}\n"
            ));
        }
        out
    }
}
