use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use facegate_core::{
    AuditRecord, AuditSink, BoxError, Descriptor, EnrolledTemplate, TemplateStore,
};
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("descriptor encryption failed")]
    EncryptionFailed,
    #[error("descriptor decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid descriptor blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid descriptor dimension: {actual} (expected {expected})")]
    InvalidDimension { expected: usize, actual: usize },
    #[error("invalid descriptor value (NaN/Inf)")]
    InvalidValue,
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed template, audit and PIN storage.
///
/// Descriptors are encrypted with AES-256-GCM before storage. A
/// per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600). Each subject has at most one active
/// template; re-enrollment deactivates the previous one.
#[derive(Clone)]
pub struct FacegateStore {
    conn: Connection,
    enc_key: [u8; 32],
    dimension: usize,
}

/// Metadata about an enrolled template (no descriptor data).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TemplateInfo {
    pub id: String,
    pub dimension: usize,
    pub active: bool,
    pub enrolled_at: String,
}

type AuditRow = (
    String,
    String,
    String,
    String,
    String,
    Option<f64>,
    Option<String>,
    Option<i64>,
);

impl FacegateStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path, dimension: usize) -> Result<Self, StoreError> {
        let enc_key = if db_path == Path::new(":memory:") {
            [0u8; 32]
        } else {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent).map_err(StoreError::KeyIo)?;
            }
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/facegate"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS templates (
                     id TEXT PRIMARY KEY,
                     subject_id TEXT NOT NULL,
                     descriptor BLOB NOT NULL,
                     dimension INTEGER NOT NULL,
                     is_active INTEGER NOT NULL DEFAULT 1,
                     enrolled_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_templates_subject
                     ON templates(subject_id, is_active);
                 CREATE TABLE IF NOT EXISTS audit_log (
                     id TEXT PRIMARY KEY,
                     subject_id TEXT NOT NULL,
                     timestamp TEXT NOT NULL,
                     purpose TEXT NOT NULL,
                     outcome TEXT NOT NULL,
                     similarity REAL,
                     reason TEXT,
                     elapsed_ms INTEGER
                 );
                 CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit_log(subject_id, timestamp);
                 CREATE TABLE IF NOT EXISTS pins (
                     subject_id TEXT PRIMARY KEY,
                     salt BLOB NOT NULL,
                     hash BLOB NOT NULL,
                     updated_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            conn,
            enc_key,
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Store a template as the subject's only active one. Returns its id.
    pub async fn enroll(&self, template: &EnrolledTemplate) -> Result<String, StoreError> {
        let values = template.descriptor.values();
        self.validate(values)?;
        let blob = self.encrypt_descriptor(values)?;

        let id = Uuid::new_v4().to_string();
        let id_clone = id.clone();
        let subject = template.subject_id.clone();
        let dimension = values.len() as i64;
        let enrolled_at = template.enrolled_at.to_rfc3339();

        let replaced = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let replaced = tx.execute(
                    "UPDATE templates SET is_active = 0 WHERE subject_id = ?1 AND is_active = 1",
                    [&subject],
                )?;
                tx.execute(
                    "INSERT INTO templates (id, subject_id, descriptor, dimension, is_active, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                    rusqlite::params![id_clone, subject, blob, dimension, enrolled_at],
                )?;
                tx.commit()?;
                Ok(replaced)
            })
            .await?;

        if replaced > 0 {
            tracing::info!(subject = %template.subject_id, "previous template deactivated");
        }
        Ok(id)
    }

    /// The subject's active template, if any.
    pub async fn active_template(&self, subject: &str) -> Result<Option<EnrolledTemplate>, StoreError> {
        let subject_key = subject.to_string();
        let row: Option<(Vec<u8>, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT descriptor, enrolled_at FROM templates
                     WHERE subject_id = ?1 AND is_active = 1",
                )?;
                let mut rows = stmt.query_map([&subject_key], |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?))
                })?;
                let first = rows.next().transpose()?;
                Ok(first)
            })
            .await?;

        let Some((blob, enrolled_at)) = row else {
            return Ok(None);
        };
        let values = self.decrypt_descriptor(&blob)?;
        Ok(Some(EnrolledTemplate {
            subject_id: subject.to_string(),
            descriptor: Descriptor::new(values),
            enrolled_at: parse_timestamp(&enrolled_at)?,
        }))
    }

    /// Template metadata for a subject, newest first.
    pub async fn list_templates(&self, subject: &str) -> Result<Vec<TemplateInfo>, StoreError> {
        let subject = subject.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, dimension, is_active, enrolled_at FROM templates
                     WHERE subject_id = ?1 ORDER BY enrolled_at DESC",
                )?;
                let rows = stmt.query_map([&subject], |row| {
                    Ok(TemplateInfo {
                        id: row.get(0)?,
                        dimension: usize::try_from(row.get::<_, i64>(1)?).unwrap_or(0),
                        active: row.get(2)?,
                        enrolled_at: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Delete every template for a subject. Returns the number removed.
    pub async fn remove_templates(&self, subject: &str) -> Result<usize, StoreError> {
        let subject = subject.to_string();
        self.conn
            .call(move |conn| Ok(conn.execute("DELETE FROM templates WHERE subject_id = ?1", [&subject])?))
            .await
            .map_err(StoreError::from)
    }

    /// Number of subjects with an active template.
    pub async fn count_enrolled(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM templates WHERE is_active = 1",
                    [],
                    |row| row.get(0),
                )?;
                Ok(u64::try_from(count).unwrap_or(0))
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let r = record.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO audit_log (id, subject_id, timestamp, purpose, outcome, similarity, reason, elapsed_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        r.id.to_string(),
                        r.subject_id,
                        r.timestamp.to_rfc3339(),
                        r.purpose.as_str(),
                        r.outcome.as_str(),
                        r.similarity.map(f64::from),
                        r.reason,
                        r.elapsed_ms.map(|ms| ms as i64),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Most recent audit records, newest first, optionally for one subject.
    pub async fn recent_audit(
        &self,
        subject: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        let subject = subject.map(str::to_string);
        let rows: Vec<AuditRow> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, subject_id, timestamp, purpose, outcome, similarity, reason, elapsed_ms
                     FROM audit_log
                     WHERE ?1 IS NULL OR subject_id = ?1
                     ORDER BY timestamp DESC
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![subject, limit], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        rows.into_iter().map(audit_from_row).collect()
    }

    pub async fn set_pin_hash(&self, subject: &str, salt: Vec<u8>, hash: Vec<u8>) -> Result<(), StoreError> {
        let subject = subject.to_string();
        let updated_at = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO pins (subject_id, salt, hash, updated_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(subject_id) DO UPDATE SET salt = ?2, hash = ?3, updated_at = ?4",
                    rusqlite::params![subject, salt, hash, updated_at],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// `(salt, hash)` for the subject's PIN, if one is set.
    pub async fn pin_hash(&self, subject: &str) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let subject = subject.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT salt, hash FROM pins WHERE subject_id = ?1")?;
                let mut rows = stmt.query_map([&subject], |row| Ok((row.get(0)?, row.get(1)?)))?;
                let first = rows.next().transpose()?;
                Ok(first)
            })
            .await
            .map_err(StoreError::from)
    }

    fn validate(&self, values: &[f32]) -> Result<(), StoreError> {
        if values.len() != self.dimension {
            return Err(StoreError::InvalidDimension {
                expected: self.dimension,
                actual: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(StoreError::InvalidValue);
        }
        Ok(())
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_descriptor(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        let plaintext = descriptor_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_descriptor(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        let values = bytes_to_descriptor(&plaintext)?;
        self.validate(&values)?;
        Ok(values)
    }
}

#[async_trait]
impl TemplateStore for FacegateStore {
    async fn active_template(&self, subject_id: &str) -> Result<Option<EnrolledTemplate>, BoxError> {
        Ok(FacegateStore::active_template(self, subject_id).await?)
    }
}

#[async_trait]
impl AuditSink for FacegateStore {
    async fn record(&self, record: AuditRecord) -> Result<(), BoxError> {
        tracing::info!(
            subject = %record.subject_id,
            purpose = record.purpose.as_str(),
            outcome = record.outcome.as_str(),
            similarity = ?record.similarity,
            "audit"
        );
        Ok(self.append_audit(&record).await?)
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            ))
        })?;
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Row helpers ───────────────────────────────────────────────────────────────

fn descriptor_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_descriptor(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{s}': {e}")))
}

fn audit_from_row(row: AuditRow) -> Result<AuditRecord, StoreError> {
    let (id, subject_id, timestamp, purpose, outcome, similarity, reason, elapsed_ms) = row;
    Ok(AuditRecord {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(format!("audit id '{id}': {e}")))?,
        subject_id,
        timestamp: parse_timestamp(&timestamp)?,
        purpose: purpose
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        outcome: outcome
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        similarity: similarity.map(|s| s as f32),
        reason,
        elapsed_ms: elapsed_ms.and_then(|ms| u64::try_from(ms).ok()),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::{AuditOutcome, Purpose};

    const DIM: usize = 128;

    async fn memory_store() -> FacegateStore {
        FacegateStore::open(Path::new(":memory:"), DIM).await.unwrap()
    }

    fn template(subject: &str, seed: f32) -> EnrolledTemplate {
        EnrolledTemplate {
            subject_id: subject.to_string(),
            descriptor: Descriptor::new((0..DIM).map(|i| seed + i as f32 / DIM as f32).collect()),
            enrolled_at: Utc::now(),
        }
    }

    fn audit(subject: &str, outcome: AuditOutcome, secs_ago: i64) -> AuditRecord {
        AuditRecord {
            id: Uuid::new_v4(),
            subject_id: subject.to_string(),
            timestamp: Utc::now() - chrono::Duration::seconds(secs_ago),
            purpose: Purpose::CheckIn,
            outcome,
            similarity: Some(0.5),
            reason: None,
            elapsed_ms: Some(1200),
        }
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let store = memory_store().await;
        let t = template("alice", 0.0);
        let id = store.enroll(&t).await.unwrap();
        assert!(!id.is_empty());

        let loaded = store.active_template("alice").await.unwrap().unwrap();
        assert_eq!(loaded.subject_id, "alice");
        for (orig, rec) in t.descriptor.values().iter().zip(loaded.descriptor.values()) {
            assert_eq!(orig.to_bits(), rec.to_bits());
        }
        assert!(store.active_template("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reenrollment_replaces_active_template() {
        let store = memory_store().await;
        store.enroll(&template("alice", 0.0)).await.unwrap();
        let newest = store.enroll(&template("alice", 1.0)).await.unwrap();

        let active = store.active_template("alice").await.unwrap().unwrap();
        assert_eq!(active.descriptor.values()[0], 1.0);

        let listed = store.list_templates("alice").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed.iter().filter(|t| t.active).count(), 1);
        assert!(listed.iter().any(|t| t.active && t.id == newest));
        assert_eq!(store.count_enrolled().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejects_wrong_dimension() {
        let store = memory_store().await;
        let mut t = template("alice", 0.0);
        t.descriptor = Descriptor::new(vec![0.5; 512]);
        let err = store.enroll(&t).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidDimension { expected: 128, actual: 512 }
        ));
    }

    #[tokio::test]
    async fn test_rejects_nan() {
        let store = memory_store().await;
        let mut t = template("alice", 0.0);
        t.descriptor.0[42] = f32::NAN;
        assert!(matches!(store.enroll(&t).await.unwrap_err(), StoreError::InvalidValue));
    }

    #[tokio::test]
    async fn test_remove_templates() {
        let store = memory_store().await;
        store.enroll(&template("alice", 0.0)).await.unwrap();
        store.enroll(&template("alice", 1.0)).await.unwrap();
        store.enroll(&template("bob", 0.0)).await.unwrap();

        assert_eq!(store.remove_templates("alice").await.unwrap(), 2);
        assert!(store.active_template("alice").await.unwrap().is_none());
        assert!(store.active_template("bob").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let store1 = FacegateStore {
            conn: Connection::open(Path::new(":memory:")).await.unwrap(),
            enc_key: [1u8; 32],
            dimension: DIM,
        };
        let store2 = FacegateStore {
            enc_key: [2u8; 32],
            ..store1.clone()
        };
        let blob = store1.encrypt_descriptor(&[0.25; DIM]).unwrap();
        assert!(matches!(
            store2.decrypt_descriptor(&blob),
            Err(StoreError::DecryptionFailed)
        ));
        assert!(matches!(
            store1.decrypt_descriptor(&blob[..8]),
            Err(StoreError::InvalidBlob(8))
        ));
    }

    #[tokio::test]
    async fn test_audit_log_newest_first() {
        let store = memory_store().await;
        store.append_audit(&audit("alice", AuditOutcome::Failed, 30)).await.unwrap();
        store.append_audit(&audit("bob", AuditOutcome::Verified, 20)).await.unwrap();
        let latest = audit("alice", AuditOutcome::LockedOut, 10);
        store.record(latest.clone()).await.unwrap();

        let all = store.recent_audit(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, latest.id);
        assert_eq!(all[0].outcome, AuditOutcome::LockedOut);
        assert_eq!(all[0].elapsed_ms, Some(1200));

        let alice = store.recent_audit(Some("alice"), 1).await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].id, latest.id);
    }

    #[tokio::test]
    async fn test_pin_hash_upsert() {
        let store = memory_store().await;
        assert!(store.pin_hash("alice").await.unwrap().is_none());
        store.set_pin_hash("alice", vec![1; 16], vec![2; 32]).await.unwrap();
        store.set_pin_hash("alice", vec![3; 16], vec![4; 32]).await.unwrap();
        let (salt, hash) = store.pin_hash("alice").await.unwrap().unwrap();
        assert_eq!(salt, vec![3; 16]);
        assert_eq!(hash, vec![4; 32]);
    }
}
