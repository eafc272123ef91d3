//! Dataset lifecycle gate.
//!
//! Records move `raw → clean → verified`. Raw records sit under
//! `pending/`; the clean step applies schema, length, secret, and dedupe
//! checks per record and is fail-closed — a record with any secret-shaped
//! substring is dropped, never scrubbed-and-kept. Promotion writes the
//! survivors into `verified/` and covers them with an HMAC-signed manifest.
//! [`Gate::trainer_guard`] is the single enforcement point for the
//! "only verified data trains" invariant: it refuses any path outside
//! `verified/` and any dataset whose manifest signature does not verify.
//!
//! Every path handed to the gate resolves through the path guard against
//! the run root; a symlink at any component refuses the whole operation.

pub mod signer;

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use heidi_types::{KernelError, Manifest, TrainingRecord, SCHEMA_VERSION};

pub use signer::SigningKey;

/// Raw records directory inside a run root.
pub const PENDING_DIR: &str = "pending";

/// Promoted records directory inside a run root.
pub const VERIFIED_DIR: &str = "verified";

/// Manifest file name inside a run root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Detached signature file name inside a run root.
pub const MANIFEST_SIG_FILE: &str = "manifest.sig";

/// Per-record field budgets, in characters.
pub const MAX_INPUT_CHARS: usize = 1800;
pub const MAX_OUTPUT_CHARS: usize = 4596;
pub const MIN_FIELD_CHARS: usize = 1;

pub fn pending_dir(run_root: &Path) -> PathBuf {
    run_root.join(PENDING_DIR)
}

pub fn verified_dir(run_root: &Path) -> PathBuf {
    run_root.join(VERIFIED_DIR)
}

pub fn manifest_path(run_root: &Path) -> PathBuf {
    run_root.join(MANIFEST_FILE)
}

pub fn manifest_sig_path(run_root: &Path) -> PathBuf {
    run_root.join(MANIFEST_SIG_FILE)
}

/// Result of one clean pass over `pending/`.
#[derive(Debug, Default)]
pub struct CleanOutcome {
    pub kept: Vec<TrainingRecord>,
    pub records_in: u64,
    pub dropped_malformed: u64,
    pub dropped_schema: u64,
    pub dropped_length: u64,
    pub dropped_secret: u64,
    pub dropped_duplicate: u64,
    /// Redacted snippets of secret-dropped records, safe to journal.
    pub secret_samples: Vec<String>,
}

impl CleanOutcome {
    /// Integer counters for the journal's `counters_delta`.
    pub fn counters_delta(&self) -> BTreeMap<String, i64> {
        BTreeMap::from([
            ("records_in".to_string(), self.records_in as i64),
            ("records_kept".to_string(), self.kept.len() as i64),
            ("dropped_malformed".to_string(), self.dropped_malformed as i64),
            ("dropped_schema".to_string(), self.dropped_schema as i64),
            ("dropped_length".to_string(), self.dropped_length as i64),
            ("dropped_secret".to_string(), self.dropped_secret as i64),
            ("dropped_duplicate".to_string(), self.dropped_duplicate as i64),
        ])
    }
}

/// Run-level facts the gate stamps into the manifest at promotion time.
#[derive(Debug, Clone)]
pub struct ManifestInputs {
    pub created_at: String,
    pub engine_version: String,
    pub event_count: u64,
    pub final_state: String,
    pub guardrail_snapshot: BTreeMap<String, i64>,
    pub replay_hash: String,
    pub total_runtime_sec: u64,
}

/// The dataset lifecycle gate for one run.
///
/// The signing key is optional so the clean step can run keyless; every
/// operation that touches `verified/` or the manifest refuses without one.
#[derive(Debug)]
pub struct Gate {
    run_root: PathBuf,
    run_id: String,
    key: Option<SigningKey>,
}

enum Drop {
    Malformed,
    Schema,
    Length,
    /// Carries a redacted snippet for the journal.
    Secret(String),
    Duplicate,
}

impl Gate {
    pub fn new(run_root: &Path, run_id: &str, key: Option<SigningKey>) -> Self {
        Self {
            run_root: run_root.to_path_buf(),
            run_id: run_id.to_string(),
            key,
        }
    }

    pub fn key(&self) -> Option<&SigningKey> {
        self.key.as_ref()
    }

    fn require_key(&self) -> Result<&SigningKey, KernelError> {
        self.key.as_ref().ok_or_else(|| {
            KernelError::GatekeeperRefused(
                "signing key required but HEIDI_SIGNING_KEY is not set".to_string(),
            )
        })
    }

    /// Clean every `*.json` under `pending/`, in filename order.
    pub fn clean_pending(&self) -> Result<CleanOutcome, KernelError> {
        let pending = pending_dir(&self.run_root);
        let mut outcome = CleanOutcome::default();
        if !pending.exists() {
            return Ok(outcome);
        }

        let mut names: Vec<String> = fs::read_dir(&pending)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".json"))
            .collect();
        names.sort();

        let mut exact_seen: BTreeSet<String> = BTreeSet::new();
        let mut fuzzy_seen: BTreeSet<String> = BTreeSet::new();
        let mut ids_seen: BTreeSet<String> = BTreeSet::new();

        for name in names {
            outcome.records_in += 1;
            let relative = Path::new(PENDING_DIR).join(&name);
            let resolved = heidi_pathguard::contain(&self.run_root, &relative)
                .map_err(|e| KernelError::PathEscape(e.to_string()))?;

            match self.clean_one(&resolved, &mut exact_seen, &mut fuzzy_seen, &mut ids_seen) {
                Ok(record) => outcome.kept.push(record),
                Err(Drop::Malformed) => outcome.dropped_malformed += 1,
                Err(Drop::Schema) => outcome.dropped_schema += 1,
                Err(Drop::Length) => outcome.dropped_length += 1,
                Err(Drop::Secret(sample)) => {
                    outcome.dropped_secret += 1;
                    outcome.secret_samples.push(sample);
                }
                Err(Drop::Duplicate) => outcome.dropped_duplicate += 1,
            }
        }

        Ok(outcome)
    }

    fn clean_one(
        &self,
        path: &Path,
        exact_seen: &mut BTreeSet<String>,
        fuzzy_seen: &mut BTreeSet<String>,
        ids_seen: &mut BTreeSet<String>,
    ) -> Result<TrainingRecord, Drop> {
        let content = fs::read_to_string(path).map_err(|_| Drop::Malformed)?;
        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|_| Drop::Malformed)?;
        let record: TrainingRecord =
            serde_json::from_value(value.clone()).map_err(|_| Drop::Schema)?;

        // The id becomes the verified filename, so it must already be a
        // clean identifier.
        match heidi_pathguard::sanitize_identifier(&record.id) {
            Ok(clean) if clean == record.id => {}
            _ => return Err(Drop::Schema),
        }

        let instruction_len = record.instruction.chars().count();
        let input_len = record.input.chars().count();
        let output_len = record.output.chars().count();
        if instruction_len < MIN_FIELD_CHARS
            || input_len < MIN_FIELD_CHARS
            || output_len < MIN_FIELD_CHARS
            || input_len > MAX_INPUT_CHARS
            || output_len > MAX_OUTPUT_CHARS
        {
            return Err(Drop::Length);
        }

        // Fail-closed: any secret match drops the record outright. Only a
        // redacted snippet survives for the journal.
        if heidi_redact::value_contains_secret(&value) {
            let snippet = heidi_redact::truncate_chars(&heidi_redact::redact(&content), 120);
            return Err(Drop::Secret(format!(
                "record {:?} dropped: secret detected in {snippet:?}",
                record.id
            )));
        }

        let exact = record_hash(&record).map_err(|_| Drop::Schema)?;
        if !exact_seen.insert(exact) {
            return Err(Drop::Duplicate);
        }
        if !fuzzy_seen.insert(normalized_body(&record)) {
            return Err(Drop::Duplicate);
        }
        if !ids_seen.insert(record.id.clone()) {
            return Err(Drop::Duplicate);
        }

        Ok(record)
    }

    /// Promote cleaned records into `verified/` and write the signed
    /// manifest. Returns the manifest that now covers the dataset.
    pub fn promote(
        &self,
        records: &[TrainingRecord],
        inputs: ManifestInputs,
    ) -> Result<Manifest, KernelError> {
        let key = self.require_key()?;
        let verified = verified_dir(&self.run_root);
        fs::create_dir_all(&verified)?;

        for record in records {
            match heidi_pathguard::sanitize_identifier(&record.id) {
                Ok(clean) if clean == record.id => {}
                _ => {
                    return Err(KernelError::PathEscape(format!(
                        "record id {:?} is not a clean identifier",
                        record.id
                    )));
                }
            }
            let value = serde_json::to_value(record)
                .map_err(|e| KernelError::Canonicalization(e.to_string()))?;
            let canonical = heidi_canonical::to_canonical_string(&value)
                .map_err(|e| KernelError::Canonicalization(e.to_string()))?;

            let path = verified.join(format!("{}.json", record.id));
            let mut file = File::create(&path)?;
            file.write_all(canonical.as_bytes())?;
            file.sync_all()?;
        }
        File::open(&verified)?.sync_all()?;

        let manifest = Manifest {
            created_at: inputs.created_at,
            dataset_hash: dataset_hash(records)?,
            engine_version: inputs.engine_version,
            event_count: inputs.event_count,
            final_state: inputs.final_state,
            guardrail_snapshot: inputs.guardrail_snapshot,
            record_count: records.len() as u64,
            replay_hash: inputs.replay_hash,
            run_id: self.run_id.clone(),
            schema_version: SCHEMA_VERSION.to_string(),
            signing_key_id: key.key_id().to_string(),
            total_runtime_sec: inputs.total_runtime_sec,
        };

        let (manifest_json, signature) = signer::sign_manifest(&manifest, key)?;
        write_atomic(&manifest_path(&self.run_root), manifest_json.as_bytes())?;
        write_atomic(&manifest_sig_path(&self.run_root), signature.as_bytes())?;

        Ok(manifest)
    }

    /// Enforcement point for training inputs: the path must resolve inside
    /// `verified/` and the manifest signature must verify. Anything
    /// ambiguous — missing manifest, unreadable signature — refuses.
    pub fn trainer_guard(&self, candidate: &Path) -> Result<PathBuf, KernelError> {
        let resolved = heidi_pathguard::contain(&self.run_root, candidate)
            .map_err(|e| KernelError::PathEscape(e.to_string()))?;
        let verified = heidi_pathguard::contain(&self.run_root, Path::new(VERIFIED_DIR))
            .map_err(|e| KernelError::PathEscape(e.to_string()))?;

        if !resolved.starts_with(&verified) {
            return Err(KernelError::GatekeeperRefused(format!(
                "{} is outside verified/",
                candidate.display()
            )));
        }

        self.load_verified_manifest()?;
        Ok(resolved)
    }

    /// Read and verify the manifest pair for this run.
    pub fn load_verified_manifest(&self) -> Result<Manifest, KernelError> {
        let key = self.require_key()?;
        let manifest_json = fs::read_to_string(manifest_path(&self.run_root)).map_err(|e| {
            KernelError::SignatureInvalid(format!("manifest unreadable: {e}"))
        })?;
        let signature = fs::read_to_string(manifest_sig_path(&self.run_root)).map_err(|e| {
            KernelError::SignatureInvalid(format!("signature unreadable: {e}"))
        })?;
        signer::verify_manifest(&manifest_json, &signature, key)
    }
}

/// SHA-256 over the canonical serialization of one record.
pub fn record_hash(record: &TrainingRecord) -> Result<String, KernelError> {
    let value =
        serde_json::to_value(record).map_err(|e| KernelError::Canonicalization(e.to_string()))?;
    let canonical = heidi_canonical::to_canonical_string(&value)
        .map_err(|e| KernelError::Canonicalization(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Dataset digest: SHA-256 over the per-record canonical digests,
/// concatenated in ascending order.
pub fn dataset_hash(records: &[TrainingRecord]) -> Result<String, KernelError> {
    let mut digests = records
        .iter()
        .map(record_hash)
        .collect::<Result<Vec<_>, _>>()?;
    digests.sort();

    let mut hasher = Sha256::new();
    for digest in &digests {
        hasher.update(digest.as_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

// Normalized body for fuzzy dedupe: lowercased, whitespace collapsed.
fn normalized_body(record: &TrainingRecord) -> String {
    let combined = format!(
        "{} {} {}",
        record.instruction, record.input, record.output
    );
    combined
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), KernelError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, Gate) {
        let td = tempdir().expect("tempdir");
        fs::create_dir(pending_dir(td.path())).expect("mkdir pending");
        let gate = Gate::new(td.path(), "run-1", Some(SigningKey::new(b"secret")));
        (td, gate)
    }

    fn write_pending(root: &Path, name: &str, content: &str) {
        fs::write(pending_dir(root).join(name), content).expect("write pending");
    }

    fn record_json(id: &str, output: &str) -> String {
        serde_json::json!({
            "id": id,
            "instruction": format!("answer for {id}"),
            "input": format!("question {id}"),
            "output": output,
        })
        .to_string()
    }

    fn inputs() -> ManifestInputs {
        ManifestInputs {
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            engine_version: "0.2.0".to_string(),
            event_count: 8,
            final_state: "IDLE".to_string(),
            guardrail_snapshot: BTreeMap::from([("max_disk_mb".to_string(), 512)]),
            replay_hash: "ef".repeat(32),
            total_runtime_sec: 12,
        }
    }

    #[test]
    fn clean_keeps_well_formed_records() {
        let (td, gate) = setup();
        write_pending(td.path(), "a.json", &record_json("rec-a", "answer a"));
        write_pending(td.path(), "b.json", &record_json("rec-b", "answer b"));

        let outcome = gate.clean_pending().expect("clean");
        assert_eq!(outcome.records_in, 2);
        assert_eq!(outcome.kept.len(), 2);
        assert_eq!(outcome.counters_delta()["records_kept"], 2);
    }

    #[test]
    fn clean_is_deterministic_by_filename() {
        let (td, gate) = setup();
        write_pending(td.path(), "z.json", &record_json("rec-z", "answer z"));
        write_pending(td.path(), "a.json", &record_json("rec-a", "answer a"));

        let outcome = gate.clean_pending().expect("clean");
        let ids: Vec<&str> = outcome.kept.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["rec-a", "rec-z"]);
    }

    #[test]
    fn clean_drops_malformed_json() {
        let (td, gate) = setup();
        write_pending(td.path(), "bad.json", "{not json");

        let outcome = gate.clean_pending().expect("clean");
        assert_eq!(outcome.dropped_malformed, 1);
        assert!(outcome.kept.is_empty());
    }

    #[test]
    fn clean_drops_missing_fields() {
        let (td, gate) = setup();
        write_pending(td.path(), "partial.json", r#"{"id":"x","instruction":"i"}"#);

        let outcome = gate.clean_pending().expect("clean");
        assert_eq!(outcome.dropped_schema, 1);
    }

    #[test]
    fn clean_drops_record_with_secret_anywhere() {
        let (td, gate) = setup();
        let secret = format!("use sk-{}", "A".repeat(24));
        write_pending(td.path(), "leak.json", &record_json("rec-leak", &secret));
        write_pending(td.path(), "ok.json", &record_json("rec-ok", "clean answer"));

        let outcome = gate.clean_pending().expect("clean");
        assert_eq!(outcome.dropped_secret, 1);
        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.kept[0].id, "rec-ok");

        // The journal-safe sample carries the placeholder, never the key.
        assert_eq!(outcome.secret_samples.len(), 1);
        assert!(outcome.secret_samples[0].contains("[OPENAI_KEY]"));
        assert!(!outcome.secret_samples[0].contains("sk-AAAA"));
    }

    #[test]
    fn clean_drops_oversize_output() {
        let (td, gate) = setup();
        let oversize = "x".repeat(MAX_OUTPUT_CHARS + 1);
        write_pending(td.path(), "big.json", &record_json("rec-big", &oversize));

        let outcome = gate.clean_pending().expect("clean");
        assert_eq!(outcome.dropped_length, 1);
    }

    #[test]
    fn clean_drops_empty_fields() {
        let (td, gate) = setup();
        write_pending(td.path(), "empty.json", &record_json("rec-empty", ""));

        let outcome = gate.clean_pending().expect("clean");
        assert_eq!(outcome.dropped_length, 1);
    }

    #[test]
    fn clean_dedupes_exact_and_fuzzy() {
        let (td, gate) = setup();
        write_pending(td.path(), "a.json", &record_json("rec-a", "Same Answer"));
        // Identical content, different file.
        write_pending(td.path(), "b.json", &record_json("rec-a", "Same Answer"));
        // Different id, same normalized body modulo case/whitespace.
        write_pending(
            td.path(),
            "c.json",
            &serde_json::json!({
                "id": "rec-c",
                "instruction": "ANSWER   for rec-a",
                "input": "Question rec-a",
                "output": "same    answer",
            })
            .to_string(),
        );

        let outcome = gate.clean_pending().expect("clean");
        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.dropped_duplicate, 2);
    }

    #[cfg(unix)]
    #[test]
    fn clean_refuses_symlinked_pending_file() {
        let (td, gate) = setup();
        let outside = tempdir().expect("outside");
        let target = outside.path().join("real.json");
        fs::write(&target, record_json("rec-x", "answer")).expect("write target");
        std::os::unix::fs::symlink(&target, pending_dir(td.path()).join("link.json"))
            .expect("symlink");

        let err = gate.clean_pending().expect_err("must refuse");
        assert!(matches!(err, KernelError::PathEscape(_)));
    }

    #[test]
    fn promote_writes_verified_records_and_signed_manifest() {
        let (td, gate) = setup();
        write_pending(td.path(), "a.json", &record_json("rec-a", "answer a"));
        write_pending(td.path(), "b.json", &record_json("rec-b", "answer b"));

        let outcome = gate.clean_pending().expect("clean");
        let manifest = gate.promote(&outcome.kept, inputs()).expect("promote");

        assert_eq!(manifest.record_count, 2);
        assert_eq!(manifest.run_id, "run-1");
        assert!(verified_dir(td.path()).join("rec-a.json").exists());
        assert!(verified_dir(td.path()).join("rec-b.json").exists());

        // The pair on disk verifies with the same key.
        let loaded = gate.load_verified_manifest().expect("verify");
        assert_eq!(loaded, manifest);

        // Verified record bytes are canonical.
        let on_disk =
            fs::read_to_string(verified_dir(td.path()).join("rec-a.json")).expect("read");
        assert!(heidi_canonical::is_canonical(&on_disk));
    }

    #[test]
    fn dataset_hash_is_order_independent() {
        let a: TrainingRecord =
            serde_json::from_str(&record_json("rec-a", "answer a")).expect("a");
        let b: TrainingRecord =
            serde_json::from_str(&record_json("rec-b", "answer b")).expect("b");

        let forward = dataset_hash(&[a.clone(), b.clone()]).expect("forward");
        let reverse = dataset_hash(&[b, a]).expect("reverse");
        assert_eq!(forward, reverse);
    }

    #[test]
    fn trainer_guard_accepts_verified_dataset() {
        let (td, gate) = setup();
        write_pending(td.path(), "a.json", &record_json("rec-a", "answer a"));
        let outcome = gate.clean_pending().expect("clean");
        gate.promote(&outcome.kept, inputs()).expect("promote");

        let resolved = gate
            .trainer_guard(Path::new("verified/rec-a.json"))
            .expect("guard");
        assert!(resolved.ends_with("verified/rec-a.json"));
    }

    #[test]
    fn trainer_guard_refuses_outside_verified() {
        let (td, gate) = setup();
        write_pending(td.path(), "a.json", &record_json("rec-a", "answer a"));
        let outcome = gate.clean_pending().expect("clean");
        gate.promote(&outcome.kept, inputs()).expect("promote");

        let err = gate
            .trainer_guard(Path::new("pending/a.json"))
            .expect_err("must refuse");
        assert!(matches!(err, KernelError::GatekeeperRefused(_)));
    }

    #[test]
    fn trainer_guard_refuses_without_manifest() {
        let (td, gate) = setup();
        fs::create_dir(verified_dir(td.path())).expect("mkdir verified");
        fs::write(verified_dir(td.path()).join("r.json"), "{}").expect("write");

        let err = gate
            .trainer_guard(Path::new("verified/r.json"))
            .expect_err("must refuse");
        assert!(matches!(err, KernelError::SignatureInvalid(_)));
    }

    #[test]
    fn trainer_guard_refuses_tampered_manifest() {
        let (td, gate) = setup();
        write_pending(td.path(), "a.json", &record_json("rec-a", "answer a"));
        let outcome = gate.clean_pending().expect("clean");
        gate.promote(&outcome.kept, inputs()).expect("promote");

        let path = manifest_path(td.path());
        let tampered = fs::read_to_string(&path)
            .expect("read")
            .replace("\"record_count\":1", "\"record_count\":2");
        fs::write(&path, tampered).expect("write tampered");

        let err = gate
            .trainer_guard(Path::new("verified/rec-a.json"))
            .expect_err("must refuse");
        assert!(matches!(err, KernelError::SignatureInvalid(_)));
    }

    #[test]
    fn keyless_gate_cleans_but_never_promotes() {
        let td = tempdir().expect("tempdir");
        fs::create_dir(pending_dir(td.path())).expect("mkdir pending");
        let gate = Gate::new(td.path(), "run-1", None);
        write_pending(td.path(), "a.json", &record_json("rec-a", "answer a"));

        let outcome = gate.clean_pending().expect("clean works keyless");
        assert_eq!(outcome.kept.len(), 1);

        let err = gate.promote(&outcome.kept, inputs()).expect_err("must refuse");
        assert!(matches!(err, KernelError::GatekeeperRefused(_)));
        assert!(!verified_dir(td.path()).exists());
    }

    #[test]
    fn empty_pending_is_a_clean_noop() {
        let (_td, gate) = setup();
        let outcome = gate.clean_pending().expect("clean");
        assert_eq!(outcome.records_in, 0);
        assert!(outcome.kept.is_empty());
    }
}
