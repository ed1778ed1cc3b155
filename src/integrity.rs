use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_FILENAME: &str = ".warden.manifest";
pub const PBKDF2_ITERATIONS: u32 = 200_000;
const SALT_LEN: usize = 32;
const KEY_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Files covered by the boot manifest when the operator does not supply
/// an explicit list: the security-critical sources plus persistent
/// memory. Missing entries are skipped at generation time.
pub fn default_trust_roots(base_dir: &Path) -> Vec<PathBuf> {
    [
        "src/sandbox.rs",
        "src/pathguard.rs",
        "src/normalize.rs",
        "src/protocol.rs",
        "src/gate.rs",
        "src/taint.rs",
        "src/integrity.rs",
        "src/binpath.rs",
        "MEMORY.md",
    ]
    .iter()
    .map(|rel| base_dir.join(rel))
    .filter(|p| p.is_file())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub created_utc: String,
    pub entries: Vec<ManifestEntry>,
    pub salt: String,
    pub iterations: u32,
    pub hmac: String,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no manifest at {0}; run --generate-manifest first")]
    Missing(PathBuf),
    #[error("manifest io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid manifest format: {0}")]
    Format(String),
    #[error("HMAC verification failed: manifest tampered with or passphrase incorrect")]
    MacMismatch,
    #[error("trust root tampered: {}", .0.join(", "))]
    Tampered(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub files_checked: usize,
}

/// Generates and verifies the HMAC-signed boot manifest. The passphrase
/// is never stored; the HMAC key is derived from it per manifest with a
/// fresh salt.
pub struct IntegrityVerifier {
    base_dir: PathBuf,
    manifest_path: PathBuf,
}

impl IntegrityVerifier {
    pub fn new(base_dir: &Path) -> Self {
        let base_dir = std::fs::canonicalize(base_dir).unwrap_or_else(|_| base_dir.to_path_buf());
        let manifest_path = base_dir.join(MANIFEST_FILENAME);
        IntegrityVerifier {
            base_dir,
            manifest_path,
        }
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn manifest_exists(&self) -> bool {
        self.manifest_path.is_file()
    }

    /// Hash every trust root, HMAC the entry list, write the manifest.
    pub fn generate(
        &self,
        passphrase: &str,
        trust_roots: &[PathBuf],
    ) -> Result<PathBuf, ManifestError> {
        if passphrase.is_empty() {
            return Err(ManifestError::Format("passphrase cannot be empty".into()));
        }
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let key = derive_key(passphrase, &salt, PBKDF2_ITERATIONS);

        let mut entries = Vec::new();
        for root in trust_roots {
            let abs = if root.is_absolute() {
                root.clone()
            } else {
                self.base_dir.join(root)
            };
            let bytes = std::fs::read(&abs)?;
            entries.push(ManifestEntry {
                path: relative_display(&abs, &self.base_dir),
                sha256: hex::encode(Sha256::digest(&bytes)),
                size: bytes.len() as u64,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let tag = compute_tag(&key, &entries)?;
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            created_utc: Utc::now().to_rfc3339(),
            entries,
            salt: BASE64.encode(salt),
            iterations: PBKDF2_ITERATIONS,
            hmac: BASE64.encode(tag),
        };
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| ManifestError::Format(e.to_string()))?;
        std::fs::write(&self.manifest_path, json)?;
        Ok(self.manifest_path.clone())
    }

    /// Recompute every hash and the HMAC tag. Mismatched files are
    /// reported by name so the operator knows exactly what moved.
    pub fn verify(&self, passphrase: &str) -> Result<VerifyReport, ManifestError> {
        if !self.manifest_exists() {
            return Err(ManifestError::Missing(self.manifest_path.clone()));
        }
        let raw = std::fs::read_to_string(&self.manifest_path)?;
        let manifest: Manifest =
            serde_json::from_str(&raw).map_err(|e| ManifestError::Format(e.to_string()))?;

        let salt = BASE64
            .decode(&manifest.salt)
            .map_err(|e| ManifestError::Format(format!("salt: {e}")))?;
        let tag = BASE64
            .decode(&manifest.hmac)
            .map_err(|e| ManifestError::Format(format!("hmac: {e}")))?;
        let key = derive_key(passphrase, &salt, manifest.iterations);

        let mut entries = manifest.entries.clone();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let payload =
            serde_json::to_vec(&entries).map_err(|e| ManifestError::Format(e.to_string()))?;
        let mut mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
        mac.update(&payload);
        mac.verify_slice(&tag).map_err(|_| ManifestError::MacMismatch)?;

        let mut tampered = Vec::new();
        for entry in &entries {
            let abs = self.base_dir.join(&entry.path);
            match std::fs::read(&abs) {
                Ok(bytes) => {
                    let actual = hex::encode(Sha256::digest(&bytes));
                    if actual != entry.sha256 {
                        tampered.push(entry.path.clone());
                    }
                }
                Err(_) => tampered.push(format!("{} (missing)", entry.path)),
            }
        }
        if !tampered.is_empty() {
            return Err(ManifestError::Tampered(tampered));
        }
        Ok(VerifyReport {
            files_checked: entries.len(),
        })
    }
}

fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut key);
    key
}

/// HMAC input: the canonical JSON of the lexicographically ordered entry
/// list, nothing else. Timestamps and formatting stay outside the tag.
fn compute_tag(key: &[u8], entries: &[ManifestEntry]) -> Result<Vec<u8>, ManifestError> {
    let payload = serde_json::to_vec(entries).map_err(|e| ManifestError::Format(e.to_string()))?;
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn relative_display(abs: &Path, base: &Path) -> String {
    abs.strip_prefix(base)
        .unwrap_or(abs)
        .to_string_lossy()
        .replace('\\', "/")
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{IntegrityVerifier, Manifest, ManifestError, PBKDF2_ITERATIONS};

    fn seed(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
        std::fs::create_dir_all(dir.join("src")).expect("mkdir");
        std::fs::write(dir.join("src/sandbox.rs"), "pub fn validate() {}\n").expect("write");
        std::fs::write(dir.join("MEMORY.md"), "# Memory\n").expect("write");
        vec![dir.join("src/sandbox.rs"), dir.join("MEMORY.md")]
    }

    #[test]
    fn generate_then_verify_succeeds() {
        let tmp = tempdir().expect("tempdir");
        let roots = seed(tmp.path());
        let verifier = IntegrityVerifier::new(tmp.path());
        verifier.generate("correct horse", &roots).expect("generate");
        let report = verifier.verify("correct horse").expect("verify");
        assert_eq!(report.files_checked, 2);
    }

    #[test]
    fn wrong_passphrase_fails_the_mac() {
        let tmp = tempdir().expect("tempdir");
        let roots = seed(tmp.path());
        let verifier = IntegrityVerifier::new(tmp.path());
        verifier.generate("correct horse", &roots).expect("generate");
        match verifier.verify("battery staple") {
            Err(ManifestError::MacMismatch) => {}
            other => panic!("expected MacMismatch, got {other:?}"),
        }
    }

    #[test]
    fn single_byte_mutation_names_the_file() {
        let tmp = tempdir().expect("tempdir");
        let roots = seed(tmp.path());
        let verifier = IntegrityVerifier::new(tmp.path());
        verifier.generate("pw", &roots).expect("generate");
        std::fs::write(tmp.path().join("src/sandbox.rs"), "pub fn validate() { }\n")
            .expect("mutate");
        match verifier.verify("pw") {
            Err(ManifestError::Tampered(files)) => {
                assert_eq!(files, vec!["src/sandbox.rs".to_string()]);
            }
            other => panic!("expected Tampered, got {other:?}"),
        }
    }

    #[test]
    fn missing_trust_root_is_reported() {
        let tmp = tempdir().expect("tempdir");
        let roots = seed(tmp.path());
        let verifier = IntegrityVerifier::new(tmp.path());
        verifier.generate("pw", &roots).expect("generate");
        std::fs::remove_file(tmp.path().join("MEMORY.md")).expect("remove");
        match verifier.verify("pw") {
            Err(ManifestError::Tampered(files)) => {
                assert!(files[0].contains("MEMORY.md"));
                assert!(files[0].contains("missing"));
            }
            other => panic!("expected Tampered, got {other:?}"),
        }
    }

    #[test]
    fn editing_the_manifest_entries_breaks_the_mac() {
        let tmp = tempdir().expect("tempdir");
        let roots = seed(tmp.path());
        let verifier = IntegrityVerifier::new(tmp.path());
        let path = verifier.generate("pw", &roots).expect("generate");
        let raw = std::fs::read_to_string(&path).expect("read");
        let mut manifest: Manifest = serde_json::from_str(&raw).expect("json");
        manifest.entries[0].sha256 = super::sha256_hex(b"forged");
        std::fs::write(&path, serde_json::to_string(&manifest).expect("json")).expect("write");
        match verifier.verify("pw") {
            Err(ManifestError::MacMismatch) => {}
            other => panic!("expected MacMismatch, got {other:?}"),
        }
    }

    #[test]
    fn verification_is_repeatable_over_unmodified_roots() {
        let tmp = tempdir().expect("tempdir");
        let roots = seed(tmp.path());
        let verifier = IntegrityVerifier::new(tmp.path());
        verifier.generate("pw", &roots).expect("generate");
        for _ in 0..3 {
            verifier.verify("pw").expect("stable verify");
        }
        assert_eq!(PBKDF2_ITERATIONS, 200_000);
    }

    #[test]
    fn empty_passphrase_is_refused() {
        let tmp = tempdir().expect("tempdir");
        let roots = seed(tmp.path());
        let verifier = IntegrityVerifier::new(tmp.path());
        assert!(verifier.generate("", &roots).is_err());
    }
}
