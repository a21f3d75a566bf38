//! The file-backed key database.
//!
//! Layout under the registry root:
//!
//! ```text
//! keys/
//!   ca/                      identity CA (private dir 0700)
//!   ca-perm/                 permissions CA
//!   private/<type>/<owner>/<target>-key.pem     (0600, passphrase-sealed)
//!   public/<type>/<owner>/<target>-cert.pem
//!   permissions/<target>-permissions.xml.p7s
//!   governance.xml.p7s
//! ```
//!
//! Private keys never leave disk unsealed; the sealing passphrase is
//! resolved from `UVN_AUTH_<TARGET>` or the `.uno-auth-<target>` sidecar.

use crate::error::{IdentityError, Result};
use crate::key_id::{KeyId, KeyType};
use crate::permissions::{render_governance, render_permissions, topic_grants};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uvn_crypto::fsutil::{restrict_file, write_atomic};
use uvn_crypto::identity::verifying_key_from_hex;
use uvn_crypto::{
    passphrase, pem, CaSubject, CertificateAuthority, DetachedSignature, EncryptionKeyPair,
    IdentityKeyPair, PassphraseEnvelope, SealedEnvelope, SignedDocument,
};
use uvn_types::Email;

const KEYS_DIR: &str = "keys";
const CA_DIR: &str = "ca";
const PERM_CA_DIR: &str = "ca-perm";
const PRIVATE_DIR: &str = "private";
const PUBLIC_DIR: &str = "public";
const PERMISSIONS_DIR: &str = "permissions";
const GOVERNANCE_FILE: &str = "governance.xml.p7s";
const BACKEND_FILE: &str = "backend.json";
const CA_PUBLIC_FILE: &str = "ca-public.pem";

const TAG_PRIVATE: &str = "UVN ENCRYPTED PRIVATE KEY";
const TAG_SIGN_PUBLIC: &str = "UVN SIGNING PUBLIC KEY";
const TAG_ENC_PUBLIC: &str = "UVN ENCRYPTION PUBLIC KEY";
const TAG_CERTIFICATE: &str = "CERTIFICATE";

/// Static configuration of the backend, persisted next to the keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysBackendConfig {
    pub organization: String,
    pub owner: Email,
    pub dds_domain: u32,
    pub enable_dds_security: bool,
    pub init_ts: i64,
}

/// Loaded public material for one key.
#[derive(Debug, Clone)]
pub struct Key {
    pub id: KeyId,
    pub cert_pem: String,
    pub sign_public_hex: String,
    pub enc_public_base64: String,
}

/// Decrypted private material for one key.
pub struct KeyMaterial {
    pub sign: IdentityKeyPair,
    pub enc: EncryptionKeyPair,
}

#[derive(Serialize, Deserialize)]
struct PrivateRecord {
    sign_key_pem: String,
    enc_secret: String,
}

/// Public half of a certificate authority, as distributed in bundles.
#[derive(Debug, Clone)]
pub struct CaPublic {
    pub cert_pem: String,
    pub sign_public_hex: String,
}

pub struct KeysBackend {
    root: PathBuf,
    config: KeysBackendConfig,
}

impl KeysBackend {
    /// Create the backend rooted at `root`, persisting its configuration.
    pub fn create(root: &Path, config: KeysBackendConfig) -> Result<Self> {
        let backend = Self {
            root: root.to_path_buf(),
            config,
        };
        fs::create_dir_all(backend.keys_dir())?;
        write_atomic(
            &backend.keys_dir().join(BACKEND_FILE),
            serde_json::to_string_pretty(&backend.config)?.as_bytes(),
        )?;
        Ok(backend)
    }

    /// Open an existing backend.
    pub fn open(root: &Path) -> Result<Self> {
        let config_path = root.join(KEYS_DIR).join(BACKEND_FILE);
        if !config_path.exists() {
            return Err(IdentityError::NotInitialized(
                root.display().to_string(),
            ));
        }
        let config: KeysBackendConfig = serde_json::from_str(&fs::read_to_string(config_path)?)?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &KeysBackendConfig {
        &self.config
    }

    fn keys_dir(&self) -> PathBuf {
        self.root.join(KEYS_DIR)
    }

    fn ca_dir(&self) -> PathBuf {
        self.keys_dir().join(CA_DIR)
    }

    fn perm_ca_dir(&self) -> PathBuf {
        self.keys_dir().join(PERM_CA_DIR)
    }

    fn private_key_path(&self, id: &KeyId) -> PathBuf {
        self.keys_dir()
            .join(PRIVATE_DIR)
            .join(id.kind.as_str())
            .join(id.owner.as_str())
            .join(format!("{}-key.pem", id.target))
    }

    fn public_key_path(&self, id: &KeyId) -> PathBuf {
        self.keys_dir()
            .join(PUBLIC_DIR)
            .join(id.kind.as_str())
            .join(id.owner.as_str())
            .join(format!("{}-cert.pem", id.target))
    }

    fn permissions_path(&self, target: &str) -> PathBuf {
        self.keys_dir()
            .join(PERMISSIONS_DIR)
            .join(format!("{}-permissions.xml.p7s", target))
    }

    pub fn governance_path(&self) -> PathBuf {
        self.keys_dir().join(GOVERNANCE_FILE)
    }

    pub fn identity_ca(&self) -> Result<CertificateAuthority> {
        Ok(CertificateAuthority::load(&self.ca_dir())?)
    }

    pub fn permissions_ca(&self) -> Result<CertificateAuthority> {
        Ok(CertificateAuthority::load(&self.perm_ca_dir())?)
    }

    pub fn identity_ca_public(&self) -> Result<CaPublic> {
        load_ca_public(&self.ca_dir().join(CA_PUBLIC_FILE))
    }

    pub fn permissions_ca_public(&self) -> Result<CaPublic> {
        load_ca_public(&self.perm_ca_dir().join(CA_PUBLIC_FILE))
    }

    /// Generate key material for `id`.
    ///
    /// For a ROOT id this bootstraps both certificate authorities and the
    /// signed governance document first (idempotently), then issues the
    /// registry-owner identity. Existing key files for `id` are replaced
    /// (that is the rekey path); the sealing passphrase is kept when it can
    /// be resolved, generated otherwise.
    pub fn generate_key(&self, id: &KeyId) -> Result<Key> {
        if id.kind == KeyType::Root {
            self.bootstrap_authorities()?;
        } else if !CertificateAuthority::exists(&self.ca_dir()) {
            return Err(IdentityError::NotInitialized(
                self.ca_dir().display().to_string(),
            ));
        }

        let identity_ca = self.identity_ca()?;
        let (sign_key, sign_key_pem) = uvn_crypto::ca::generate_entity_key()?;
        let enc_key = EncryptionKeyPair::generate();
        let cert_pem = identity_ca.issue_certificate(&id.target, &sign_key_pem)?;

        let pass = match passphrase::resolve(&self.root, &id.target, &id.env_suffix()) {
            Some(existing) => existing,
            None => {
                let generated = passphrase::generate_passphrase(passphrase::MIN_PASSPHRASE_LEN);
                passphrase::write_sidecar(&self.root, &id.target, &generated)?;
                generated
            }
        };

        let record = PrivateRecord {
            sign_key_pem: sign_key_pem.to_string(),
            enc_secret: enc_key.secret_base64(),
        };
        let sealed = PassphraseEnvelope::seal(serde_json::to_vec(&record)?.as_slice(), &pass)?;
        let private_path = self.private_key_path(id);
        ensure_parent(&private_path)?;
        write_atomic(
            &private_path,
            pem::encode(TAG_PRIVATE, serde_json::to_string_pretty(&sealed)?.as_bytes()).as_bytes(),
        )?;
        restrict_file(&private_path)?;

        let sign_public = sign_key.verifying_key().to_bytes();
        let mut public_blob = cert_pem.clone();
        public_blob.push_str(&pem::encode(TAG_SIGN_PUBLIC, &sign_public));
        public_blob.push_str(&pem::encode(TAG_ENC_PUBLIC, &enc_key.public_bytes()));
        let public_path = self.public_key_path(id);
        ensure_parent(&public_path)?;
        write_atomic(&public_path, public_blob.as_bytes())?;

        if id.kind != KeyType::Particle {
            self.write_permissions(id)?;
        }

        info!(key = %id, "generated key material");
        self.get_key(id)
    }

    fn bootstrap_authorities(&self) -> Result<()> {
        let org = self.config.organization.clone();
        let identity_ca = CertificateAuthority::create(
            &self.ca_dir(),
            CaSubject {
                organization: org.clone(),
                common_name: format!("{} identity", org),
            },
            self.config.init_ts,
        )?;
        write_ca_public(&identity_ca, &self.ca_dir().join(CA_PUBLIC_FILE))?;

        let perm_ca = CertificateAuthority::create(
            &self.perm_ca_dir(),
            CaSubject {
                organization: org.clone(),
                common_name: format!("{} permissions", org),
            },
            self.config.init_ts,
        )?;
        write_ca_public(&perm_ca, &self.perm_ca_dir().join(CA_PUBLIC_FILE))?;

        if !self.governance_path().exists() {
            let xml = render_governance(
                &org,
                self.config.dds_domain,
                self.config.enable_dds_security,
            );
            let signed = perm_ca.sign_document(xml.as_bytes());
            write_atomic(&self.governance_path(), signed.to_json()?.as_bytes())?;
            debug!("governance document signed");
        }
        Ok(())
    }

    fn write_permissions(&self, id: &KeyId) -> Result<()> {
        let perm_ca = self.permissions_ca()?;
        let grants = topic_grants(id.kind);
        let xml = render_permissions(
            &id.target,
            &id.target,
            &self.config.organization,
            self.config.dds_domain,
            perm_ca.not_before(),
            perm_ca.not_after(),
            &grants,
        );
        let signed = perm_ca.sign_document(xml.as_bytes());
        let path = self.permissions_path(&id.target);
        ensure_parent(&path)?;
        write_atomic(&path, signed.to_json()?.as_bytes())?;
        Ok(())
    }

    /// Load the public material for `id`.
    pub fn get_key(&self, id: &KeyId) -> Result<Key> {
        let path = self.public_key_path(id);
        if !path.exists() {
            return Err(IdentityError::MissingKey(id.to_string()));
        }
        let blob = fs::read_to_string(&path)?;
        let cert_der = pem::find(&blob, TAG_CERTIFICATE)?;
        let sign_public = pem::find(&blob, TAG_SIGN_PUBLIC)?;
        let enc_public = pem::find(&blob, TAG_ENC_PUBLIC)?;
        Ok(Key {
            id: id.clone(),
            cert_pem: pem::encode(TAG_CERTIFICATE, &cert_der),
            sign_public_hex: hex::encode(&sign_public),
            enc_public_base64: BASE64.encode(&enc_public),
        })
    }

    /// Find a key by target name alone.
    ///
    /// Fails with `MultipleKeys` when more than one triple matches; that
    /// indicates an implementation bug upstream, not user error.
    pub fn find_key(&self, target: &str) -> Result<Key> {
        let mut matches = self.search_keys(None, Some(target), None)?.into_iter();
        match (matches.next(), matches.next()) {
            (None, _) => Err(IdentityError::MissingKey(target.to_string())),
            (Some(key), None) => Ok(key),
            (Some(_), Some(_)) => Err(IdentityError::MultipleKeys(target.to_string())),
        }
    }

    /// Filesystem-backed key search; every filter is optional.
    pub fn search_keys(
        &self,
        owner: Option<&Email>,
        target: Option<&str>,
        kind: Option<KeyType>,
    ) -> Result<Vec<Key>> {
        let mut keys = Vec::new();
        let public_root = self.keys_dir().join(PUBLIC_DIR);
        for kt in KeyType::ALL {
            if kind.is_some() && kind != Some(kt) {
                continue;
            }
            let kind_dir = public_root.join(kt.as_str());
            if !kind_dir.is_dir() {
                continue;
            }
            for owner_entry in sorted_entries(&kind_dir)? {
                let owner_name = owner_entry.file_name().to_string_lossy().to_string();
                let owner_email = match Email::parse(&owner_name) {
                    Ok(email) => email,
                    Err(_) => continue,
                };
                if let Some(filter) = owner {
                    if *filter != owner_email {
                        continue;
                    }
                }
                for file_entry in sorted_entries(&owner_entry.path())? {
                    let file_name = file_entry.file_name().to_string_lossy().to_string();
                    let Some(stem) = file_name.strip_suffix("-cert.pem") else {
                        continue;
                    };
                    if let Some(filter) = target {
                        if filter != stem {
                            continue;
                        }
                    }
                    let id = KeyId::new(kt, owner_email.clone(), stem);
                    keys.push(self.get_key(&id)?);
                }
            }
        }
        Ok(keys)
    }

    /// Decrypt the private material for `key`.
    pub fn load_material(&self, key: &Key) -> Result<KeyMaterial> {
        let pass = passphrase::resolve(&self.root, &key.id.target, &key.id.env_suffix())
            .ok_or_else(|| {
                IdentityError::MissingPassphrase(key.id.target.clone(), key.id.env_suffix())
            })?;
        let blob = fs::read_to_string(self.private_key_path(&key.id))?;
        let envelope_json = pem::find(&blob, TAG_PRIVATE)?;
        let envelope: PassphraseEnvelope =
            serde_json::from_slice(&envelope_json)?;
        let record: PrivateRecord = serde_json::from_slice(&envelope.open(&pass)?)?;
        Ok(KeyMaterial {
            sign: IdentityKeyPair::from_pkcs8_pem(&record.sign_key_pem)?,
            enc: EncryptionKeyPair::from_secret_base64(&record.enc_secret)?,
        })
    }

    /// Sign `input` with the ROOT key, writing a detached signature file.
    pub fn sign_file(&self, key: &Key, input: &Path, output: &Path) -> Result<()> {
        if key.id.kind != KeyType::Root {
            return Err(IdentityError::RootKeyRequired(key.id.to_string()));
        }
        let material = self.load_material(key)?;
        let data = fs::read(input)?;
        let signature = material.sign.sign(&data, &key.id.target);
        write_atomic(output, signature.to_json()?.as_bytes())?;
        Ok(())
    }

    /// Verify a detached signature against the recorded public key of `key`.
    pub fn verify_signature(&self, key: &Key, signature_file: &Path, original: &Path) -> Result<()> {
        let signature = DetachedSignature::from_json(&fs::read_to_string(signature_file)?)?;
        let data = fs::read(original)?;
        let expected = verifying_key_from_hex(&key.sign_public_hex)?;
        signature.verify_with_key(&data, &expected)?;
        Ok(())
    }

    /// Seal `input` to the recipient's encryption key.
    pub fn encrypt_file(&self, recipient: &Key, input: &Path, output: &Path) -> Result<()> {
        let data = fs::read(input)?;
        SealedEnvelope::write_file(output, &data, &recipient.enc_public_base64)?;
        Ok(())
    }

    /// Decrypt a file sealed to `key`.
    pub fn decrypt_file(&self, key: &Key, input: &Path, output: &Path) -> Result<()> {
        let material = self.load_material(key)?;
        let data = SealedEnvelope::read_file(input, &material.enc)?;
        write_atomic(output, &data)?;
        Ok(())
    }

    /// Materialize the key's files into `out_dir` for bundling.
    ///
    /// ROOT keys additionally stage the governance document and both CA
    /// public records. Returns the staged file paths.
    pub fn export_key(&self, key: &Key, out_dir: &Path, with_privkey: bool) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(out_dir)?;
        let mut staged = Vec::new();

        let cert_out = out_dir.join(format!("{}-cert.pem", key.id.target));
        fs::copy(self.public_key_path(&key.id), &cert_out)?;
        staged.push(cert_out);

        let permissions = self.permissions_path(&key.id.target);
        if permissions.exists() {
            let out = out_dir.join(format!("{}-permissions.xml.p7s", key.id.target));
            fs::copy(&permissions, &out)?;
            staged.push(out);
        }

        if with_privkey {
            let key_out = out_dir.join(format!("{}-key.pem", key.id.target));
            fs::copy(self.private_key_path(&key.id), &key_out)?;
            restrict_file(&key_out)?;
            staged.push(key_out);

            let pass = passphrase::resolve(&self.root, &key.id.target, &key.id.env_suffix())
                .ok_or_else(|| {
                    IdentityError::MissingPassphrase(key.id.target.clone(), key.id.env_suffix())
                })?;
            staged.push(passphrase::write_sidecar(out_dir, &key.id.target, &pass)?);
        }

        if key.id.kind == KeyType::Root {
            let org = &self.config.organization;
            let ca_out = out_dir.join(format!("{}-ca.pem", org));
            fs::copy(self.ca_dir().join(CA_PUBLIC_FILE), &ca_out)?;
            staged.push(ca_out);
            let perm_out = out_dir.join(format!("{}-perm-ca.pem", org));
            fs::copy(self.perm_ca_dir().join(CA_PUBLIC_FILE), &perm_out)?;
            staged.push(perm_out);
            let gov_out = out_dir.join(GOVERNANCE_FILE);
            fs::copy(self.governance_path(), &gov_out)?;
            staged.push(gov_out);
        }

        debug!(key = %key.id, files = staged.len(), "exported key material");
        Ok(staged)
    }

    /// Mirror of `export_key`: ingest staged files from `base_dir`.
    ///
    /// Used by an agent bootstrapping its local database from a received
    /// bundle; CA records and governance are imported when present. The
    /// sidecar passphrase file, if any, is copied next to the backend root
    /// and kept there.
    pub fn import_key(&self, id: &KeyId, base_dir: &Path) -> Result<Key> {
        let cert_in = base_dir.join(format!("{}-cert.pem", id.target));
        if !cert_in.exists() {
            return Err(IdentityError::MissingKey(id.to_string()));
        }
        let public_path = self.public_key_path(id);
        ensure_parent(&public_path)?;
        fs::copy(&cert_in, &public_path)?;

        let key_in = base_dir.join(format!("{}-key.pem", id.target));
        if key_in.exists() {
            let private_path = self.private_key_path(id);
            ensure_parent(&private_path)?;
            fs::copy(&key_in, &private_path)?;
            restrict_file(&private_path)?;
        }

        let sidecar_in = base_dir.join(passphrase::sidecar_file_name(&id.target));
        if sidecar_in.exists() {
            let sidecar_out = passphrase::sidecar_path(&self.root, &id.target);
            fs::copy(&sidecar_in, &sidecar_out)?;
            restrict_file(&sidecar_out)?;
        }

        let permissions_in = base_dir.join(format!("{}-permissions.xml.p7s", id.target));
        if permissions_in.exists() {
            let path = self.permissions_path(&id.target);
            ensure_parent(&path)?;
            fs::copy(&permissions_in, &path)?;
        }

        if let Some(found) = find_with_suffix(base_dir, "-perm-ca.pem")? {
            fs::create_dir_all(self.perm_ca_dir())?;
            fs::copy(&found, self.perm_ca_dir().join(CA_PUBLIC_FILE))?;
        }
        if let Some(found) = find_identity_ca(base_dir)? {
            fs::create_dir_all(self.ca_dir())?;
            fs::copy(&found, self.ca_dir().join(CA_PUBLIC_FILE))?;
        }

        let governance_in = base_dir.join(GOVERNANCE_FILE);
        if governance_in.exists() {
            fs::copy(&governance_in, self.governance_path())?;
        }

        info!(key = %id, "imported key material");
        self.get_key(id)
    }

    /// Load and verify the governance document against the permissions CA.
    pub fn verify_governance(&self) -> Result<Vec<u8>> {
        let signed = SignedDocument::from_json(&fs::read_to_string(self.governance_path())?)?;
        let ca = self.permissions_ca_public()?;
        let expected = verifying_key_from_hex(&ca.sign_public_hex)?;
        Ok(signed.open_with_key(&expected)?)
    }

    /// Load and verify an entity's permissions document.
    pub fn verify_permissions(&self, target: &str) -> Result<Vec<u8>> {
        let signed = SignedDocument::from_json(&fs::read_to_string(self.permissions_path(target))?)?;
        let ca = self.permissions_ca_public()?;
        let expected = verifying_key_from_hex(&ca.sign_public_hex)?;
        Ok(signed.open_with_key(&expected)?)
    }

    /// Delete a key's files. Key material is only dropped explicitly; a ban
    /// keeps everything on disk.
    pub fn drop_key(&self, key: &Key) -> Result<()> {
        for path in [
            self.private_key_path(&key.id),
            self.public_key_path(&key.id),
            self.permissions_path(&key.id.target),
            passphrase::sidecar_path(&self.root, &key.id.target),
        ] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        info!(key = %key.id, "dropped key material");
        Ok(())
    }

    /// Delete every key of every entity (CAs are kept).
    pub fn drop_keys(&self) -> Result<()> {
        for key in self.search_keys(None, None, None)? {
            self.drop_key(&key)?;
        }
        Ok(())
    }
}

fn write_ca_public(ca: &CertificateAuthority, path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let mut blob = ca.cert_pem().to_string();
    blob.push_str(&pem::encode(TAG_SIGN_PUBLIC, &ca.public_key_bytes()));
    write_atomic(path, blob.as_bytes())?;
    Ok(())
}

fn load_ca_public(path: &Path) -> Result<CaPublic> {
    let blob = fs::read_to_string(path)?;
    let cert_der = pem::find(&blob, TAG_CERTIFICATE)?;
    let sign_public = pem::find(&blob, TAG_SIGN_PUBLIC)?;
    Ok(CaPublic {
        cert_pem: pem::encode(TAG_CERTIFICATE, &cert_der),
        sign_public_hex: hex::encode(&sign_public),
    })
}

fn sorted_entries(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

fn find_with_suffix(dir: &Path, suffix: &str) -> Result<Option<PathBuf>> {
    for entry in sorted_entries(dir)? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(suffix) {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

fn find_identity_ca(dir: &Path) -> Result<Option<PathBuf>> {
    for entry in sorted_entries(dir)? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with("-ca.pem") && !name.ends_with("-perm-ca.pem") {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}
