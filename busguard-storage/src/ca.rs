//! Certificate authority: key custody, serial allocation, minting, signing.

use std::sync::Arc;

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey};
use parking_lot::Mutex;

use busguard_core::{
    Application, Error, GroupInfo, Guid, IdentityCertificate, IdentityInfo, KeyInfo, Manifest,
    MembershipCertificate, MembershipChain, PublicKey, Result, Validity,
};

use crate::sql::SqlStorage;

/// Name of the well-known group whose members administer every application
/// claimed by this CA.
pub const ADMIN_GROUP_NAME: &str = "Admin group";

/// Every byte of the well-known admin group GUID.
pub const ADMIN_GROUP_GUID_BYTE: u8 = 0xab;

/// Everything `register_agent` produces for the caller to commit during
/// self-claiming.
pub struct AgentRegistration {
    pub admin_group: GroupInfo,
    pub identity_certs: Vec<IdentityCertificate>,
    pub memberships: Vec<MembershipChain>,
}

/// The local certificate authority.
///
/// Owns the P-256 signing key, persisted as a blob outside the state tables
/// so it can be rotated independently. Every key access goes through one
/// internal mutex.
pub struct CertificateAuthority {
    storage: Arc<SqlStorage>,
    key: Mutex<SigningKey>,
}

impl CertificateAuthority {
    /// Load the CA key pair, generating and persisting a fresh one on first
    /// run. A persisted blob that does not parse is `KeyUnavailable`.
    pub fn open(storage: Arc<SqlStorage>) -> Result<Self> {
        let key = match storage.load_ca_key()? {
            Some(blob) => SigningKey::from_slice(&blob).map_err(|_| Error::KeyUnavailable)?,
            None => {
                let key = SigningKey::random(&mut rand::rngs::OsRng);
                storage.store_ca_key(key.to_bytes().as_slice())?;
                tracing::info!("generated new CA key pair");
                key
            }
        };
        Ok(CertificateAuthority {
            storage,
            key: Mutex::new(key),
        })
    }

    /// The CA public key and its AKI, as used for issuer CNs and as the
    /// authority of every group this agent creates.
    pub fn public_key_info(&self) -> Result<KeyInfo> {
        let key = self.key.lock();
        Ok(KeyInfo::new(PublicKey::from_verifying_key(
            key.verifying_key(),
        )))
    }

    /// The well-known admin group: fixed name, deterministic GUID, authority
    /// set to the CA public key.
    pub fn admin_group(&self) -> Result<GroupInfo> {
        let info = self.public_key_info()?;
        Ok(GroupInfo {
            authority: Some(info.public_key),
            guid: Guid::filled(ADMIN_GROUP_GUID_BYTE),
            name: ADMIN_GROUP_NAME.into(),
            desc: String::new(),
        })
    }

    fn sign_tbs(&self, tbs: &[u8]) -> Result<Vec<u8>> {
        let key = self.key.lock();
        let signature: Signature = key
            .try_sign(tbs)
            .map_err(|e| Error::SignatureFailed(e.to_string()))?;
        Ok(signature.to_der().as_bytes().to_vec())
    }

    /// Sign a certificate: allocate a serial if none is set, stamp the
    /// issuer CN, and sign the canonical to-be-signed encoding.
    pub fn sign_identity(&self, cert: &mut IdentityCertificate) -> Result<()> {
        if cert.serial.is_empty() {
            cert.serial = self.storage.get_new_serial()?;
        }
        cert.issuer_cn = self.public_key_info()?.aki;
        let tbs = cert.tbs_bytes()?;
        cert.signature = self.sign_tbs(&tbs)?;
        Ok(())
    }

    pub fn sign_membership(&self, cert: &mut MembershipCertificate) -> Result<()> {
        if cert.serial.is_empty() {
            cert.serial = self.storage.get_new_serial()?;
        }
        cert.issuer_cn = self.public_key_info()?.aki;
        let tbs = cert.tbs_bytes()?;
        cert.signature = self.sign_tbs(&tbs)?;
        Ok(())
    }

    fn verify_tbs(&self, tbs: &[u8], signature: &[u8]) -> Result<bool> {
        let info = self.public_key_info()?;
        let verifying_key = info.public_key.to_verifying_key()?;
        let signature =
            Signature::from_der(signature).map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(verifying_key.verify(tbs, &signature).is_ok())
    }

    pub fn verify_identity(&self, cert: &IdentityCertificate) -> Result<bool> {
        self.verify_tbs(&cert.tbs_bytes()?, &cert.signature)
    }

    pub fn verify_membership(&self, cert: &MembershipCertificate) -> Result<bool> {
        self.verify_tbs(&cert.tbs_bytes()?, &cert.signature)
    }

    /// Mint and sign an identity certificate binding the application's key
    /// to the identity and the digest of its manifest.
    pub fn mint_identity(
        &self,
        app: &Application,
        identity: &IdentityInfo,
        manifest: &Manifest,
    ) -> Result<IdentityCertificate> {
        let mut cert = IdentityCertificate {
            serial: String::new(),
            validity: Validity::standard(),
            subject_public_key: app.public_key,
            issuer_cn: String::new(),
            subject_cn: app.aki.clone(),
            subject_ou: identity.name.clone(),
            alias: identity.guid.to_hex(),
            manifest_digest: manifest.digest()?,
            signature: Vec::new(),
        };
        self.sign_identity(&mut cert)?;
        Ok(cert)
    }

    /// Mint and sign a membership certificate placing the application in the
    /// group.
    pub fn mint_membership(
        &self,
        app: &Application,
        group: &GroupInfo,
    ) -> Result<MembershipCertificate> {
        let mut cert = MembershipCertificate {
            serial: String::new(),
            validity: Validity::standard(),
            subject_public_key: app.public_key,
            issuer_cn: String::new(),
            subject_cn: app.aki.clone(),
            guild: group.guid,
            ca: false,
            signature: Vec::new(),
        };
        self.sign_membership(&mut cert)?;
        Ok(cert)
    }

    /// Stored membership certificates for an application, subject CN
    /// normalized to the application's AKI and re-signed for push.
    pub fn membership_certificates(
        &self,
        app: &Application,
    ) -> Result<Vec<MembershipCertificate>> {
        let mut certs = self
            .storage
            .get_membership_certificates(Some(&app.public_key), None)?;
        for cert in &mut certs {
            cert.subject_cn = app.aki.clone();
            self.sign_membership(cert)?;
        }
        Ok(certs)
    }

    /// Bootstrap for self-claiming: mints the agent's own identity
    /// certificate and its admin-group membership, and hands back the admin
    /// group so the caller can commit all three.
    pub fn register_agent(
        &self,
        agent_identity: &IdentityInfo,
        agent_key: &PublicKey,
        manifest: &Manifest,
    ) -> Result<AgentRegistration> {
        let admin_group = self.admin_group()?;
        let agent_app = Application::new(*agent_key);

        let membership = self.mint_membership(&agent_app, &admin_group)?;
        let identity_cert = self.mint_identity(&agent_app, agent_identity, manifest)?;

        Ok(AgentRegistration {
            admin_group,
            identity_certs: vec![identity_cert],
            memberships: vec![vec![membership]],
        })
    }
}
