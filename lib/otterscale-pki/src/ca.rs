use ed25519_dalek::{pkcs8::EncodePrivateKey, SigningKey};
use hkdf::Hkdf;
use zeroize::Zeroize;
use hmac::{Hmac, Mac};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use sha2::Sha256;
use time::{Duration, OffsetDateTime};

use crate::error::PkiError;

/// The seed value documented (and rejected) as an insecure default. Operators
/// who forget to set `--tunnel-key-seed` / `OTTERSCALE_SERVER_TUNNEL_KEY_SEED`
/// would otherwise run every hub with an identical, publicly known CA.
pub const PLACEHOLDER_SEED: &str = "changeme";

const CA_KEYPAIR_INFO: &[u8] = b"otterscale-pki/ca-keypair/v1";
const CA_COMMON_NAME: &str = "Otterscale Hub CA";

/// A self-signed root certificate plus private key, derived deterministically
/// from a secret seed. Two [`CertificateAuthority`]s constructed from the
/// same seed hold the same keypair and therefore mutually validate
/// certificates issued by the other.
pub struct CertificateAuthority {
    key_pair: KeyPair,
    params: CertificateParams,
    cert: rcgen::Certificate,
    cert_pem: String,
}

impl CertificateAuthority {
    /// Derive the CA keypair from `seed` via HKDF-SHA256 and self-sign the
    /// root certificate. Fails if `seed` is the documented placeholder.
    pub fn new_from_seed(seed: &[u8]) -> Result<Self, PkiError> {
        if seed == PLACEHOLDER_SEED.as_bytes() {
            return Err(PkiError::PlaceholderSeed);
        }
        if seed.len() < 16 {
            return Err(PkiError::SeedTooShort(seed.len()));
        }

        let key_pair = derive_ca_keypair(seed)?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params.key_usages.push(KeyUsagePurpose::DigitalSignature);
        params.key_usages.push(KeyUsagePurpose::KeyCertSign);
        params.key_usages.push(KeyUsagePurpose::CrlSign);
        params.not_before = past(Duration::days(1));
        params.not_after = future(Duration::days(365 * 100));

        let cert = params.clone().self_signed(&key_pair)?;
        let cert_pem = cert.pem();

        Ok(Self {
            key_pair,
            params,
            cert,
            cert_pem,
        })
    }

    /// PEM encoding of the self-signed root certificate.
    pub fn root_cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn root_cert_der(&self) -> &rcgen::Certificate {
        &self.cert
    }

    /// Parse and verify `csr_pem`, then issue a client-auth certificate
    /// copying the CSR's subject common name. The serial number is fresh
    /// (securely random) on every call, even for byte-identical CSRs, so
    /// that the password derived from the resulting certificate rotates.
    pub fn sign_csr(&self, csr_pem: &str) -> Result<String, PkiError> {
        let csr_der =
            pem::parse(csr_pem).map_err(|err| PkiError::MalformedCsr(err.to_string()))?;
        let csr_params = CertificateSigningRequestParams::from_der(&csr_der.contents().into())
            .map_err(|err| PkiError::MalformedCsr(err.to_string()))?;

        // `from_der` already verifies the CSR's embedded self-signature.
        let common_name = csr_params
            .params
            .distinguished_name
            .get(&DnType::CommonName)
            .ok_or_else(|| PkiError::MalformedCsr("missing subject common name".into()))?
            .to_string();

        let mut cert_params = CertificateParams::new(Vec::<String>::new())?;
        cert_params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        cert_params.use_authority_key_identifier_extension = true;
        cert_params
            .key_usages
            .push(KeyUsagePurpose::DigitalSignature);
        cert_params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ClientAuth);
        cert_params.not_before = past(Duration::days(1));
        cert_params.not_after = future(Duration::days(365));
        cert_params.serial_number = Some(fresh_serial().into());

        let cert = cert_params
            .signed_by(&csr_params.public_key, &self.params, &self.key_pair)
            .map_err(|_| PkiError::InvalidCsrSignature)?;

        Ok(cert.pem())
    }

    /// Issue a server-auth certificate for `host_sans`, accepting both IP
    /// literals and DNS names.
    pub fn generate_server_cert(
        &self,
        host_sans: &[String],
    ) -> Result<(String, String), PkiError> {
        let key_pair = KeyPair::generate()?;

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        for san in host_sans {
            let entry = match san.parse::<std::net::IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(Ia5String::try_from(san.as_str())?),
            };
            params.subject_alt_names.push(entry);
        }
        params
            .distinguished_name
            .push(DnType::CommonName, "otterscale-hub");
        params.use_authority_key_identifier_extension = true;
        params.key_usages.push(KeyUsagePurpose::DigitalSignature);
        params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ServerAuth);
        params.not_before = past(Duration::days(1));
        params.not_after = future(Duration::days(30));
        params.serial_number = Some(fresh_serial().into());

        let cert = params.signed_by(&key_pair, &self.params, &self.key_pair)?;

        Ok((cert.pem(), key_pair.serialize_pem()))
    }

    /// Expand the CA's private key material into an HMAC key for `label`
    /// via HKDF-SHA256, for external collaborators (e.g. manifest signing).
    pub fn derive_hmac(&self, label: &str) -> Vec<u8> {
        let hk = Hkdf::<Sha256>::new(None, &self.key_pair.serialized_der());
        let mut out = vec![0u8; 32];
        hk.expand(label.as_bytes(), &mut out)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        out
    }

    /// Deterministically hash `cert_pem`'s DER body into a printable
    /// password and return the canonical `"user:password"` auth string.
    /// Both hub and agent derive this independently from the same signed
    /// certificate, so the password never needs to travel on the wire.
    pub fn derive_auth(&self, user_id: &str, cert_pem: &str) -> String {
        let der = pem::parse(cert_pem).expect("cert_pem was produced by sign_csr");
        let mut hasher = blake3::Hasher::new();
        hasher.update(user_id.as_bytes());
        hasher.update(der.contents());
        format!("{user_id}:{}", hasher.finalize().to_hex())
    }
}

fn derive_ca_keypair(seed: &[u8]) -> Result<KeyPair, PkiError> {
    let hk = Hkdf::<Sha256>::new(None, seed);
    let mut key_bytes = [0u8; 32];
    hk.expand(CA_KEYPAIR_INFO, &mut key_bytes)
        .map_err(|err| PkiError::SeedExpansion(err.to_string()))?;

    let signing_key = SigningKey::from_bytes(&key_bytes);
    key_bytes.zeroize();
    let pkcs8_der = signing_key
        .to_pkcs8_der()
        .map_err(|err| PkiError::SeedExpansion(err.to_string()))?;

    KeyPair::try_from(pkcs8_der.as_bytes()).map_err(PkiError::Generation)
}

fn fresh_serial() -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Top bit clear so it is always interpreted as a positive ASN.1 INTEGER.
    bytes[0] &= 0x7f;
    bytes
}

fn past(duration: Duration) -> OffsetDateTime {
    OffsetDateTime::now_utc().checked_sub(duration).unwrap()
}

fn future(duration: Duration) -> OffsetDateTime {
    OffsetDateTime::now_utc().checked_add(duration).unwrap()
}

type HmacSha256 = Hmac<Sha256>;

/// Low-level helper retained for the auth-rotation test: recompute the same
/// SHA-256 HMAC primitive [`CertificateAuthority::derive_hmac`] uses, to
/// exercise the dependency directly without going through a whole CA.
#[cfg(test)]
pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("any key length is valid for HMAC");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_placeholder_seed() {
        let err = CertificateAuthority::new_from_seed(PLACEHOLDER_SEED.as_bytes());
        assert!(matches!(err, Err(PkiError::PlaceholderSeed)));
    }

    #[test]
    fn rejects_short_seed() {
        let err = CertificateAuthority::new_from_seed(b"too-short");
        assert!(matches!(err, Err(PkiError::SeedTooShort(9))));
    }

    #[test]
    fn same_seed_mutually_validates() {
        let ca_a = CertificateAuthority::new_from_seed(b"seed-one-with-enough-entropy").unwrap();
        let ca_b = CertificateAuthority::new_from_seed(b"seed-one-with-enough-entropy").unwrap();
        assert_eq!(ca_a.root_cert_pem(), ca_b.root_cert_pem());
    }

    #[test]
    fn different_seeds_diverge() {
        let ca_a = CertificateAuthority::new_from_seed(b"seed-one-with-enough-entropy").unwrap();
        let ca_b = CertificateAuthority::new_from_seed(b"seed-two-with-enough-entropy").unwrap();
        assert_ne!(ca_a.root_cert_pem(), ca_b.root_cert_pem());
    }

    #[test]
    fn hmac_derivation_is_pure() {
        let key = b"some-key-material";
        assert_eq!(hmac_sha256(key, b"a"), hmac_sha256(key, b"a"));
        assert_ne!(hmac_sha256(key, b"a"), hmac_sha256(key, b"b"));
    }

    #[test]
    fn derive_hmac_is_pure_across_instances() {
        let ca_a = CertificateAuthority::new_from_seed(b"seed-one-with-enough-entropy").unwrap();
        let ca_b = CertificateAuthority::new_from_seed(b"seed-one-with-enough-entropy").unwrap();
        assert_eq!(
            ca_a.derive_hmac("manifest-token"),
            ca_b.derive_hmac("manifest-token")
        );
        assert_ne!(
            ca_a.derive_hmac("manifest-token"),
            ca_a.derive_hmac("other-label")
        );
    }

    fn test_csr(common_name: &str) -> String {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.serialize_request(&key_pair).unwrap().pem().unwrap()
    }

    #[test]
    fn sign_csr_rejects_missing_common_name() {
        let ca = CertificateAuthority::new_from_seed(b"seed-one-with-enough-entropy").unwrap();
        let key_pair = KeyPair::generate().unwrap();
        let params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let csr_pem = params.serialize_request(&key_pair).unwrap().pem().unwrap();

        let err = ca.sign_csr(&csr_pem);
        assert!(matches!(err, Err(PkiError::MalformedCsr(_))));
    }

    #[test]
    fn sign_csr_rotates_serial_and_password() {
        let ca = CertificateAuthority::new_from_seed(b"seed-one-with-enough-entropy").unwrap();
        let csr_pem = test_csr("agent-a");

        let cert_one = ca.sign_csr(&csr_pem).unwrap();
        let cert_two = ca.sign_csr(&csr_pem).unwrap();
        assert_ne!(cert_one, cert_two);

        let auth_one = ca.derive_auth("agent-a", &cert_one);
        let auth_two = ca.derive_auth("agent-a", &cert_two);
        assert_ne!(auth_one, auth_two);
    }

    #[test]
    fn derive_auth_is_pure_given_same_cert() {
        let ca = CertificateAuthority::new_from_seed(b"seed-one-with-enough-entropy").unwrap();
        let csr_pem = test_csr("agent-a");
        let cert_pem = ca.sign_csr(&csr_pem).unwrap();

        assert_eq!(
            ca.derive_auth("agent-a", &cert_pem),
            ca.derive_auth("agent-a", &cert_pem)
        );
    }

    #[test]
    fn generate_server_cert_includes_sans() {
        let ca = CertificateAuthority::new_from_seed(b"seed-one-with-enough-entropy").unwrap();
        let (cert_pem, key_pem) = ca
            .generate_server_cert(&["127.4.9.201".to_string(), "hub.local".to_string()])
            .unwrap();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));
    }
}
