//! MediaTek Secure Loader Authentication (SLA).
//!
//! On SLA-fused devices the BROM refuses a DA upload until the host
//! proves possession of the OEM's RSA private key. The proof is a
//! PKCS#1 v1.5 RSA-SHA256 signature over a device-derived challenge:
//!
//! - v1: the 16-byte ME-ID
//! - v2: ME-ID followed by the 32-byte SOC-ID
//! - v3: same concatenation, valid once at least 16 bytes long
//!
//! The version is carried in bits 24..27 of the target-config flag word,
//! floored at 1. Key material lives only inside one authenticator
//! instance; the underlying RSA key zeroes itself on drop.

use log::info;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::mediatek::brom::BromClient;
use crate::transport::Transport;

/// A composed SLA challenge awaiting signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaChallenge {
    /// Challenge bytes to sign.
    pub challenge: Vec<u8>,
    /// SLA version the challenge was composed for.
    pub version: u32,
}

/// SLA authenticator holding the signing key and optional certificate.
#[derive(Default)]
pub struct SlaAuthenticator {
    private_key: Option<RsaPrivateKey>,
    certificate: Option<Vec<u8>>,
}

impl SlaAuthenticator {
    /// Create an empty authenticator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a PEM-encoded RSA private key (PKCS#8 or PKCS#1).
    pub fn load_private_key(&mut self, pem_data: &[u8]) -> Result<()> {
        if pem_data.is_empty() {
            return Err(Error::KeyLoad("empty private key data".to_string()));
        }

        let pem = Zeroizing::new(String::from_utf8_lossy(pem_data).into_owned());
        if !pem.contains("-----BEGIN") || !pem.contains("PRIVATE KEY-----") {
            return Err(Error::KeyLoad(
                "invalid PEM format for private key".to_string(),
            ));
        }

        let key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|e| Error::KeyLoad(format!("cannot parse RSA private key: {e}")))?;

        self.private_key = Some(key);
        info!("Private key loaded successfully");
        Ok(())
    }

    /// Load a DA certificate blob to be sent ahead of the signature.
    pub fn load_certificate(&mut self, cert_data: &[u8]) -> Result<()> {
        if cert_data.is_empty() {
            return Err(Error::KeyLoad("empty certificate data".to_string()));
        }
        self.certificate = Some(cert_data.to_vec());
        info!("DA certificate loaded successfully");
        Ok(())
    }

    /// True when a private key has been loaded.
    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// True when a certificate has been loaded.
    pub fn has_certificate(&self) -> bool {
        self.certificate.is_some()
    }

    /// Compose the challenge for an SLA version from the device IDs.
    pub fn build_challenge(version: u32, me_id: &[u8], soc_id: &[u8]) -> Result<SlaChallenge> {
        let (challenge, valid) = match version {
            0 | 1 => (me_id.to_vec(), !me_id.is_empty()),
            2 => {
                let mut c = me_id.to_vec();
                c.extend_from_slice(soc_id);
                (c, !me_id.is_empty())
            }
            _ => {
                let mut c = me_id.to_vec();
                c.extend_from_slice(soc_id);
                let valid = c.len() >= 16;
                (c, valid)
            }
        };

        if !valid {
            return Err(Error::AuthenticationFailed(format!(
                "SLA v{version} challenge unavailable (me_id {} bytes, soc_id {} bytes)",
                me_id.len(),
                soc_id.len()
            )));
        }

        info!("SLA v{version} challenge: {} bytes", challenge.len());
        Ok(SlaChallenge {
            challenge,
            version: version.max(1),
        })
    }

    /// RSA-SHA256 sign a challenge with the loaded private key.
    ///
    /// The signature length equals the key's modulus size.
    pub fn sign_challenge(&self, challenge: &[u8]) -> Result<Vec<u8>> {
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| Error::KeyLoad("no private key loaded".to_string()))?;

        let signing_key = SigningKey::<Sha256>::new(key.clone());
        let signature = signing_key
            .try_sign(challenge)
            .map_err(|e| Error::AuthenticationFailed(format!("signing failed: {e}")))?;
        Ok(signature.to_vec())
    }

    /// Run the full authentication flow against a BROM session.
    ///
    /// Reads the target config to determine the SLA version, collects
    /// ME-ID (and SOC-ID for v2+), signs the composed challenge and
    /// sends certificate (when loaded) followed by the signature.
    pub fn authenticate<T: Transport>(&self, brom: &mut BromClient<'_, T>) -> Result<()> {
        if self.private_key.is_none() {
            return Err(Error::KeyLoad("no private key loaded".to_string()));
        }

        info!("Starting SLA authentication...");

        let config = brom.get_target_config()?;
        let version = if config.sla_enabled {
            config.sla_version()
        } else {
            1
        };

        let me_id = brom.get_me_id()?;
        let soc_id = if version >= 2 {
            brom.get_soc_id()?
        } else {
            Vec::new()
        };

        let challenge = Self::build_challenge(version, &me_id, &soc_id)?;
        let signature = self.sign_challenge(&challenge.challenge)?;

        if let Some(cert) = self.certificate.clone() {
            brom.send_cert(&cert).map_err(reject)?;
        }
        brom.send_auth(&signature).map_err(reject)?;

        info!("SLA authentication successful");
        Ok(())
    }
}

/// Fold a BROM status error into the authentication failure domain.
fn reject(err: Error) -> Error {
    match err {
        Error::Protocol(msg) => {
            Error::AuthenticationFailed(format!("device rejected SLA response: {msg}"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediatek::brom::{cmd, STATUS_CONT, STATUS_OK};
    use crate::transport::mock::{ScriptedTransport, Step};
    use rsa::pkcs8::EncodePrivateKey;

    fn test_key() -> (RsaPrivateKey, String) {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let pem = key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        (key, pem)
    }

    #[test]
    fn test_rejects_non_pem_key() {
        let mut auth = SlaAuthenticator::new();
        let err = auth.load_private_key(b"not a key").unwrap_err();
        assert!(matches!(err, Error::KeyLoad(_)));
        assert!(!auth.has_private_key());
    }

    #[test]
    fn test_challenge_v1_is_me_id() {
        let me_id = [0x11u8; 16];
        let challenge = SlaAuthenticator::build_challenge(1, &me_id, &[]).unwrap();
        assert_eq!(challenge.challenge, me_id);
    }

    #[test]
    fn test_challenge_v2_concatenates_ids() {
        let me_id: Vec<u8> = (0x01..=0x10).collect();
        let soc_id: Vec<u8> = (0x20..=0x3F).collect();
        let challenge = SlaAuthenticator::build_challenge(2, &me_id, &soc_id).unwrap();
        assert_eq!(challenge.challenge.len(), 48);
        assert_eq!(&challenge.challenge[..16], &me_id[..]);
        assert_eq!(&challenge.challenge[16..], &soc_id[..]);
    }

    #[test]
    fn test_challenge_v2_requires_me_id() {
        let err = SlaAuthenticator::build_challenge(2, &[], &[0x01; 32]).unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }

    #[test]
    fn test_challenge_v3_requires_16_bytes() {
        assert!(SlaAuthenticator::build_challenge(3, &[0x01; 8], &[0x02; 8]).is_ok());
        assert!(SlaAuthenticator::build_challenge(3, &[0x01; 8], &[]).is_err());
    }

    #[test]
    fn test_signature_length_equals_modulus() {
        let (_, pem) = test_key();
        let mut auth = SlaAuthenticator::new();
        auth.load_private_key(pem.as_bytes()).unwrap();

        let signature = auth.sign_challenge(&[0x42; 48]).unwrap();
        assert_eq!(signature.len(), 128); // 1024-bit key
    }

    #[test]
    fn test_authenticate_v2_full_flow() {
        let (key, pem) = test_key();
        let mut auth = SlaAuthenticator::new();
        auth.load_private_key(pem.as_bytes()).unwrap();

        let me_id: Vec<u8> = (0x01..=0x10).collect();
        let soc_id: Vec<u8> = (0x20..=0x3F).collect();

        // PKCS#1 v1.5 signatures are deterministic, so the transcript
        // can carry the exact bytes the engine must produce
        let mut challenge = me_id.clone();
        challenge.extend_from_slice(&soc_id);
        let expected_sig = SigningKey::<Sha256>::new(key)
            .try_sign(&challenge)
            .unwrap()
            .to_vec();

        let script = vec![
            // get_target_config: flags 0x02000002 -> SLA enabled, v2
            Step::Expect(vec![cmd::GET_TARGET_CONFIG]),
            Step::Respond(vec![cmd::GET_TARGET_CONFIG]),
            Step::Respond(0x02000002u32.to_be_bytes().to_vec()),
            Step::Respond(STATUS_OK.to_be_bytes().to_vec()),
            // get_me_id
            Step::Expect(vec![cmd::GET_ME_ID]),
            Step::Respond(vec![cmd::GET_ME_ID]),
            Step::Respond(16u32.to_be_bytes().to_vec()),
            Step::Respond(me_id),
            Step::Respond(STATUS_OK.to_be_bytes().to_vec()),
            // get_soc_id
            Step::Expect(vec![cmd::GET_SOC_ID]),
            Step::Respond(vec![cmd::GET_SOC_ID]),
            Step::Respond(32u32.to_be_bytes().to_vec()),
            Step::Respond(soc_id),
            Step::Respond(STATUS_OK.to_be_bytes().to_vec()),
            // send_auth with the signature
            Step::Expect(vec![cmd::SEND_AUTH]),
            Step::Respond(vec![cmd::SEND_AUTH]),
            Step::Expect((expected_sig.len() as u32).to_be_bytes().to_vec()),
            Step::Respond((expected_sig.len() as u32).to_be_bytes().to_vec()),
            Step::Respond(STATUS_CONT.to_be_bytes().to_vec()),
            Step::Expect(expected_sig.clone()),
            Step::Respond(expected_sig),
            Step::Respond(STATUS_OK.to_be_bytes().to_vec()),
        ];

        let mut transport = ScriptedTransport::new(script);
        let mut brom = BromClient::new(&mut transport);
        auth.authenticate(&mut brom).unwrap();
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_authenticate_without_key_fails_fast() {
        let auth = SlaAuthenticator::new();
        let mut transport = ScriptedTransport::new(Vec::new());
        let mut brom = BromClient::new(&mut transport);
        let err = auth.authenticate(&mut brom).unwrap_err();
        assert!(matches!(err, Error::KeyLoad(_)));
    }
}
