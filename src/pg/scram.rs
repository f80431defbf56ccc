//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677) without channel binding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const MECHANISM: &str = "SCRAM-SHA-256";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScramError {
    #[error("malformed server message")]
    Malformed,
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server signature mismatch")]
    SignatureMismatch,
    #[error("exchange out of order")]
    OutOfOrder,
}

enum Stage {
    Initial,
    Proved {
        salted_password: [u8; 32],
        auth_message: String,
    },
}

/// One SCRAM exchange.
pub struct ScramClient {
    password: String,
    client_first_bare: String,
    nonce: String,
    stage: Stage,
}

impl ScramClient {
    pub fn new(password: &str) -> Self {
        let raw: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(password, BASE64.encode(raw))
    }

    fn with_nonce(password: &str, nonce: String) -> Self {
        // The server takes the user from the startup packet, so the SCRAM
        // user name is left empty.
        Self {
            password: password.to_string(),
            client_first_bare: format!("n=,r={}", nonce),
            nonce,
            stage: Stage::Initial,
        }
    }

    /// `client-first-message`.
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Consume `server-first-message`, produce `client-final-message`.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>, ScramError> {
        if !matches!(self.stage, Stage::Initial) {
            return Err(ScramError::OutOfOrder);
        }
        let server_first = std::str::from_utf8(server_first).map_err(|_| ScramError::Malformed)?;

        let (mut nonce, mut salt, mut iterations) = (None, None, None);
        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => salt = Some(BASE64.decode(v).map_err(|_| ScramError::Malformed)?),
                Some(("i", v)) => iterations = Some(v.parse::<u32>().map_err(|_| ScramError::Malformed)?),
                _ => {}
            }
        }
        let nonce = nonce.ok_or(ScramError::Malformed)?;
        let salt = salt.ok_or(ScramError::Malformed)?;
        let iterations = iterations.ok_or(ScramError::Malformed)?;
        if !nonce.starts_with(&self.nonce) || nonce.len() == self.nonce.len() {
            return Err(ScramError::NonceMismatch);
        }

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(self.password.as_bytes(), &salt, iterations, &mut salted_password)
            .map_err(|_| ScramError::Malformed)?;

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!("{},{},{}", self.client_first_bare, server_first, without_proof);
        let signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;

        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(signature) {
            *p ^= s;
        }

        self.stage = Stage::Proved {
            salted_password,
            auth_message,
        };
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check `server-final-message`.
    pub fn verify(&self, server_final: &[u8]) -> Result<(), ScramError> {
        let Stage::Proved {
            salted_password,
            auth_message,
        } = &self.stage
        else {
            return Err(ScramError::OutOfOrder);
        };
        let server_final = std::str::from_utf8(server_final).map_err(|_| ScramError::Malformed)?;
        let verifier = server_final
            .strip_prefix("v=")
            .ok_or(ScramError::Malformed)?;
        let received = BASE64.decode(verifier).map_err(|_| ScramError::Malformed)?;

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;
        if received != expected {
            return Err(ScramError::SignatureMismatch);
        }
        Ok(())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::Malformed)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}
