//! Link handshake
//!
//! Both sides send a `Hello` as their first frame and then read the peer's:
//! [1: type] [N: bincode Hello]
//!
//! The hello carries the node identity key with its CA signature and a fresh
//! X25519 ephemeral key signed by the identity key. The link key is derived
//! from the ephemeral exchange.

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::cipher::SessionCipher;
use super::credentials::Credentials;
use super::{Link, FRAME_HELLO};
use crate::addr::PeerSignature;
use crate::error::{Error, Result};
use crate::transport::Transport;

const PROTOCOL_VERSION: u8 = 1;

/// How peer credentials are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Reject peers whose credentials do not verify
    Enforce,
    /// Log verification failures and continue
    Warn,
    /// Skip verification
    Disabled,
}

impl AuthMode {
    pub fn from_flags(auth: bool, ignore_auth: bool) -> Self {
        match (auth, ignore_auth) {
            (false, _) => AuthMode::Disabled,
            (true, true) => AuthMode::Warn,
            (true, false) => AuthMode::Enforce,
        }
    }
}

/// Options for one handshake and the link it produces
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    pub encrypt: bool,
    pub auth: AuthMode,
    pub timeout: Duration,
    /// Sent to the peer for logging (clients only)
    pub attestation: Option<Vec<u8>>,
    /// Keepalive period while idle
    pub keepalive: Duration,
    /// Close the link after this long without any inbound frame
    pub idle_timeout: Duration,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            encrypt: true,
            auth: AuthMode::Enforce,
            timeout: Duration::from_secs(10),
            attestation: None,
            keepalive: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(45),
        }
    }
}

/// Outcome of a handshake attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeResult {
    Successful,
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Hello {
    version: u8,
    identity: [u8; 32],
    ca_signature: Vec<u8>,
    ephemeral: [u8; 32],
    ephemeral_signature: Vec<u8>,
    encrypt: bool,
    attestation: Option<Vec<u8>>,
}

/// What we learned about the peer from its hello
struct PeerHello {
    signature: PeerSignature,
    attestation: Option<Vec<u8>>,
    cipher: Option<SessionCipher>,
}

/// Run the handshake over `transport` and start the link on success
pub async fn handshake(
    mut transport: Transport,
    credentials: &Credentials,
    options: &HandshakeOptions,
) -> Result<Link> {
    let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let hello = Hello {
        version: PROTOCOL_VERSION,
        identity: credentials.verifying_key().to_bytes(),
        ca_signature: credentials.signature.to_bytes().to_vec(),
        ephemeral: ephemeral_public.to_bytes(),
        ephemeral_signature: credentials
            .signing_key
            .sign(ephemeral_public.as_bytes())
            .to_bytes()
            .to_vec(),
        encrypt: options.encrypt,
        attestation: options.attestation.clone(),
    };

    let body = bincode::serialize(&hello)?;
    let mut frame = BytesMut::with_capacity(1 + body.len());
    frame.put_u8(FRAME_HELLO);
    frame.extend_from_slice(&body);

    let exchange = async {
        transport.writer.write_frame(frame.freeze()).await?;
        read_hello(&mut transport).await
    };

    let peer = match timeout(options.timeout, exchange).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(Error::Handshake(format!(
                "no hello from {} within {:?}",
                transport.remote, options.timeout
            )))
        }
    };

    let peer = accept_hello(&hello, peer, ephemeral, credentials, options)?;
    tracing::debug!(
        "Handshake with {} complete (signature {}, encrypted: {})",
        transport.remote,
        peer.signature,
        peer.cipher.is_some()
    );

    Ok(Link::start(transport, peer.signature, peer.attestation, peer.cipher, options))
}

async fn read_hello(transport: &mut Transport) -> Result<Hello> {
    loop {
        let frame = transport
            .reader
            .read_frame()
            .await?
            .ok_or_else(|| Error::Handshake("peer closed the transport during handshake".into()))?;

        match frame.first() {
            Some(&FRAME_HELLO) => return Ok(bincode::deserialize(&frame[1..])?),
            _ => tracing::trace!("Ignoring {} byte frame before hello", frame.len()),
        }
    }
}

fn accept_hello(
    ours: &Hello,
    peer: Hello,
    ephemeral: EphemeralSecret,
    credentials: &Credentials,
    options: &HandshakeOptions,
) -> Result<PeerHello> {
    if peer.version != PROTOCOL_VERSION {
        return Err(Error::Handshake(format!(
            "protocol version mismatch (ours {}, peer {})",
            PROTOCOL_VERSION, peer.version
        )));
    }

    if peer.encrypt != ours.encrypt {
        return Err(Error::Handshake(format!(
            "encryption mismatch (ours {}, peer {})",
            ours.encrypt, peer.encrypt
        )));
    }

    if options.auth != AuthMode::Disabled {
        if let Err(reason) = verify_peer(&peer, credentials) {
            match options.auth {
                AuthMode::Enforce => return Err(Error::Handshake(reason)),
                _ => tracing::warn!("Ignoring authentication failure: {}", reason),
            }
        }
    }

    let signature = if peer.ca_signature.is_empty() {
        PeerSignature::new(peer.identity.to_vec())
    } else {
        PeerSignature::new(peer.ca_signature.clone())
    };

    let cipher = if ours.encrypt {
        let shared = ephemeral.diffie_hellman(&PublicKey::from(peer.ephemeral));
        Some(SessionCipher::derive(shared.as_bytes(), &ours.ephemeral, &peer.ephemeral))
    } else {
        None
    };

    Ok(PeerHello {
        signature,
        attestation: peer.attestation,
        cipher,
    })
}

fn verify_peer(peer: &Hello, credentials: &Credentials) -> std::result::Result<(), String> {
    let identity = VerifyingKey::from_bytes(&peer.identity)
        .map_err(|e| format!("peer identity key is invalid: {}", e))?;

    let ca_signature = Signature::from_slice(&peer.ca_signature)
        .map_err(|e| format!("peer CA signature is malformed: {}", e))?;
    credentials
        .ca
        .verify(&peer.identity, &ca_signature)
        .map_err(|_| "peer key is not signed by our certificate authority".to_string())?;

    let ephemeral_signature = Signature::from_slice(&peer.ephemeral_signature)
        .map_err(|e| format!("peer ephemeral signature is malformed: {}", e))?;
    identity
        .verify(&peer.ephemeral, &ephemeral_signature)
        .map_err(|_| "peer ephemeral key signature does not verify".to_string())?;

    Ok(())
}

/// Classify a handshake outcome for logging
pub fn classify<T>(result: &Result<T>) -> HandshakeResult {
    match result {
        Ok(_) => HandshakeResult::Successful,
        Err(e) => HandshakeResult::Failed(e.to_string()),
    }
}
