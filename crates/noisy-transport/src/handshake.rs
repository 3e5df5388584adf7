//! Per-peer Noise IKpsk2 handshake state.
//!
//! ```text
//! Initiator                                   Responder
//!   e, es, s, ss, {timestamp}      ------>
//!                                  <------    e, ee, se, psk, {}
//! ```
//!
//! The state here is pure: index allocation, MACs and sending are done by
//! the peer that owns it. Only one attempt is live at a time; creating a new
//! initiation replaces any earlier ephemeral key.

use std::time::Instant;

use noisy_core::{
    MessageInitiation, MessageResponse, HANDSHAKE_INITIATION_RATE, NOISE_PUBLIC_KEY_SIZE,
};
use noisy_crypto::{
    NoisePresharedKey, NoisePrivateKey, NoisePublicKey, SymmetricState, Timestamp,
};
use zeroize::Zeroize;

use crate::error::HandshakeError;
use crate::keypair::Keypair;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Zeroed,
    InitiationCreated,
    InitiationConsumed,
    ResponseCreated,
    ResponseConsumed,
}

pub struct Handshake {
    state: HandshakeState,
    symmetric: SymmetricState,
    local_ephemeral: Option<NoisePrivateKey>,
    remote_ephemeral: NoisePublicKey,
    remote_static: NoisePublicKey,
    precomputed_static_static: Option<[u8; 32]>,
    preshared_key: NoisePresharedKey,
    pub(crate) local_index: u32,
    pub(crate) remote_index: u32,
    last_timestamp: Timestamp,
    last_initiation_consumption: Option<Instant>,
    pub(crate) last_sent_handshake: Option<Instant>,
}

/// An initiation whose outer layer has been decrypted with the local static
/// key. The sender's identity is known but nothing peer-specific has been
/// checked yet.
pub struct DecryptedInitiation {
    symmetric: SymmetricState,
    pub remote_static: NoisePublicKey,
    sender: u32,
    ephemeral: NoisePublicKey,
    timestamp: [u8; 28],
}

impl Handshake {
    pub fn new(local: Option<&NoisePrivateKey>, remote_static: NoisePublicKey) -> Self {
        Self {
            state: HandshakeState::Zeroed,
            symmetric: SymmetricState::new(),
            local_ephemeral: None,
            remote_ephemeral: NoisePublicKey::default(),
            remote_static,
            precomputed_static_static: local.and_then(|k| k.shared_secret(&remote_static).ok()),
            preshared_key: NoisePresharedKey::default(),
            local_index: 0,
            remote_index: 0,
            last_timestamp: Timestamp::default(),
            last_initiation_consumption: None,
            last_sent_handshake: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn remote_static(&self) -> &NoisePublicKey {
        &self.remote_static
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn has_ephemeral(&self) -> bool {
        self.local_ephemeral.is_some()
    }

    /// Recompute the static-static secret after the local identity changed.
    pub fn set_static_identity(&mut self, local: Option<&NoisePrivateKey>) {
        if let Some(mut old) = self.precomputed_static_static.take() {
            old.zeroize();
        }
        self.precomputed_static_static =
            local.and_then(|k| k.shared_secret(&self.remote_static).ok());
    }

    pub fn set_preshared_key(&mut self, psk: NoisePresharedKey) {
        self.preshared_key = psk;
    }

    /// Build an initiation tagged with `sender_index`.
    pub fn create_initiation(
        &mut self,
        local: &NoisePrivateKey,
        sender_index: u32,
    ) -> Result<MessageInitiation, HandshakeError> {
        let Some(static_static) = self.precomputed_static_static else {
            return Err(HandshakeError::InvalidPublicKey);
        };

        let mut symmetric = SymmetricState::new();
        symmetric.mix_hash(self.remote_static.as_bytes());

        let ephemeral = NoisePrivateKey::generate();
        let ephemeral_public = ephemeral.public_key();
        symmetric.mix_key(ephemeral_public.as_bytes());
        symmetric.mix_hash(ephemeral_public.as_bytes());

        // es
        let mut ss = ephemeral.shared_secret(&self.remote_static)?;
        let mut key = symmetric.mix_key_with_output(&ss);
        ss.zeroize();
        let static_ct = symmetric.encrypt_and_hash(&key, local.public_key().as_bytes());
        key.zeroize();
        let static_ct = static_ct?;

        // ss
        let mut key = symmetric.mix_key_with_output(&static_static);
        let timestamp_ct = symmetric.encrypt_and_hash(&key, Timestamp::now().as_bytes());
        key.zeroize();
        let timestamp_ct = timestamp_ct?;

        let mut msg = MessageInitiation {
            sender: sender_index,
            ephemeral: *ephemeral_public.as_bytes(),
            static_key: [0u8; 48],
            timestamp: [0u8; 28],
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        msg.static_key.copy_from_slice(&static_ct);
        msg.timestamp.copy_from_slice(&timestamp_ct);

        self.symmetric = symmetric;
        self.local_ephemeral = Some(ephemeral);
        self.local_index = sender_index;
        self.state = HandshakeState::InitiationCreated;
        Ok(msg)
    }

    /// Finish consuming an initiation addressed to this peer: check the
    /// static-static layer, the timestamp and the flood guard, then adopt
    /// the transcript.
    pub fn accept_initiation(
        &mut self,
        decrypted: DecryptedInitiation,
        now: Instant,
    ) -> Result<(), HandshakeError> {
        if !decrypted.remote_static.equals(&self.remote_static) {
            return Err(HandshakeError::UnknownPeer);
        }
        let Some(static_static) = self.precomputed_static_static else {
            return Err(HandshakeError::InvalidPublicKey);
        };

        let DecryptedInitiation {
            mut symmetric,
            sender,
            ephemeral,
            timestamp,
            ..
        } = decrypted;

        let mut key = symmetric.mix_key_with_output(&static_static);
        let opened = symmetric.decrypt_and_hash(&key, &timestamp);
        key.zeroize();
        let opened = opened?;
        let mut raw = [0u8; 12];
        raw.copy_from_slice(&opened);
        let timestamp = Timestamp::from_bytes(raw);

        if !timestamp.after(&self.last_timestamp) {
            return Err(HandshakeError::Replay);
        }
        if let Some(last) = self.last_initiation_consumption {
            if now.saturating_duration_since(last) <= HANDSHAKE_INITIATION_RATE {
                return Err(HandshakeError::Flood);
            }
        }

        self.symmetric = symmetric;
        self.remote_index = sender;
        self.remote_ephemeral = ephemeral;
        self.last_timestamp = timestamp;
        self.last_initiation_consumption = Some(now);
        self.state = HandshakeState::InitiationConsumed;
        Ok(())
    }

    /// Answer a consumed initiation. The response is sent from `sender_index`.
    pub fn create_response(
        &mut self,
        sender_index: u32,
    ) -> Result<MessageResponse, HandshakeError> {
        if self.state != HandshakeState::InitiationConsumed {
            return Err(HandshakeError::WrongState);
        }

        let mut symmetric = self.symmetric.clone();
        let ephemeral = NoisePrivateKey::generate();
        let ephemeral_public = ephemeral.public_key();
        symmetric.mix_hash(ephemeral_public.as_bytes());
        symmetric.mix_key(ephemeral_public.as_bytes());

        // ee
        let mut ss = ephemeral.shared_secret(&self.remote_ephemeral)?;
        symmetric.mix_key(&ss);
        ss.zeroize();
        // se
        let mut ss = ephemeral.shared_secret(&self.remote_static)?;
        symmetric.mix_key(&ss);
        ss.zeroize();

        let mut key = symmetric.mix_key_and_hash(self.preshared_key.as_bytes());
        let empty = symmetric.encrypt_and_hash(&key, &[]);
        key.zeroize();
        let empty = empty?;

        let mut msg = MessageResponse {
            sender: sender_index,
            receiver: self.remote_index,
            ephemeral: *ephemeral_public.as_bytes(),
            empty: [0u8; 16],
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        msg.empty.copy_from_slice(&empty);

        self.symmetric = symmetric;
        self.local_ephemeral = None;
        self.local_index = sender_index;
        self.state = HandshakeState::ResponseCreated;
        Ok(msg)
    }

    /// Consume the response to our initiation.
    pub fn consume_response(
        &mut self,
        local: &NoisePrivateKey,
        msg: &MessageResponse,
    ) -> Result<(), HandshakeError> {
        if self.state != HandshakeState::InitiationCreated {
            return Err(HandshakeError::WrongState);
        }
        if msg.receiver != self.local_index {
            return Err(HandshakeError::IndexMismatch);
        }
        let Some(ephemeral) = self.local_ephemeral.as_ref() else {
            return Err(HandshakeError::WrongState);
        };

        let remote_ephemeral = NoisePublicKey::from_bytes(msg.ephemeral);
        let mut symmetric = self.symmetric.clone();
        symmetric.mix_hash(&msg.ephemeral);
        symmetric.mix_key(&msg.ephemeral);

        // ee
        let mut ss = ephemeral.shared_secret(&remote_ephemeral)?;
        symmetric.mix_key(&ss);
        ss.zeroize();
        // se
        let mut ss = local.shared_secret(&remote_ephemeral)?;
        symmetric.mix_key(&ss);
        ss.zeroize();

        let mut key = symmetric.mix_key_and_hash(self.preshared_key.as_bytes());
        let opened = symmetric.decrypt_and_hash(&key, &msg.empty);
        key.zeroize();
        opened?;

        self.symmetric = symmetric;
        self.remote_index = msg.sender;
        self.state = HandshakeState::ResponseConsumed;
        Ok(())
    }

    /// Derive the session keypair and reset the handshake. The caller
    /// rebinds the returned keypair's local index in the index table.
    pub fn begin_session(&mut self) -> Result<Keypair, HandshakeError> {
        let (first, second) = self.symmetric.split();
        let (mut send, mut receive, is_initiator) = match self.state {
            HandshakeState::ResponseConsumed => (first, second, true),
            HandshakeState::ResponseCreated => (second, first, false),
            _ => return Err(HandshakeError::WrongState),
        };

        let keypair = Keypair::new(
            send,
            receive,
            is_initiator,
            self.local_index,
            self.remote_index,
        );
        send.zeroize();
        receive.zeroize();

        self.symmetric = SymmetricState::new();
        self.local_ephemeral = None;
        self.local_index = 0;
        self.state = HandshakeState::Zeroed;
        Ok(keypair)
    }

    /// Forget any attempt in progress. Returns the index it held, if any.
    pub fn clear(&mut self) -> u32 {
        self.symmetric = SymmetricState::new();
        self.local_ephemeral = None;
        self.remote_ephemeral = NoisePublicKey::default();
        self.remote_index = 0;
        self.state = HandshakeState::Zeroed;
        std::mem::take(&mut self.local_index)
    }
}

impl Drop for Handshake {
    fn drop(&mut self) {
        if let Some(ss) = self.precomputed_static_static.as_mut() {
            ss.zeroize();
        }
    }
}

/// First phase of consuming an initiation: decrypt the initiator's static
/// key using only the local identity, so the peer can be looked up.
pub fn decrypt_initiation(
    local: &NoisePrivateKey,
    msg: &MessageInitiation,
) -> Result<DecryptedInitiation, HandshakeError> {
    let ephemeral = NoisePublicKey::from_bytes(msg.ephemeral);

    let mut symmetric = SymmetricState::new();
    symmetric.mix_hash(local.public_key().as_bytes());
    symmetric.mix_hash(&msg.ephemeral);
    symmetric.mix_key(&msg.ephemeral);

    // es
    let mut ss = local.shared_secret(&ephemeral)?;
    let mut key = symmetric.mix_key_with_output(&ss);
    ss.zeroize();
    let opened = symmetric.decrypt_and_hash(&key, &msg.static_key);
    key.zeroize();
    let opened = opened?;

    let mut remote = [0u8; NOISE_PUBLIC_KEY_SIZE];
    remote.copy_from_slice(&opened);

    Ok(DecryptedInitiation {
        symmetric,
        remote_static: NoisePublicKey::from_bytes(remote),
        sender: msg.sender,
        ephemeral,
        timestamp: msg.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Pair {
        a_key: NoisePrivateKey,
        b_key: NoisePrivateKey,
        a: Handshake,
        b: Handshake,
    }

    fn pair() -> Pair {
        let a_key = NoisePrivateKey::generate();
        let b_key = NoisePrivateKey::generate();
        let a = Handshake::new(Some(&a_key), b_key.public_key());
        let b = Handshake::new(Some(&b_key), a_key.public_key());
        Pair { a_key, b_key, a, b }
    }

    fn complete(p: &mut Pair, now: Instant) -> (Keypair, Keypair) {
        let init = p.a.create_initiation(&p.a_key, 11).unwrap();
        let decrypted = decrypt_initiation(&p.b_key, &init).unwrap();
        assert!(decrypted.remote_static.equals(&p.a_key.public_key()));
        p.b.accept_initiation(decrypted, now).unwrap();

        let resp = p.b.create_response(22).unwrap();
        assert_eq!(resp.receiver, 11);
        p.a.consume_response(&p.a_key, &resp).unwrap();

        (p.a.begin_session().unwrap(), p.b.begin_session().unwrap())
    }

    #[test]
    fn test_both_sides_derive_matching_keys() {
        let mut p = pair();
        let (ka, kb) = complete(&mut p, Instant::now());

        assert!(ka.is_initiator());
        assert!(!kb.is_initiator());
        assert_eq!(ka.local_index(), 11);
        assert_eq!(ka.remote_index(), 22);
        assert_eq!(kb.local_index(), 22);
        assert_eq!(kb.remote_index(), 11);

        let mut buf = *b"abc";
        let tag = ka.seal(0, &mut buf).unwrap();
        kb.open(0, &mut buf, &tag).unwrap();
        assert_eq!(&buf, b"abc");

        let mut buf = *b"reply";
        let tag = kb.seal(0, &mut buf).unwrap();
        ka.open(0, &mut buf, &tag).unwrap();
        assert_eq!(&buf, b"reply");

        assert_eq!(p.a.state(), HandshakeState::Zeroed);
        assert_eq!(p.b.state(), HandshakeState::Zeroed);
        assert_eq!(p.a.local_index(), 0);
    }

    #[test]
    fn test_preshared_key_must_match() {
        let mut p = pair();
        let psk = NoisePresharedKey::from_bytes([7u8; 32]);
        p.a.set_preshared_key(psk.clone());
        p.b.set_preshared_key(psk);
        complete(&mut p, Instant::now());

        let mut p = pair();
        p.b.set_preshared_key(NoisePresharedKey::from_bytes([8u8; 32]));
        let init = p.a.create_initiation(&p.a_key, 1).unwrap();
        let decrypted = decrypt_initiation(&p.b_key, &init).unwrap();
        p.b.accept_initiation(decrypted, Instant::now()).unwrap();
        let resp = p.b.create_response(2).unwrap();
        assert!(matches!(
            p.a.consume_response(&p.a_key, &resp),
            Err(HandshakeError::Crypto(_))
        ));
    }

    #[test]
    fn test_second_initiation_replaces_first() {
        let mut p = pair();
        let first = p.a.create_initiation(&p.a_key, 1).unwrap();
        let second = p.a.create_initiation(&p.a_key, 2).unwrap();
        assert_ne!(first.ephemeral, second.ephemeral);
        assert_eq!(p.a.local_index(), 2);

        // A response to the abandoned attempt cannot complete.
        let decrypted = decrypt_initiation(&p.b_key, &first).unwrap();
        p.b.accept_initiation(decrypted, Instant::now()).unwrap();
        let resp = p.b.create_response(5).unwrap();
        assert_eq!(
            p.a.consume_response(&p.a_key, &resp),
            Err(HandshakeError::IndexMismatch)
        );
        let mut forged = resp;
        forged.receiver = 2;
        assert!(p.a.consume_response(&p.a_key, &forged).is_err());
    }

    #[test]
    fn test_replayed_initiation_rejected() {
        let mut p = pair();
        let init = p.a.create_initiation(&p.a_key, 1).unwrap();
        let now = Instant::now();

        let decrypted = decrypt_initiation(&p.b_key, &init).unwrap();
        p.b.accept_initiation(decrypted, now).unwrap();

        let decrypted = decrypt_initiation(&p.b_key, &init).unwrap();
        assert_eq!(
            p.b.accept_initiation(decrypted, now + Duration::from_secs(1)),
            Err(HandshakeError::Replay)
        );
    }

    #[test]
    fn test_initiation_flood_rejected() {
        let mut p = pair();
        let now = Instant::now();

        let first = p.a.create_initiation(&p.a_key, 1).unwrap();
        let decrypted = decrypt_initiation(&p.b_key, &first).unwrap();
        p.b.accept_initiation(decrypted, now).unwrap();

        // TAI64N carries whitened nanoseconds; make sure the second stamp is newer.
        std::thread::sleep(Duration::from_millis(20));
        let second = p.a.create_initiation(&p.a_key, 2).unwrap();
        let decrypted = decrypt_initiation(&p.b_key, &second).unwrap();
        assert_eq!(
            p.b.accept_initiation(decrypted, now + Duration::from_millis(10)),
            Err(HandshakeError::Flood)
        );

        let decrypted = decrypt_initiation(&p.b_key, &second).unwrap();
        p.b
            .accept_initiation(decrypted, now + HANDSHAKE_INITIATION_RATE * 2)
            .unwrap();
    }

    #[test]
    fn test_initiation_for_other_responder_fails() {
        let mut p = pair();
        let stranger = NoisePrivateKey::generate();
        let init = p.a.create_initiation(&p.a_key, 1).unwrap();
        assert!(decrypt_initiation(&stranger, &init).is_err());
    }

    #[test]
    fn test_wrong_state_transitions() {
        let mut p = pair();
        assert_eq!(p.b.create_response(1).unwrap_err(), HandshakeError::WrongState);
        assert!(p.a.begin_session().is_err());

        let init = p.a.create_initiation(&p.a_key, 1).unwrap();
        assert!(p.a.begin_session().is_err());

        p.a.clear();
        assert!(!p.a.has_ephemeral());
        let decrypted = decrypt_initiation(&p.b_key, &init).unwrap();
        p.b.accept_initiation(decrypted, Instant::now()).unwrap();
        let resp = p.b.create_response(2).unwrap();
        assert_eq!(
            p.a.consume_response(&p.a_key, &resp),
            Err(HandshakeError::WrongState)
        );
    }

    #[test]
    fn test_missing_identity_cannot_initiate() {
        let a_key = NoisePrivateKey::generate();
        let mut hs = Handshake::new(None, NoisePrivateKey::generate().public_key());
        assert_eq!(
            hs.create_initiation(&a_key, 1).unwrap_err(),
            HandshakeError::InvalidPublicKey
        );
        hs.set_static_identity(Some(&a_key));
        hs.create_initiation(&a_key, 1).unwrap();
    }
}
