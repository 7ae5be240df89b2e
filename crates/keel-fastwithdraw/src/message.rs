// crates/keel-fastwithdraw/src/message.rs
//
// Wire format of fast-withdraw messages.
//
// The relay envelope mirrors the bridge's finalize-withdrawal call and is a
// fixed-width big-endian concatenation:
//
//   target(20) | sender(20) | l1_token(20) | l2_token(20) | from(20) | to(20)
//   | amount(16) | nonce(8) | request(11)
//
// The request starts with a one-byte version tag. Two layouts exist and are
// not interchangeable:
//
//   V0 (legacy):    0x00 | deadline(4) | fee_rate_bps(2) | layer_index(4)
//   V1 (canonical): 0x01 | fee_rate_bps(2) | deadline(4) | layer_index(4)
//
// The message key is SHA-256 of the whole envelope.

use std::fmt;

use serde::{Deserialize, Serialize};

use keel_core::crypto::hash_bytes;
use keel_core::{Address, Amount, FwStatus, LayerIndex, MessageKey};
use keel_economics::registry::LayerRegistry;

/// Fee rates are expressed in basis points of this denominator.
pub const FEE_RATE_DENOMINATOR: u16 = 10_000;

/// Encoded request length, tag included. Identical for every version.
pub const REQUEST_LEN: usize = 11;

/// Envelope length without the request.
pub const ENVELOPE_FIXED_LEN: usize = 6 * 20 + 16 + 8;

pub const ENVELOPE_LEN: usize = ENVELOPE_FIXED_LEN + REQUEST_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestVersion {
    V0,
    V1,
}

impl RequestVersion {
    pub fn tag(&self) -> u8 {
        match self {
            RequestVersion::V0 => 0,
            RequestVersion::V1 => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(RequestVersion::V0),
            1 => Some(RequestVersion::V1),
            _ => None,
        }
    }
}

/// The withdrawal-intent fields the requester signs up for on the secondary layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub version: RequestVersion,
    pub fee_rate_bps: u16,
    /// Unix seconds after which liquidity can no longer be provided.
    pub deadline: u32,
    pub layer_index: LayerIndex,
}

impl WithdrawRequest {
    /// A request in the canonical layout.
    pub fn new(fee_rate_bps: u16, deadline: u32, layer_index: LayerIndex) -> Self {
        Self {
            version: RequestVersion::V1,
            fee_rate_bps,
            deadline,
            layer_index,
        }
    }

    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut out = [0u8; REQUEST_LEN];
        out[0] = self.version.tag();
        match self.version {
            RequestVersion::V0 => {
                out[1..5].copy_from_slice(&self.deadline.to_be_bytes());
                out[5..7].copy_from_slice(&self.fee_rate_bps.to_be_bytes());
            }
            RequestVersion::V1 => {
                out[1..3].copy_from_slice(&self.fee_rate_bps.to_be_bytes());
                out[3..7].copy_from_slice(&self.deadline.to_be_bytes());
            }
        }
        out[7..11].copy_from_slice(&self.layer_index.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FwStatus> {
        let tag = *bytes.first().ok_or(FwStatus::Malformed)?;
        let version = RequestVersion::from_tag(tag).ok_or(FwStatus::UnknownVersion)?;
        if bytes.len() != REQUEST_LEN {
            return Err(FwStatus::Malformed);
        }
        let (fee_rate_bps, deadline) = match version {
            RequestVersion::V0 => decode_v0(&bytes[1..7]),
            RequestVersion::V1 => decode_v1(&bytes[1..7]),
        };
        Ok(Self {
            version,
            fee_rate_bps,
            deadline,
            layer_index: read_u32(&bytes[7..11]),
        })
    }
}

fn decode_v0(body: &[u8]) -> (u16, u32) {
    (read_u16(&body[4..6]), read_u32(&body[0..4]))
}

fn decode_v1(body: &[u8]) -> (u16, u32) {
    (read_u16(&body[0..2]), read_u32(&body[2..6]))
}

fn read_u16(bytes: &[u8]) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(bytes);
    u16::from_be_bytes(buf)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

fn read_address(bytes: &[u8]) -> Address {
    let mut buf = [0u8; 20];
    buf.copy_from_slice(bytes);
    Address(buf)
}

/// The bridge relay call carrying a withdrawal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Base-layer bridge the relay is addressed to.
    pub target: Address,
    /// Secondary-layer bridge that sent the message.
    pub sender: Address,
    pub l1_token: Address,
    pub l2_token: Address,
    /// The requester.
    pub from: Address,
    /// Where the bridge releases the funds; must be the fast-withdraw account.
    pub to: Address,
    pub amount: Amount,
    pub nonce: u64,
    pub request: WithdrawRequest,
}

impl RelayEnvelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_LEN);
        for address in [
            &self.target,
            &self.sender,
            &self.l1_token,
            &self.l2_token,
            &self.from,
            &self.to,
        ] {
            out.extend_from_slice(address.as_bytes());
        }
        out.extend_from_slice(&self.amount.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.request.encode());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FwStatus> {
        if bytes.len() <= ENVELOPE_FIXED_LEN {
            return Err(FwStatus::Malformed);
        }
        let request = WithdrawRequest::decode(&bytes[ENVELOPE_FIXED_LEN..])?;
        let mut amount = [0u8; 16];
        amount.copy_from_slice(&bytes[120..136]);
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&bytes[136..144]);
        Ok(Self {
            target: read_address(&bytes[0..20]),
            sender: read_address(&bytes[20..40]),
            l1_token: read_address(&bytes[40..60]),
            l2_token: read_address(&bytes[60..80]),
            from: read_address(&bytes[80..100]),
            to: read_address(&bytes[100..120]),
            amount: u128::from_be_bytes(amount),
            nonce: u64::from_be_bytes(nonce),
            request,
        })
    }

    pub fn key(&self) -> MessageKey {
        MessageKey(hash_bytes(&self.encode()))
    }
}

/// A relayed payload together with the key the bridge reported for it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayedMessage {
    pub key: MessageKey,
    pub payload: Vec<u8>,
}

impl RelayedMessage {
    pub fn new(key: MessageKey, payload: Vec<u8>) -> Self {
        Self { key, payload }
    }

    /// Wrap raw bytes, deriving the key from them.
    pub fn from_payload(payload: Vec<u8>) -> Self {
        let key = MessageKey(hash_bytes(&payload));
        Self { key, payload }
    }

    pub fn from_envelope(envelope: &RelayEnvelope) -> Self {
        Self::from_payload(envelope.encode())
    }
}

impl fmt::Debug for RelayedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayedMessage")
            .field("key", &self.key)
            .field("payload", &hex::encode(&self.payload))
            .finish()
    }
}

/// A validated withdrawal message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WithdrawMessage {
    pub key: MessageKey,
    pub envelope: RelayEnvelope,
}

impl WithdrawMessage {
    pub fn requestor(&self) -> Address {
        self.envelope.from
    }

    pub fn amount(&self) -> Amount {
        self.envelope.amount
    }

    pub fn fee_rate_bps(&self) -> u16 {
        self.envelope.request.fee_rate_bps
    }

    pub fn deadline(&self) -> u64 {
        self.envelope.request.deadline as u64
    }

    pub fn layer_index(&self) -> LayerIndex {
        self.envelope.request.layer_index
    }

    pub fn version(&self) -> RequestVersion {
        self.envelope.request.version
    }

    pub fn nonce(&self) -> u64 {
        self.envelope.nonce
    }

    /// `floor(amount * fee_rate_bps / 10000)`.
    pub fn fee(&self) -> Amount {
        let denominator = FEE_RATE_DENOMINATOR as Amount;
        let rate = self.fee_rate_bps() as Amount;
        let amount = self.amount();
        (amount / denominator) * rate + (amount % denominator) * rate / denominator
    }

    /// What a liquidity provider pays the requester: `amount - fee`.
    pub fn provide_amount(&self) -> Amount {
        self.amount() - self.fee()
    }

    /// Decode and check a relayed message against the layer registry.
    ///
    /// Each rejection reason has its own status, checked in this order:
    /// `Malformed`, `UnknownVersion`, `HashMismatch`, `InvalidLayerIndex`,
    /// `ZeroAmount`, `UnknownLayer`, `BridgeMismatch`, `WrongTarget`,
    /// `FeeTooHigh`.
    pub fn validate(
        message: &RelayedMessage,
        registry: &LayerRegistry,
        receipt_account: &Address,
    ) -> Result<Self, FwStatus> {
        let envelope = RelayEnvelope::decode(&message.payload)?;
        if MessageKey(hash_bytes(&message.payload)) != message.key {
            return Err(FwStatus::HashMismatch);
        }
        let request = envelope.request;
        if request.layer_index == 0 {
            return Err(FwStatus::InvalidLayerIndex);
        }
        if envelope.amount == 0 {
            return Err(FwStatus::ZeroAmount);
        }
        let identity = registry
            .sequencer(request.layer_index)
            .ok()
            .and_then(|record| record.identity.as_ref())
            .ok_or(FwStatus::UnknownLayer)?;
        if envelope.sender != identity.l2_bridge || envelope.target != identity.l1_bridge {
            return Err(FwStatus::BridgeMismatch);
        }
        if envelope.to != *receipt_account {
            return Err(FwStatus::WrongTarget);
        }
        if request.fee_rate_bps > FEE_RATE_DENOMINATOR {
            return Err(FwStatus::FeeTooHigh);
        }
        Ok(Self {
            key: message.key,
            envelope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::traits::SequencerAttestation;
    use keel_economics::params::ProtocolParams;
    use keel_economics::registry::SequencerIdentity;
    use keel_economics::token::InMemoryToken;
    use keel_core::traits::TokenLedger;
    use proptest::prelude::*;

    struct Attest(Address);

    impl SequencerAttestation for Attest {
        fn attested_sequencer(&self, _address_manager: &Address) -> Option<Address> {
            Some(self.0)
        }
    }

    fn identity() -> SequencerIdentity {
        SequencerIdentity {
            name: "layer".to_string(),
            address_manager: Address::from_label("am"),
            l1_bridge: Address::from_label("l1-bridge"),
            l2_bridge: Address::from_label("l2-bridge"),
            l2_token: Address::from_label("l2-token"),
        }
    }

    fn registry() -> LayerRegistry {
        let vault = Address::from_label("keel/registry-vault");
        let seq = Address::from_label("sequencer");
        let params = ProtocolParams {
            minimum_deposit_for_sequencer: 100,
            ..ProtocolParams::default()
        };
        let mut registry = LayerRegistry::new(vault, &params);
        let mut token = InMemoryToken::new();
        token.mint(&seq, 100).unwrap();
        token.approve(&seq, &vault, 100);
        registry
            .create_sequencer(&Attest(seq), &mut token, &seq, identity(), 100)
            .unwrap();
        registry
    }

    fn receipt_account() -> Address {
        Address::from_label("keel/fast-withdraw")
    }

    fn envelope(amount: Amount, fee_rate_bps: u16, layer: LayerIndex) -> RelayEnvelope {
        RelayEnvelope {
            target: identity().l1_bridge,
            sender: identity().l2_bridge,
            l1_token: Address::from_label("l1-token"),
            l2_token: identity().l2_token,
            from: Address::from_label("requestor"),
            to: receipt_account(),
            amount,
            nonce: 0,
            request: WithdrawRequest::new(fee_rate_bps, 1_700_000_000, layer),
        }
    }

    fn validate(env: &RelayEnvelope) -> Result<WithdrawMessage, FwStatus> {
        WithdrawMessage::validate(&RelayedMessage::from_envelope(env), &registry(), &receipt_account())
    }

    #[test]
    fn test_request_layouts_differ() {
        let v1 = WithdrawRequest::new(1_000, 0x0102_0304, 7);
        let v0 = WithdrawRequest {
            version: RequestVersion::V0,
            ..v1
        };
        assert_eq!(v1.encode(), [1, 0x03, 0xe8, 1, 2, 3, 4, 0, 0, 0, 7]);
        assert_eq!(v0.encode(), [0, 1, 2, 3, 4, 0x03, 0xe8, 0, 0, 0, 7]);
        assert_eq!(WithdrawRequest::decode(&v0.encode()).unwrap(), v0);
        assert_eq!(WithdrawRequest::decode(&v1.encode()).unwrap(), v1);
    }

    #[test]
    fn test_request_decode_failures() {
        assert_eq!(WithdrawRequest::decode(&[]), Err(FwStatus::Malformed));
        assert_eq!(WithdrawRequest::decode(&[9; 11]), Err(FwStatus::UnknownVersion));
        assert_eq!(WithdrawRequest::decode(&[1; 10]), Err(FwStatus::Malformed));
    }

    #[test]
    fn test_envelope_layout() {
        let env = envelope(500, 1_000, 1);
        let bytes = env.encode();
        assert_eq!(bytes.len(), ENVELOPE_LEN);
        assert_eq!(&bytes[0..20], env.target.as_bytes());
        assert_eq!(&bytes[120..136], &500u128.to_be_bytes());
        assert_eq!(RelayEnvelope::decode(&bytes).unwrap(), env);
        assert_eq!(RelayedMessage::from_envelope(&env).key, env.key());
    }

    #[test]
    fn test_valid_message_and_fee() {
        let msg = validate(&envelope(500, 1_000, 1)).unwrap();
        assert_eq!(msg.fee(), 50);
        assert_eq!(msg.provide_amount(), 450);
        assert_eq!(msg.requestor(), Address::from_label("requestor"));
        assert_eq!(msg.version(), RequestVersion::V1);
    }

    #[test]
    fn test_each_rejection_is_distinguishable() {
        assert_eq!(validate(&envelope(500, 0, 0)), Err(FwStatus::InvalidLayerIndex));
        assert_eq!(validate(&envelope(0, 0, 1)), Err(FwStatus::ZeroAmount));
        assert_eq!(validate(&envelope(500, 0, 2)), Err(FwStatus::UnknownLayer));
        assert_eq!(validate(&envelope(500, 10_001, 1)), Err(FwStatus::FeeTooHigh));

        let foreign = RelayEnvelope {
            sender: Address::from_label("other-bridge"),
            ..envelope(500, 0, 1)
        };
        assert_eq!(validate(&foreign), Err(FwStatus::BridgeMismatch));

        let misrouted = RelayEnvelope {
            to: Address::from_label("someone"),
            ..envelope(500, 0, 1)
        };
        assert_eq!(validate(&misrouted), Err(FwStatus::WrongTarget));
    }

    #[test]
    fn test_structural_rejections() {
        let env = envelope(500, 0, 1);
        let reg = registry();

        let tampered = RelayedMessage::new(env.key(), {
            let mut bytes = env.encode();
            bytes[130] ^= 1;
            bytes
        });
        assert_eq!(
            WithdrawMessage::validate(&tampered, &reg, &receipt_account()),
            Err(FwStatus::HashMismatch)
        );

        let truncated = RelayedMessage::from_payload(env.encode()[..100].to_vec());
        assert_eq!(
            WithdrawMessage::validate(&truncated, &reg, &receipt_account()),
            Err(FwStatus::Malformed)
        );

        let mut unknown = env.encode();
        unknown[ENVELOPE_FIXED_LEN] = 7;
        assert_eq!(
            WithdrawMessage::validate(&RelayedMessage::from_payload(unknown), &reg, &receipt_account()),
            Err(FwStatus::UnknownVersion)
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_fee_never_exceeds_amount(amount in any::<u128>(), rate in 0u16..=10_000) {
            let mut env = envelope(1, rate, 1);
            env.amount = amount;
            let msg = WithdrawMessage { key: env.key(), envelope: env };
            prop_assert!(msg.fee() <= amount);
            prop_assert_eq!(msg.fee() + msg.provide_amount(), amount);
        }
    }
}
