//! Ledger primitives: secp256k1 keys, address derivation, RLP, legacy
//! transaction signing (EIP-155), and the token contract ABI surface.
//!
//! Everything here is pure; the network half lives in [`crate::chain`].

use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha3::{Digest, Keccak256};

use crate::error::{Error, Result};
use crate::types::{Address, Receipt, Secret, TransferEvent};

/// Keccak-256 digest.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

// ============ Keys ============

/// Generate a fresh key pair: 0x-prefixed hex secret plus its address.
pub fn generate_keypair() -> (Secret, Address) {
    let signing_key = SigningKey::random(&mut OsRng);
    let secret = Secret::new(format!("0x{}", hex::encode(signing_key.to_bytes())));
    let address = address_from_key(signing_key.verifying_key());
    (secret, address)
}

/// Parse a 0x-prefixed (or bare) 32-byte hex secret into a signing key.
pub fn parse_secret(secret: &str) -> Result<SigningKey> {
    let stripped = secret.trim().strip_prefix("0x").unwrap_or(secret.trim());
    let bytes = hex::decode(stripped).map_err(|_| Error::Config("malformed private key".into()))?;
    SigningKey::from_slice(&bytes).map_err(|_| Error::Config("malformed private key".into()))
}

/// Deterministic address of a secret: keccak of the uncompressed public key,
/// last 20 bytes.
pub fn address_of(secret: &str) -> Result<Address> {
    let signing_key = parse_secret(secret)?;
    Ok(address_from_key(signing_key.verifying_key()))
}

fn address_from_key(key: &VerifyingKey) -> Address {
    let encoded = key.to_encoded_point(false);
    // Skip the 0x04 uncompressed-point marker.
    let digest = keccak256(&encoded.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..]);
    Address(out)
}

// ============ RLP ============

/// Minimal big-endian bytes of an integer (empty for zero), as RLP wants.
fn be_trimmed(value: u128) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

fn rlp_length_prefix(len: usize, short_offset: u8) -> Vec<u8> {
    if len <= 55 {
        vec![short_offset + len as u8]
    } else {
        let len_bytes = be_trimmed(len as u128);
        let mut out = vec![short_offset + 55 + len_bytes.len() as u8];
        out.extend_from_slice(&len_bytes);
        out
    }
}

/// RLP-encode a byte string.
fn rlp_bytes(data: &[u8]) -> Vec<u8> {
    if data.len() == 1 && data[0] < 0x80 {
        return data.to_vec();
    }
    let mut out = rlp_length_prefix(data.len(), 0x80);
    out.extend_from_slice(data);
    out
}

fn rlp_uint(value: u128) -> Vec<u8> {
    rlp_bytes(&be_trimmed(value))
}

/// RLP-encode a list of already-encoded items.
fn rlp_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload_len: usize = items.iter().map(Vec::len).sum();
    let mut out = rlp_length_prefix(payload_len, 0xc0);
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

// ============ Legacy transaction ============

/// A pre-EIP-1559 transaction with a flat gas price, matching what the
/// configured ledger accepts.
#[derive(Debug, Clone)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub value: u128,
    pub data: Vec<u8>,
}

impl LegacyTransaction {
    fn base_fields(&self) -> Vec<Vec<u8>> {
        vec![
            rlp_uint(self.nonce.into()),
            rlp_uint(self.gas_price),
            rlp_uint(self.gas_limit.into()),
            match self.to {
                Some(addr) => rlp_bytes(addr.as_bytes()),
                None => rlp_bytes(&[]),
            },
            rlp_uint(self.value),
            rlp_bytes(&self.data),
        ]
    }

    /// Sign per EIP-155 and return the raw bytes ready for submission.
    pub fn sign(&self, secret: &str, chain_id: u64) -> Result<Vec<u8>> {
        let signing_key = parse_secret(secret)?;

        let mut fields = self.base_fields();
        fields.push(rlp_uint(chain_id.into()));
        fields.push(rlp_uint(0));
        fields.push(rlp_uint(0));
        let sighash = keccak256(&rlp_list(&fields));

        let (signature, recovery_id) = signing_key
            .sign_prehash_recoverable(&sighash)
            .map_err(|e| Error::Rpc(format!("signing failed: {e}")))?;
        let v = chain_id * 2 + 35 + u64::from(recovery_id.to_byte());

        let mut signed = self.base_fields();
        signed.push(rlp_uint(v.into()));
        signed.push(rlp_bytes(&strip_leading_zeros(&signature.r().to_bytes())));
        signed.push(rlp_bytes(&strip_leading_zeros(&signature.s().to_bytes())));
        Ok(rlp_list(&signed))
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

// ============ Token contract ABI ============

fn selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

fn abi_word_address(addr: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(addr.as_bytes());
    word
}

fn abi_word_uint(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Call data for `transfer(address,uint256)`.
pub fn encode_transfer(to: Address, amount: u128) -> Vec<u8> {
    let mut data = selector("transfer(address,uint256)").to_vec();
    data.extend_from_slice(&abi_word_address(to));
    data.extend_from_slice(&abi_word_uint(amount));
    data
}

/// Call data for `buyTokens(address)` with the referrer to attribute.
pub fn encode_buy_tokens(referrer: Address) -> Vec<u8> {
    let mut data = selector("buyTokens(address)").to_vec();
    data.extend_from_slice(&abi_word_address(referrer));
    data
}

/// Call data for the read-only `balanceOf(address)`.
pub fn encode_balance_of(owner: Address) -> Vec<u8> {
    let mut data = selector("balanceOf(address)").to_vec();
    data.extend_from_slice(&abi_word_address(owner));
    data
}

/// Topic hash of `Transfer(address,address,uint256)`.
pub fn transfer_event_topic() -> [u8; 32] {
    keccak256(b"Transfer(address,address,uint256)")
}

/// Decode the first token `Transfer` event emitted by the configured
/// contract, if the receipt carries one.
pub fn decode_transfer(receipt: &Receipt, token_contract: Address) -> Option<TransferEvent> {
    let topic = format!("0x{}", hex::encode(transfer_event_topic()));
    receipt
        .logs
        .iter()
        .filter(|log| log.address == token_contract)
        .find(|log| log.topics.first().map(String::as_str) == Some(topic.as_str()))
        .and_then(|log| {
            let from = address_from_topic(log.topics.get(1)?)?;
            let to = address_from_topic(log.topics.get(2)?)?;
            let value = uint_from_word(&log.data)?;
            Some(TransferEvent { from, to, value })
        })
}

fn address_from_topic(topic: &str) -> Option<Address> {
    let stripped = topic.strip_prefix("0x").unwrap_or(topic);
    let bytes = hex::decode(stripped).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes[12..]);
    Some(Address(out))
}

/// Parse a 32-byte ABI word as u128; values beyond 128 bits are not
/// representable and yield `None`.
pub(crate) fn uint_from_word(data: &str) -> Option<u128> {
    let stripped = data.strip_prefix("0x").unwrap_or(data);
    let bytes = hex::decode(stripped).ok()?;
    if bytes.len() != 32 || bytes[..16].iter().any(|&b| b != 0) {
        return None;
    }
    let mut word = [0u8; 16];
    word.copy_from_slice(&bytes[16..]);
    Some(u128::from_be_bytes(word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogEntry;

    #[test]
    fn keccak_empty_input() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn address_of_known_secret() {
        // Reference key pair from the web3.js documentation.
        let addr = address_of("0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318")
            .unwrap();
        assert_eq!(
            addr.to_checksum(),
            "0x2c7536E3605D9C16a7a3D7b1898e529396a65c23"
        );
    }

    #[test]
    fn generated_keypair_is_consistent() {
        let (secret, address) = generate_keypair();
        assert_eq!(address_of(secret.expose()).unwrap(), address);
    }

    #[test]
    fn rlp_vectors() {
        assert_eq!(rlp_bytes(b"dog"), vec![0x83, b'd', b'o', b'g']);
        assert_eq!(rlp_bytes(b""), vec![0x80]);
        assert_eq!(rlp_bytes(&[0x0f]), vec![0x0f]);
        assert_eq!(rlp_uint(0), vec![0x80]);
        assert_eq!(rlp_uint(1024), vec![0x82, 0x04, 0x00]);
        assert_eq!(
            rlp_list(&[rlp_bytes(b"cat"), rlp_bytes(b"dog")]),
            vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g']
        );
        // Long-form string: 56 bytes needs a length-of-length prefix.
        let long = vec![0xaa; 56];
        let encoded = rlp_bytes(&long);
        assert_eq!(&encoded[..2], &[0xb8, 56]);
        assert_eq!(encoded.len(), 58);
    }

    #[test]
    fn abi_selectors() {
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
        assert_eq!(hex::encode(selector("balanceOf(address)")), "70a08231");
        assert_eq!(
            hex::encode(transfer_event_topic()),
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn transfer_call_data_layout() {
        let to: Address = "0x2c7536E3605D9C16a7a3D7b1898e529396a65c23".parse().unwrap();
        let data = encode_transfer(to, 10);
        assert_eq!(data.len(), 4 + 32 + 32);
        assert_eq!(&data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(&data[16..36], to.as_bytes());
        assert_eq!(data[67], 10);
    }

    #[test]
    fn eip155_reference_transaction() {
        // The worked example from the EIP-155 specification.
        let tx = LegacyTransaction {
            nonce: 9,
            gas_price: 20_000_000_000,
            gas_limit: 21_000,
            to: Some("0x3535353535353535353535353535353535353535".parse().unwrap()),
            value: 1_000_000_000_000_000_000,
            data: vec![],
        };
        let secret = format!("0x{}", "46".repeat(32));
        let raw = tx.sign(&secret, 1).unwrap();
        assert_eq!(
            hex::encode(raw),
            "f86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83"
        );
    }

    #[test]
    fn decode_transfer_reads_first_matching_log() {
        let token: Address = "0x3535353535353535353535353535353535353535".parse().unwrap();
        let from: Address = "0x2c7536E3605D9C16a7a3D7b1898e529396a65c23".parse().unwrap();
        let to: Address = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap();
        let receipt = Receipt {
            transaction_hash: "0x00000000000000000000000000000000000000000000000000000000000000aa"
                .parse()
                .unwrap(),
            status: Some("0x1".into()),
            logs: vec![LogEntry {
                address: token,
                topics: vec![
                    format!("0x{}", hex::encode(transfer_event_topic())),
                    format!("0x000000000000000000000000{}", hex::encode(from.as_bytes())),
                    format!("0x000000000000000000000000{}", hex::encode(to.as_bytes())),
                ],
                data: format!("0x{:064x}", 10u128),
            }],
        };
        let event = decode_transfer(&receipt, token).unwrap();
        assert_eq!(event, TransferEvent { from, to, value: 10 });

        // Logs from other contracts are ignored.
        let other: Address = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap();
        assert!(decode_transfer(&receipt, other).is_none());
    }

    #[test]
    fn decode_transfer_none_without_logs() {
        let token: Address = "0x3535353535353535353535353535353535353535".parse().unwrap();
        let receipt = Receipt {
            transaction_hash: "0x00000000000000000000000000000000000000000000000000000000000000aa"
                .parse()
                .unwrap(),
            status: Some("0x1".into()),
            logs: vec![],
        };
        assert!(decode_transfer(&receipt, token).is_none());
    }
}
