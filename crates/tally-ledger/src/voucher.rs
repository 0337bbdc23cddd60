//! Voucher codec: deterministic serialization plus a keyed MAC.
//!
//! A voucher is an opaque, self-describing string carrying a transfer
//! offer from one user to another. The payload is pipe-delimited with
//! free-text fields base64-encoded, the MAC is `blake3::keyed_hash` over
//! the full payload, and the whole frame is base64url-encoded so callers
//! never see the structure.
//!
//! Expiry is NOT validated here; expired items are filtered by the ledger
//! at redemption.

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use base64::Engine;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

use tally_common::{TallyError, TallyResult, UserId};

use crate::types::TransferItem;

const VERSION: &str = "1";

/// Transfer offer carried inside a voucher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherData {
    /// Giver identity.
    pub giver_id: UserId,
    pub giver_name: String,
    pub giver_phone: String,
    pub giver_github: String,

    /// Receiver the voucher is addressed to.
    pub receiver_id: UserId,

    /// Transferred (amount, expiry) items. Never empty.
    pub items: Vec<TransferItem>,
}

/// Encoder/verifier bound to the process-wide symmetric signing key.
///
/// The key is initialized at startup and immutable afterwards.
pub struct VoucherCodec {
    key: [u8; 32],
}

impl std::fmt::Debug for VoucherCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoucherCodec").finish_non_exhaustive()
    }
}

impl VoucherCodec {
    /// Build a codec from a raw 32-byte key.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Build a codec from the hex-encoded key in configuration.
    pub fn from_hex(hex_key: &Secret<String>) -> TallyResult<Self> {
        let hex = hex_key.expose_secret();
        let bytes = decode_hex(hex)
            .ok_or_else(|| TallyError::Configuration("voucher key is not valid hex".to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TallyError::Configuration("voucher key must be 32 bytes".to_string()))?;
        Ok(Self { key })
    }

    /// Serialize, sign, and frame a voucher.
    pub fn encode(&self, data: &VoucherData) -> TallyResult<String> {
        if data.items.is_empty() {
            return Err(TallyError::InvalidInput(
                "voucher must carry at least one item".to_string(),
            ));
        }
        for item in &data.items {
            if item.amount <= 0 {
                return Err(TallyError::InvalidInput(
                    "voucher item amount must be positive".to_string(),
                ));
            }
        }

        let payload = self.payload(data);
        let mac = blake3::keyed_hash(&self.key, payload.as_bytes());
        let framed = format!("{payload}|{}", mac.to_hex());
        Ok(B64.encode(framed.as_bytes()))
    }

    /// Verify and decode a voucher. Every tamper or malformation collapses
    /// to the single `VoucherInvalid` kind.
    pub fn decode(&self, code: &str) -> TallyResult<VoucherData> {
        let framed_bytes = B64
            .decode(code.trim())
            .map_err(|_| TallyError::VoucherInvalid)?;
        let framed = String::from_utf8(framed_bytes).map_err(|_| TallyError::VoucherInvalid)?;

        let (payload, mac_hex) = framed.rsplit_once('|').ok_or(TallyError::VoucherInvalid)?;
        let expected = blake3::keyed_hash(&self.key, payload.as_bytes());
        let presented =
            blake3::Hash::from_hex(mac_hex).map_err(|_| TallyError::VoucherInvalid)?;
        // blake3::Hash equality is constant-time.
        if presented != expected {
            return Err(TallyError::VoucherInvalid);
        }

        self.parse_payload(payload)
    }

    fn payload(&self, data: &VoucherData) -> String {
        let items = data
            .items
            .iter()
            .map(|item| format!("{}:{}", item.amount, item.expiry_date.timestamp()))
            .collect::<Vec<_>>()
            .join(",");

        format!(
            "{VERSION}|{}|{}|{}|{}|{}|{}",
            data.giver_id.as_uuid(),
            B64.encode(data.giver_name.as_bytes()),
            B64.encode(data.giver_phone.as_bytes()),
            B64.encode(data.giver_github.as_bytes()),
            data.receiver_id.as_uuid(),
            items,
        )
    }

    fn parse_payload(&self, payload: &str) -> TallyResult<VoucherData> {
        let fields: Vec<&str> = payload.split('|').collect();
        let [version, giver_id, giver_name, giver_phone, giver_github, receiver_id, items] =
            fields[..]
        else {
            return Err(TallyError::VoucherInvalid);
        };
        if version != VERSION {
            return Err(TallyError::VoucherInvalid);
        }

        let items = items
            .split(',')
            .map(parse_item)
            .collect::<Option<Vec<_>>>()
            .ok_or(TallyError::VoucherInvalid)?;
        if items.is_empty() {
            return Err(TallyError::VoucherInvalid);
        }

        Ok(VoucherData {
            giver_id: parse_user(giver_id)?,
            giver_name: decode_text(giver_name)?,
            giver_phone: decode_text(giver_phone)?,
            giver_github: decode_text(giver_github)?,
            receiver_id: parse_user(receiver_id)?,
            items,
        })
    }
}

fn parse_user(s: &str) -> TallyResult<UserId> {
    s.parse().map_err(|_| TallyError::VoucherInvalid)
}

fn decode_text(s: &str) -> TallyResult<String> {
    let bytes = B64.decode(s).map_err(|_| TallyError::VoucherInvalid)?;
    String::from_utf8(bytes).map_err(|_| TallyError::VoucherInvalid)
}

fn parse_item(s: &str) -> Option<TransferItem> {
    let (amount, expiry) = s.split_once(':')?;
    let amount: i64 = amount.parse().ok()?;
    let expiry: i64 = expiry.parse().ok()?;
    let expiry: DateTime<Utc> = DateTime::from_timestamp(expiry, 0)?;
    Some(TransferItem::new(amount, expiry))
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}
