use anyhow::{anyhow, Context, Result};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

pub const TOKEN_KEY_ENV: &str = "MAILSYNC_TOKEN_KEY";
const TOKEN_KEY_BYTES: usize = 32;
const TOKEN_NONCE_BYTES: usize = 12;
const TOKEN_ENVELOPE_VERSION: u8 = 1;

/// OAuth tokens are sealed at rest when MAILSYNC_TOKEN_KEY (64 hex chars) is
/// set; otherwise they are stored as provided.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenEnvelope {
    version: u8,
    nonce_hex: String,
    ciphertext_hex: String,
}

pub fn token_key() -> Result<Option<[u8; TOKEN_KEY_BYTES]>> {
    let raw = std::env::var(TOKEN_KEY_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    raw.map(|value| parse_key_hex(&value))
        .transpose()
        .with_context(|| format!("{TOKEN_KEY_ENV} must be 64 hex characters (32 bytes)"))
}

pub fn seal_token(plaintext: &str) -> Result<String> {
    let Some(key_bytes) = token_key()? else {
        return Ok(plaintext.to_string());
    };

    let unbound_key = UnboundKey::new(&AES_256_GCM, &key_bytes)
        .map_err(|_| anyhow!("construct AES-256-GCM key"))?;
    let key = LessSafeKey::new(unbound_key);

    let mut nonce_bytes = [0u8; TOKEN_NONCE_BYTES];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| anyhow!("generate random nonce for token encryption"))?;

    let mut buffer = plaintext.as_bytes().to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut buffer,
    )
    .map_err(|_| anyhow!("encrypt token"))?;

    let envelope = TokenEnvelope {
        version: TOKEN_ENVELOPE_VERSION,
        nonce_hex: hex_encode(&nonce_bytes),
        ciphertext_hex: hex_encode(&buffer),
    };

    serde_json::to_string(&envelope).context("serialize token envelope")
}

/// Values written before the key was configured remain plaintext; anything
/// that does not parse as an envelope is returned unchanged.
pub fn open_token(stored: &str) -> Result<String> {
    let Some(key_bytes) = token_key()? else {
        return Ok(stored.to_string());
    };

    let Ok(envelope) = serde_json::from_str::<TokenEnvelope>(stored) else {
        return Ok(stored.to_string());
    };

    if envelope.version != TOKEN_ENVELOPE_VERSION {
        return Err(anyhow!(
            "unsupported token envelope version {}",
            envelope.version
        ));
    }

    let nonce_vec = hex_decode(&envelope.nonce_hex).context("decode envelope nonce")?;
    let nonce_bytes: [u8; TOKEN_NONCE_BYTES] = nonce_vec
        .try_into()
        .map_err(|_| anyhow!("invalid nonce length in token envelope"))?;
    let mut ciphertext = hex_decode(&envelope.ciphertext_hex).context("decode envelope ciphertext")?;

    let unbound_key = UnboundKey::new(&AES_256_GCM, &key_bytes)
        .map_err(|_| anyhow!("construct AES-256-GCM key"))?;
    let key = LessSafeKey::new(unbound_key);

    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut ciphertext,
        )
        .map_err(|_| anyhow!("decrypt token"))?;

    String::from_utf8(plaintext.to_vec()).context("utf8 decode decrypted token")
}

fn parse_key_hex(raw: &str) -> Result<[u8; TOKEN_KEY_BYTES]> {
    let decoded = hex_decode(raw).context("decode token key hex")?;
    decoded
        .try_into()
        .map_err(|_| anyhow!("token key must be 32 bytes"))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Result<Vec<u8>> {
    let value = raw.trim();
    if value.len() % 2 != 0 {
        return Err(anyhow!("hex string length must be even"));
    }

    let mut out = Vec::with_capacity(value.len() / 2);
    let bytes = value.as_bytes();
    let mut idx = 0usize;
    while idx < bytes.len() {
        let hi = decode_hex_nibble(bytes[idx]).ok_or_else(|| anyhow!("invalid hex digit"))?;
        let lo = decode_hex_nibble(bytes[idx + 1]).ok_or_else(|| anyhow!("invalid hex digit"))?;
        out.push((hi << 4) | lo);
        idx += 2;
    }
    Ok(out)
}

fn decode_hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
