//! Small encoding helpers shared by the API layer and the pool-facing
//! code paths.

use bitcoin::base58;

/// Escape a string for embedding in a reply.
///
/// In JSON mode only `"` and `\` need protection (the serializer handles
/// control characters); in text mode the field and section separators do.
pub fn escape_string(s: &str, json: bool) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '"' | '\\' if json => {
                out.push('\\');
                out.push(c);
            }
            ',' | '|' | '=' if !json => {
                out.push('\\');
                out.push(c);
            }
            '\\' if !json => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Decode a Base58Check address into the canonical 25-byte P2PKH script:
/// `OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG`.
pub fn address_to_pubkeyhash(addr: &str) -> Option<[u8; 25]> {
    let payload = base58::decode_check(addr).ok()?;
    // version byte + 160-bit hash
    if payload.len() != 21 {
        return None;
    }
    let mut script = [0u8; 25];
    script[0] = 0x76; // OP_DUP
    script[1] = 0xa9; // OP_HASH160
    script[2] = 0x14; // push 20
    script[3..23].copy_from_slice(&payload[1..]);
    script[23] = 0x88; // OP_EQUALVERIFY
    script[24] = 0xac; // OP_CHECKSIG
    Some(script)
}
