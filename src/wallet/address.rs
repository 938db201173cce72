use base64::{Engine as _, engine::general_purpose};

use super::WalletError;

const FRIENDLY_LEN: usize = 36;
const BOUNCEABLE: u8 = 0x11;
const NON_BOUNCEABLE: u8 = 0x51;
const TESTNET: u8 = 0x80;

/// CRC-16/XMODEM, the checksum closing a user-friendly address.
fn crc16(data: &[u8]) -> u16 {
    let mut reg: u16 = 0;
    for byte in data {
        reg ^= (*byte as u16) << 8;
        for _ in 0..8 {
            reg = if reg & 0x8000 != 0 {
                (reg << 1) ^ 0x1021
            } else {
                reg << 1
            };
        }
    }
    reg
}

fn check_friendly(raw: &str) -> Result<(), WalletError> {
    let bytes = general_purpose::URL_SAFE
        .decode(raw)
        .or_else(|_| general_purpose::STANDARD.decode(raw))
        .map_err(|e| WalletError::Address(format!("`{raw}` is not base64: {e}")))?;
    if bytes.len() != FRIENDLY_LEN {
        return Err(WalletError::Address(format!(
            "`{raw}` decodes to {} bytes, expected {FRIENDLY_LEN}",
            bytes.len()
        )));
    }
    let tag = bytes[0] & !TESTNET;
    if tag != BOUNCEABLE && tag != NON_BOUNCEABLE {
        return Err(WalletError::Address(format!("`{raw}` has unknown tag {:#04x}", bytes[0])));
    }
    let expected = u16::from_be_bytes([bytes[34], bytes[35]]);
    if crc16(&bytes[..34]) != expected {
        return Err(WalletError::Address(format!("`{raw}` fails its checksum")));
    }
    Ok(())
}

fn check_raw(raw: &str, workchain: &str, hash: &str) -> Result<(), WalletError> {
    workchain
        .parse::<i32>()
        .map_err(|_| WalletError::Address(format!("`{raw}` has a bad workchain")))?;
    match hex::decode(hash) {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        _ => Err(WalletError::Address(format!("`{raw}` needs a 64 digit hex account id"))),
    }
}

/// Accept `workchain:hex` or the 48 character user-friendly form.
pub fn validate_address(raw: &str) -> Result<(), WalletError> {
    match raw.split_once(':') {
        Some((workchain, hash)) => check_raw(raw, workchain, hash),
        None => check_friendly(raw),
    }
}
