// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of concurrent.
//
// concurrent is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// concurrent is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with concurrent.  If not,
// see <http://www.gnu.org/licenses/>.

//! # Signatures & addresses
//!
//! Every mutation in concurrent is a JSON document signed with a secp256k1 key. Signatures are
//! "recoverable" (65 bytes: `r || s || v`, hex-encoded), so verification never needs the public
//! key itself: we recover it from the signature & the digest, derive an address from it, and
//! compare that with the address the document claims.
//!
//! There are two address schemes:
//!
//! - bech32: `con1...` (accounts), `cck1...` (subkeys) & `ccs1...` (domains); the payload is
//!   `ripemd160(sha256(compressed public key))`, and documents are digested with SHA-256
//! - legacy: `CC` (accounts) or `CK` (subkeys) followed by forty hex digits, the trailing twenty
//!   bytes of `keccak256(uncompressed public key)`; documents are digested with Keccak-256
//!
//! The scheme is detected from the address prefix.

use bech32::{Bech32, Hrp};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use snafu::{Backtrace, prelude::*};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to bech32-encode an address: {source}"))]
    Bech32Encode {
        source: bech32::EncodeError,
        backtrace: Backtrace,
    },
    #[snafu(display("{hrp} is not a valid human-readable part: {source}"))]
    Hrp {
        hrp: String,
        source: bech32::primitives::hrp::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to hex-decode {what}: {source}"))]
    Hex {
        what: &'static str,
        source: hex::FromHexError,
        backtrace: Backtrace,
    },
    #[snafu(display("Invalid private key: {source}"))]
    PrivateKey {
        source: k256::ecdsa::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to recover a public key from the signature: {source}"))]
    Recover {
        source: k256::ecdsa::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{v} is not a valid recovery id"))]
    RecoveryByte { v: u8, backtrace: Backtrace },
    #[snafu(display("Failed to sign: {source}"))]
    Sign {
        source: k256::ecdsa::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Malformed signature: {source}"))]
    SignatureFormat {
        source: k256::ecdsa::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Signatures are 65 bytes; got {len}"))]
    SignatureLength { len: usize, backtrace: Backtrace },
    #[snafu(display("The signature was produced by {actual}, not {expected}"))]
    SignerMismatch {
        expected: String,
        actual: String,
        backtrace: Backtrace,
    },
    #[snafu(display("{address} is not a recognized address"))]
    UnknownScheme {
        address: String,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            digests                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           addresses                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Address schemes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scheme {
    /// `con1`, `cck1`, `ccs1`, ...; the human-readable part is carried along
    Bech32(&'static str),
    /// `CC...` or `CK...`; the two-character prefix is carried along
    Legacy(&'static str),
}

impl Scheme {
    pub fn of(address: &str) -> Result<Scheme> {
        for hrp in ["con", "cck", "ccs"] {
            if address.len() > 4 && address.starts_with(hrp) && address[3..].starts_with('1') {
                return Ok(Scheme::Bech32(hrp));
            }
        }
        for prefix in ["CC", "CK"] {
            if address.len() == 42 && address.starts_with(prefix) {
                return Ok(Scheme::Legacy(prefix));
            }
        }
        UnknownSchemeSnafu { address }.fail()
    }
    /// The digest over which signatures are computed in this scheme
    pub fn digest(&self, data: &[u8]) -> [u8; 32] {
        match self {
            Scheme::Bech32(_) => sha256(data),
            Scheme::Legacy(_) => keccak256(data),
        }
    }
    /// The address, in this scheme, of the public key `key`
    pub fn address(&self, key: &VerifyingKey) -> Result<String> {
        match self {
            Scheme::Bech32(hrp) => {
                let compressed = key.to_encoded_point(true);
                let hash160 = Ripemd160::digest(Sha256::digest(compressed.as_bytes()));
                bech32::encode::<Bech32>(
                    Hrp::parse(hrp).context(HrpSnafu { hrp: *hrp })?,
                    hash160.as_slice(),
                )
                .context(Bech32EncodeSnafu)
            }
            Scheme::Legacy(prefix) => {
                let uncompressed = key.to_encoded_point(false);
                let hash = keccak256(&uncompressed.as_bytes()[1..]);
                Ok(format!("{}{}", prefix, hex::encode(&hash[12..])))
            }
        }
    }
}

fn signing_key(private_key: &str) -> Result<SigningKey> {
    let bytes = hex::decode(private_key.trim_start_matches("0x")).context(HexSnafu {
        what: "private key",
    })?;
    SigningKey::from_slice(&bytes).context(PrivateKeySnafu)
}

/// Derive the address in `scheme` owned by the hex-encoded secp256k1 private key `private_key`
pub fn derive_address(private_key: &str, scheme: Scheme) -> Result<String> {
    scheme.address(signing_key(private_key)?.verifying_key())
}

/// The hex-encoded, compressed public key for `private_key`
pub fn public_key_hex(private_key: &str) -> Result<String> {
    Ok(hex::encode(
        signing_key(private_key)?
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes(),
    ))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     signing & verification                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Sign `data` with `private_key` for verification against an address in `scheme`; return the hex
/// encoding of `r || s || v`
pub fn sign(private_key: &str, data: &[u8], scheme: Scheme) -> Result<String> {
    let key = signing_key(private_key)?;
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(&scheme.digest(data))
        .context(SignSnafu)?;
    let mut bytes = signature.to_bytes().to_vec();
    bytes.push(recovery_id.to_byte());
    Ok(hex::encode(bytes))
}

/// Verify that the hex-encoded recoverable `signature` over `data` was produced by the key behind
/// `address`
pub fn verify_signature(data: &[u8], signature: &str, address: &str) -> Result<()> {
    let scheme = Scheme::of(address)?;
    let bytes = hex::decode(signature.trim_start_matches("0x")).context(HexSnafu {
        what: "signature",
    })?;
    ensure!(bytes.len() == 65, SignatureLengthSnafu { len: bytes.len() });
    let sig = Signature::from_slice(&bytes[..64]).context(SignatureFormatSnafu)?;
    // Ethereum-style signers add 27 to the recovery byte
    let v = if bytes[64] >= 27 {
        bytes[64] - 27
    } else {
        bytes[64]
    };
    let recovery_id = RecoveryId::from_byte(v).context(RecoveryByteSnafu { v })?;
    let key = VerifyingKey::recover_from_prehash(&scheme.digest(data), &sig, recovery_id)
        .context(RecoverSnafu)?;
    let actual = scheme.address(&key)?;
    let matches = match scheme {
        Scheme::Bech32(_) => actual == address,
        Scheme::Legacy(_) => actual.eq_ignore_ascii_case(address),
    };
    ensure!(
        matches,
        SignerMismatchSnafu {
            expected: address,
            actual
        }
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    const ALICE: &str = "4646464646464646464646464646464646464646464646464646464646464646";
    const BOB: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    #[test]
    fn bech32_round_trip() {
        let alice = derive_address(ALICE, Scheme::Bech32("con")).unwrap();
        assert!(alice.starts_with("con1"));
        assert_eq!(alice.len(), 42);
        let sig = sign(ALICE, b"{\"hello\":\"world\"}", Scheme::Bech32("con")).unwrap();
        assert_eq!(sig.len(), 130);
        verify_signature(b"{\"hello\":\"world\"}", &sig, &alice).unwrap();
        // Tampered document
        assert!(verify_signature(b"{\"hello\":\"World\"}", &sig, &alice).is_err());
        // Wrong signer
        let bob = derive_address(BOB, Scheme::Bech32("con")).unwrap();
        assert!(matches!(
            verify_signature(b"{\"hello\":\"world\"}", &sig, &bob),
            Err(Error::SignerMismatch { .. })
        ));
    }

    #[test]
    fn legacy_round_trip() {
        let alice = derive_address(ALICE, Scheme::Legacy("CC")).unwrap();
        assert!(alice.starts_with("CC"));
        assert_eq!(alice.len(), 42);
        let sig = sign(ALICE, b"legacy", Scheme::Legacy("CC")).unwrap();
        verify_signature(b"legacy", &sig, &alice).unwrap();
        // Ethereum-style v
        let mut bytes = hex::decode(&sig).unwrap();
        bytes[64] += 27;
        verify_signature(b"legacy", &hex::encode(bytes), &alice.to_uppercase()).unwrap();
        // A signature over the SHA-256 digest doesn't verify against a legacy address
        let sig = sign(ALICE, b"legacy", Scheme::Bech32("con")).unwrap();
        assert!(verify_signature(b"legacy", &sig, &alice).is_err());
    }

    #[test]
    fn schemes() {
        assert_eq!(
            Scheme::of("con1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq").unwrap(),
            Scheme::Bech32("con")
        );
        assert_eq!(
            Scheme::of("CK0000000000000000000000000000000000000000").unwrap(),
            Scheme::Legacy("CK")
        );
        assert!(Scheme::of("alice").is_err());
    }
}
