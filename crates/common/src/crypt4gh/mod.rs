//! Crypt4GH container handling
//!
//! This module implements the parts of the Crypt4GH format the data-out
//! path needs:
//!
//! - **Keys**: X25519 keypairs with PEM I/O, including passphrase-protected
//!   `c4gh-v1` private key files
//! - **Header codec**: parse/serialize the container header, unwrap the
//!   session key(s) with the server key, re-wrap them for a requester's
//!   key, and splice in byte-range edit directives
//! - **Body streaming**: lazy, segment-at-a-time decryption of the
//!   ciphertext body with optional range selection
//!
//! # Container layout
//!
//! ```text
//! [ magic "crypt4gh" | version u32 | packet count u32 | packets... ][ body segments... ]
//! ```
//!
//! Each header packet is encrypted to exactly one recipient. A holder of a
//! matching private key recovers either a 32-byte session key or a data
//! edit list; everyone else sees an opaque blob. The body is a sequence of
//! independently encrypted segments of up to 64 KiB plaintext each, so
//! re-keying a container only ever rewrites the header — the body is
//! copied through untouched.

mod header;
mod keys;
mod stream;

pub use header::{
    Header, HeaderError, HeaderPacket, PacketPayload, SessionMaterial, CIPHER_SEGMENT_SIZE,
    SEGMENT_SIZE,
};
pub use keys::{KeyError, PublicKey, SecretKey, KEY_SIZE};
pub use stream::{decrypt_body, encrypt_segment, BodyError, ByteRange};
