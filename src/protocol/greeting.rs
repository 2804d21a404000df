//! Server greeting and `chap-sha1` scramble.
//!
//! The greeting is 128 bytes of text sent before any framed traffic:
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Tarantool 2.10.4 (Binary) 7c1ed2a8-...        (64 bytes, \n) │
//! │ <base64 salt, 44 chars>                       (64 bytes, \n) │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::error::{IprotoError, Result};

/// Total greeting size in bytes.
pub const GREETING_SIZE: usize = 128;

/// Size of each greeting line, newline included.
pub const GREETING_LINE_SIZE: usize = 64;

/// Length of the base64-encoded salt on the second line.
const SALT_BASE64_SIZE: usize = 44;

/// Scramble (and SHA-1 digest) size.
pub const SCRAMBLE_SIZE: usize = 20;

/// Server version parsed from the greeting banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `2.10.4`, `1.10.3-6-g0f5e3b2` or `2.11.0-entrypoint-11-g1d4a...`.
    fn parse(text: &str) -> Option<Self> {
        let numeric = text.split('-').next()?;
        let mut parts = numeric.split('.').map(|p| p.parse::<u32>());

        let major = parts.next()?.ok()?;
        let minor = parts.next().unwrap_or(Ok(0)).ok()?;
        let patch = parts.next().unwrap_or(Ok(0)).ok()?;

        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parsed server greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub version: Version,
    /// Version as printed by the server, e.g. `2.10.4-0-g1b2c3d4`.
    pub version_string: String,
    /// Protocol name, `Binary` for IPROTO.
    pub protocol: String,
    pub instance_uuid: Option<String>,
    salt: Vec<u8>,
}

impl Greeting {
    /// Parse a 128-byte greeting.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < GREETING_SIZE {
            return Err(IprotoError::Protocol(format!(
                "Greeting is {} bytes, expected {}",
                buf.len(),
                GREETING_SIZE
            )));
        }

        let banner = std::str::from_utf8(&buf[..GREETING_LINE_SIZE])
            .map_err(|_| IprotoError::Protocol("Greeting banner is not UTF-8".to_string()))?;
        let mut words = banner.split_whitespace();

        if words.next() != Some("Tarantool") {
            return Err(IprotoError::Protocol(format!(
                "Unexpected greeting banner: {}",
                banner.trim_end()
            )));
        }

        let version_string = words
            .next()
            .ok_or_else(|| IprotoError::Protocol("Greeting has no version".to_string()))?
            .to_string();
        let version = Version::parse(&version_string).ok_or_else(|| {
            IprotoError::Protocol(format!("Unparsable server version '{version_string}'"))
        })?;

        let protocol = words
            .next()
            .map(|p| p.trim_matches(|c| c == '(' || c == ')').to_string())
            .unwrap_or_else(|| "Binary".to_string());
        if protocol != "Binary" {
            return Err(IprotoError::Protocol(format!(
                "Unsupported protocol '{protocol}'"
            )));
        }
        let instance_uuid = words.next().map(str::to_string);

        let salt_line = &buf[GREETING_LINE_SIZE..GREETING_LINE_SIZE + SALT_BASE64_SIZE];
        let salt = STANDARD
            .decode(salt_line)
            .map_err(|e| IprotoError::Protocol(format!("Invalid greeting salt: {e}")))?;
        if salt.len() < SCRAMBLE_SIZE {
            return Err(IprotoError::Protocol(format!(
                "Greeting salt is {} bytes, need at least {}",
                salt.len(),
                SCRAMBLE_SIZE
            )));
        }

        Ok(Self {
            version,
            version_string,
            protocol,
            instance_uuid,
            salt,
        })
    }

    /// Decoded salt bytes.
    #[inline]
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Scramble `password` with this greeting's salt.
    pub fn scramble(&self, password: &str) -> [u8; SCRAMBLE_SIZE] {
        scramble(&self.salt, password)
    }
}

fn sha1_of(parts: &[&[u8]]) -> [u8; SCRAMBLE_SIZE] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; SCRAMBLE_SIZE];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Compute the `chap-sha1` scramble:
/// `sha1(password) XOR sha1(salt[..20] ++ sha1(sha1(password)))`.
///
/// # Panics
///
/// Panics if `salt` is shorter than 20 bytes; [`Greeting::parse`] rejects such salts.
pub fn scramble(salt: &[u8], password: &str) -> [u8; SCRAMBLE_SIZE] {
    let hash1 = sha1_of(&[password.as_bytes()]);
    let hash2 = sha1_of(&[&hash1[..]]);
    let hash3 = sha1_of(&[&salt[..SCRAMBLE_SIZE], &hash2[..]]);

    let mut out = [0u8; SCRAMBLE_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = hash1[i] ^ hash3[i];
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Salt bytes 1..=32, base64-encoded.
    pub(crate) const TEST_SALT_B64: &str = "AQIDBAUGBwgJCgsMDQ4PEBESExQVFhcYGRobHB0eHyA=";

    /// Scramble of password `secret` with [`TEST_SALT_B64`].
    pub(crate) const SECRET_SCRAMBLE: [u8; SCRAMBLE_SIZE] = [
        179, 43, 179, 165, 131, 225, 52, 12, 10, 17, 8, 213, 139, 27, 228, 151, 129, 173, 140, 47,
    ];

    pub(crate) fn make_greeting(banner: &str, salt_b64: &str) -> Vec<u8> {
        let text = format!("{banner:<63}\n{salt_b64:<63}\n");
        assert_eq!(text.len(), GREETING_SIZE);
        text.into_bytes()
    }

    #[test]
    fn test_parse_known_greeting() {
        let buf = make_greeting(
            "Tarantool 2.10.4 (Binary) 7c1ed2a8-3c3a-4d9f-9d5a-0b5c7e6f1a2b",
            TEST_SALT_B64,
        );

        let greeting = Greeting::parse(&buf).unwrap();

        assert_eq!(greeting.version, Version::new(2, 10, 4));
        assert_eq!(greeting.version_string, "2.10.4");
        assert_eq!(greeting.protocol, "Binary");
        assert_eq!(
            greeting.instance_uuid.as_deref(),
            Some("7c1ed2a8-3c3a-4d9f-9d5a-0b5c7e6f1a2b")
        );
        assert_eq!(greeting.salt(), (1u8..=32).collect::<Vec<_>>().as_slice());
    }

    #[test]
    fn test_scramble_reference_vector() {
        let buf = make_greeting("Tarantool 2.10.4 (Binary)", TEST_SALT_B64);
        let greeting = Greeting::parse(&buf).unwrap();

        assert_eq!(greeting.scramble("secret"), SECRET_SCRAMBLE);
    }

    #[test]
    fn test_scramble_depends_on_salt() {
        let other: Vec<u8> = (100u8..132).collect();
        assert_ne!(scramble(&other, "secret"), SECRET_SCRAMBLE);
    }

    #[test]
    fn test_version_with_build_suffix() {
        let buf = make_greeting("Tarantool 1.10.3-6-g0f5e3b2 (Binary) abc", TEST_SALT_B64);
        let greeting = Greeting::parse(&buf).unwrap();

        assert_eq!(greeting.version, Version::new(1, 10, 3));
        assert_eq!(greeting.version_string, "1.10.3-6-g0f5e3b2");
        assert!(greeting.version > Version::new(1, 9, 0));
        assert!(greeting.version < Version::new(2, 0, 0));
    }

    #[test]
    fn test_rejects_foreign_banner() {
        let buf = make_greeting("SSH-2.0-OpenSSH_9.0", TEST_SALT_B64);
        let err = Greeting::parse(&buf).unwrap_err();
        assert!(err.to_string().contains("Unexpected greeting banner"));
    }

    #[test]
    fn test_rejects_non_binary_protocol() {
        let buf = make_greeting("Tarantool 2.10.4 (Lua console)", TEST_SALT_B64);
        assert!(Greeting::parse(&buf).is_err());
    }

    #[test]
    fn test_rejects_bad_salt() {
        let buf = make_greeting("Tarantool 2.10.4 (Binary)", "!!!! not base64 !!!!");
        let err = Greeting::parse(&buf).unwrap_err();
        assert!(err.to_string().contains("salt"));
    }

    #[test]
    fn test_rejects_short_greeting() {
        assert!(Greeting::parse(&[b' '; 64]).is_err());
    }

    #[test]
    fn test_version_display() {
        assert_eq!(Version::new(2, 11, 1).to_string(), "2.11.1");
    }
}
