//! Authentication mechanisms: ANONYMOUS and CRAM-MD5

use crate::config::{AccessLevel, ServeConfig};
use bsvn_ra::{Arg, Conn, Item, RaError, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use md5::Md5;
use tracing::{debug, info};

pub const MECH_ANONYMOUS: &str = "ANONYMOUS";
pub const MECH_CRAM_MD5: &str = "CRAM-MD5";

/// Mechanisms offered in the greeting, strongest first
pub fn mechanisms(config: &ServeConfig) -> Vec<&'static str> {
    let mut mechs = Vec::new();
    if config.allows_auth() {
        mechs.push(MECH_CRAM_MD5);
    }
    if config.general.anon_access > AccessLevel::None {
        mechs.push(MECH_ANONYMOUS);
    }
    mechs
}

type HmacMd5 = Hmac<Md5>;

fn keyed(key: &[u8]) -> Result<HmacMd5> {
    HmacMd5::new_from_slice(key).map_err(|e| RaError::malformed(format!("unusable CRAM-MD5 key: {}", e)))
}

/// HMAC-MD5 as used by CRAM-MD5 (RFC 2104)
pub fn hmac_md5(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = keyed(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// What a client sends back for `challenge`
pub fn cram_md5_response(user: &str, password: &str, challenge: &[u8]) -> Result<String> {
    Ok(format!("{} {}", user, hex::encode(hmac_md5(password.as_bytes(), challenge)?)))
}

fn make_challenge() -> String {
    let nonce = uuid::Uuid::new_v4().as_u128() as u64;
    format!("<{}.{}@bsvnserve>", nonce, Utc::now().timestamp_micros())
}

fn check_response(config: &ServeConfig, challenge: &[u8], response: &[u8]) -> Option<String> {
    let response = std::str::from_utf8(response).ok()?;
    let (user, digest) = response.rsplit_once(' ')?;
    let password = config.users.get(user)?;
    let digest = hex::decode(digest).ok()?;
    let mut mac = keyed(password.as_bytes()).ok()?;
    mac.update(challenge);
    // Constant-time comparison.
    mac.verify_slice(&digest).ok()?;
    Some(user.to_string())
}

/// Run the exchange for the mechanism the client picked.
///
/// Returns the authenticated user, or `None` for anonymous access. On
/// success the final `( success ( ) )` has been written; on failure nothing
/// has, and the caller reports the error.
pub fn authenticate(conn: &mut Conn, config: &ServeConfig, mech: &str) -> Result<Option<String>> {
    match mech {
        MECH_ANONYMOUS if config.general.anon_access > AccessLevel::None => {
            conn.write_success("", &[])?;
            debug!("anonymous access granted");
            Ok(None)
        }
        MECH_CRAM_MD5 if config.allows_auth() => {
            let challenge = make_challenge();
            conn.write_command("step", "c", &[Arg::CStr(Some(&challenge))])?;
            let response = match conn.read_item()? {
                Item::String(s) => s,
                other => {
                    return Err(RaError::malformed(format!(
                        "expected a CRAM-MD5 response string, found {}",
                        other.kind_name()
                    )));
                }
            };
            match check_response(config, challenge.as_bytes(), &response) {
                Some(user) => {
                    conn.write_success("", &[])?;
                    info!("authenticated user {}", user);
                    Ok(Some(user))
                }
                None => Err(RaError::NotAuthorized("username or password incorrect".into())),
            }
        }
        _ => Err(RaError::NotAuthorized(format!("mechanism {} not available", mech))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_md5_rfc2104_vectors() {
        assert_eq!(
            hex::encode(hmac_md5(&[0x0b; 16], b"Hi There").unwrap()),
            "9294727a3638bb1c13f48ef8158bfc9d"
        );
        assert_eq!(
            hex::encode(hmac_md5(b"Jefe", b"what do ya want for nothing?").unwrap()),
            "750c783e6ab0b503eaa86e310a5db738"
        );
    }

    #[test]
    fn test_check_response() {
        let mut config = ServeConfig::default();
        config.users.insert("harry".into(), "secret".into());
        let challenge = b"<1.2@host>";
        let good = cram_md5_response("harry", "secret", challenge).unwrap();
        assert_eq!(check_response(&config, challenge, good.as_bytes()).as_deref(), Some("harry"));

        let bad = cram_md5_response("harry", "guess", challenge).unwrap();
        assert!(check_response(&config, challenge, bad.as_bytes()).is_none());
        let stranger = cram_md5_response("sally", "secret", challenge).unwrap();
        assert!(check_response(&config, challenge, stranger.as_bytes()).is_none());

        // Upper-case hex digests are accepted; malformed ones are not.
        let (user, digest) = good.split_once(' ').unwrap();
        let shouted = format!("{} {}", user, digest.to_ascii_uppercase());
        assert_eq!(check_response(&config, challenge, shouted.as_bytes()).as_deref(), Some("harry"));
        assert!(check_response(&config, challenge, b"harry nothex").is_none());
        assert!(check_response(&config, challenge, b"harry 00").is_none());
    }

    #[test]
    fn test_mechanisms_follow_config() {
        let mut config = ServeConfig::default();
        assert_eq!(mechanisms(&config), vec![MECH_ANONYMOUS]);
        config.users.insert("harry".into(), "secret".into());
        config.general.anon_access = AccessLevel::None;
        assert_eq!(mechanisms(&config), vec![MECH_CRAM_MD5]);
    }
}
