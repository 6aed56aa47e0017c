use crate::Error;
use sip_message::{AuthChallenge, AuthResponse, Method};

/// Username/password pair used to answer a digest challenge.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

type HashFn = fn(&[u8]) -> String;

fn hash_md5(i: &[u8]) -> String {
    format!("{:x}", md5::compute(i))
}

fn hash_sha256(i: &[u8]) -> String {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(i);
    format!("{:x}", hasher.finalize())
}

fn hash_fn(algorithm: Option<&str>) -> Result<HashFn, Error> {
    match algorithm.unwrap_or("MD5") {
        "MD5" => Ok(hash_md5),
        "SHA-256" => Ok(hash_sha256),
        other => Err(Error::UnsupportedAlgorithm(other.to_owned())),
    }
}

/// Compute an `Authorization`/`Proxy-Authorization` response to `challenge`
/// for a request of the given `method` and `uri`, per RFC 2617. `body` is
/// only hashed into HA2 when the challenge selects `qop=auth-int`.
///
/// The caller is responsible for tracking whether this is a retry so a
/// second challenge surfaces as an authentication failure instead of
/// looping; this function always computes a fresh response.
pub fn respond_to_challenge(
    challenge: &AuthChallenge,
    credentials: &Credentials,
    method: &Method,
    uri: &str,
    body: &[u8],
) -> Result<AuthResponse, Error> {
    let hash = hash_fn(challenge.algorithm.as_deref())?;

    let mut ha1 = hash(
        format!(
            "{}:{}:{}",
            credentials.username, challenge.realm, credentials.password
        )
        .as_bytes(),
    );

    let is_session_algorithm = challenge
        .algorithm
        .as_deref()
        .is_some_and(|a| a.ends_with("-sess") || a.ends_with("-Sess"));

    let cnonce = uuid::Uuid::new_v4().simple().to_string();

    if is_session_algorithm {
        ha1 = format!("{ha1}:{}:{cnonce}", challenge.nonce);
    }

    let use_qop_auth_int = challenge.qop.iter().any(|q| q == "auth-int");
    let use_qop_auth = challenge.qop.iter().any(|q| q == "auth");

    if !challenge.qop.is_empty() && !use_qop_auth_int && !use_qop_auth {
        return Err(Error::UnsupportedQop(challenge.qop.join(",")));
    }

    let nc = 1u32;

    let (response, qop) = if use_qop_auth_int {
        let ha2 = hash(format!("{method}:{uri}:{}", hash(body)).as_bytes());
        let response = hash(
            format!("{ha1}:{}:{nc:08x}:{cnonce}:auth-int:{ha2}", challenge.nonce).as_bytes(),
        );
        (response, Some("auth-int".to_owned()))
    } else if use_qop_auth {
        let ha2 = hash(format!("{method}:{uri}").as_bytes());
        let response =
            hash(format!("{ha1}:{}:{nc:08x}:{cnonce}:auth:{ha2}", challenge.nonce).as_bytes());
        (response, Some("auth".to_owned()))
    } else {
        let ha2 = hash(format!("{method}:{uri}").as_bytes());
        (hash(format!("{ha1}:{}:{ha2}", challenge.nonce).as_bytes()), None)
    };

    Ok(AuthResponse {
        username: credentials.username.clone(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri: uri.to_owned(),
        response,
        algorithm: challenge.algorithm.clone(),
        qop,
        cnonce: if use_qop_auth || use_qop_auth_int {
            Some(cnonce)
        } else {
            None
        },
        nc: if use_qop_auth || use_qop_auth_int {
            Some(nc)
        } else {
            None
        },
        opaque: challenge.opaque.clone(),
    })
}
