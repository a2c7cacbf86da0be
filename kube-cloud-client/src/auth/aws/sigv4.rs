//! AWS Signature Version 4 query-string presigning.
//!
//! Only the presigned URL form is implemented: the signature travels in the query string
//! together with the credential scope, so the resulting URL can be handed to a third party
//! (the EKS API server) which replays it against STS.
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::Method;
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::Credentials;

type HmacSha256 = Hmac<Sha256>;

/// The only signing algorithm supported.
pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// The longest validity a presigned URL may have.
pub const MAX_EXPIRES_IN: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const DEFAULT_EXPIRES_IN: Duration = Duration::from_secs(900);
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Error, Debug)]
/// Possible errors when presigning a request
pub enum SigningError {
    /// The credentials have no access key id
    #[error("credentials have an empty access key id")]
    MissingAccessKey,

    /// Requested validity exceeds [`MAX_EXPIRES_IN`]
    #[error("presigned URLs are valid for at most 604800 seconds, got {0}")]
    ExpiresTooLong(u64),

    /// HMAC rejected the derived key
    #[error("invalid signing key: {0}")]
    InvalidKey(#[source] hmac::digest::InvalidLength),
}

/// Payload hash placed in the canonical request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PayloadHash {
    /// SHA-256 of an empty body
    #[default]
    Empty,
    /// `UNSIGNED-PAYLOAD`
    Unsigned,
}

impl PayloadHash {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => EMPTY_SHA256,
            Self::Unsigned => "UNSIGNED-PAYLOAD",
        }
    }
}

/// An HTTPS request to presign.
#[derive(Clone, Debug)]
pub struct UnsignedRequest {
    method: Method,
    host: String,
    path: String,
    params: Vec<(String, String)>,
    headers: Vec<(String, String)>,
}

impl UnsignedRequest {
    /// A `GET` to `https://{host}{path}`.
    pub fn get(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            host: host.into(),
            path: path.into(),
            params: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Add a query parameter covered by the signature.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Add a header covered by the signature, besides `host`.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into().to_ascii_lowercase(), value.into()));
        self
    }

    /// The host.
    pub fn host(&self) -> &str {
        &self.host
    }
}

/// Presigns requests for one region and service.
#[derive(Clone, Debug)]
pub struct RequestSigner {
    region: String,
    service: String,
    expires_in: Duration,
    payload: PayloadHash,
}

impl RequestSigner {
    /// A signer valid for 15 minutes.
    pub fn new(region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
            expires_in: DEFAULT_EXPIRES_IN,
            payload: PayloadHash::default(),
        }
    }

    /// Set the validity of presigned URLs.
    #[must_use]
    pub fn with_expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = expires_in;
        self
    }

    /// Set the payload hash.
    #[must_use]
    pub fn with_payload_hash(mut self, payload: PayloadHash) -> Self {
        self.payload = payload;
        self
    }

    /// The region requests are scoped to.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// The validity of presigned URLs.
    pub fn expires_in(&self) -> Duration {
        self.expires_in
    }

    /// Presign `request` with `credentials` as of `at`, returning the full URL.
    pub fn presign(
        &self,
        request: &UnsignedRequest,
        credentials: &Credentials,
        at: DateTime<Utc>,
    ) -> Result<String, SigningError> {
        if credentials.access_key_id.is_empty() {
            return Err(SigningError::MissingAccessKey);
        }
        if self.expires_in > MAX_EXPIRES_IN {
            return Err(SigningError::ExpiresTooLong(self.expires_in.as_secs()));
        }

        let amz_date = at.format("%Y%m%dT%H%M%SZ").to_string();
        let date = at.format("%Y%m%d").to_string();
        let scope = format!("{date}/{}/{}/aws4_request", self.region, self.service);

        let mut headers: Vec<(String, String)> = request
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.trim().to_owned()))
            .chain(std::iter::once(("host".to_owned(), request.host.clone())))
            .collect();
        headers.sort();
        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let mut params = request.params.clone();
        params.extend([
            ("X-Amz-Algorithm".to_owned(), ALGORITHM.to_owned()),
            (
                "X-Amz-Credential".to_owned(),
                format!("{}/{scope}", credentials.access_key_id),
            ),
            ("X-Amz-Date".to_owned(), amz_date.clone()),
            ("X-Amz-Expires".to_owned(), self.expires_in.as_secs().to_string()),
        ]);
        if let Some(token) = &credentials.session_token {
            params.push((
                "X-Amz-Security-Token".to_owned(),
                token.expose_secret().to_owned(),
            ));
        }
        params.push(("X-Amz-SignedHeaders".to_owned(), signed_headers.clone()));

        let mut encoded: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (canonical_encode(k), canonical_encode(v)))
            .collect();
        encoded.sort();
        let canonical_query = join_query(&encoded);

        let canonical_headers: String = headers.iter().map(|(k, v)| format!("{k}:{v}\n")).collect();
        let path = canonical_path(&request.path);
        let canonical_request = format!(
            "{}\n{path}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{}",
            request.method,
            self.payload.as_str()
        );
        tracing::trace!(%canonical_request, "presigning");

        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let key = signing_key(
            credentials.secret_access_key.expose_secret(),
            &date,
            &self.region,
            &self.service,
        )?;
        let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

        // The URL form leaves a few more characters unescaped than the canonical form.
        let url_query = join_query(
            &encoded
                .iter()
                .map(|(k, v)| (relax(k), relax(v)))
                .collect::<Vec<_>>(),
        );
        Ok(format!(
            "https://{}{path}?{url_query}&X-Amz-Signature={signature}",
            request.host
        ))
    }
}

/// Derive the SigV4 signing key for a date (`YYYYMMDD`), region and service.
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>, SigningError> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SigningError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(SigningError::InvalidKey)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Percent-encode per RFC 3986, leaving only `A-Z a-z 0-9 - _ . ~` unescaped.
pub fn canonical_encode(s: &str) -> String {
    form_urlencoded::byte_serialize(s.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
        .replace('*', "%2A")
        .replace("%7E", "~")
}

/// [`canonical_encode`] with `! ' ( )` also left unescaped.
pub fn url_encode(s: &str) -> String {
    relax(&canonical_encode(s))
}

fn relax(encoded: &str) -> String {
    encoded
        .replace("%21", "!")
        .replace("%27", "'")
        .replace("%28", "(")
        .replace("%29", ")")
}

fn canonical_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_owned();
    }
    path.split('/').map(canonical_encode).collect::<Vec<_>>().join("/")
}

fn join_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}
