use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;

use super::{
    sigv4::{RequestSigner, SigningError, UnsignedRequest},
    Credentials,
};
use crate::auth::{Cached, CachedToken};

/// Prefix of every EKS bearer token.
pub const TOKEN_PREFIX: &str = "k8s-aws-v1.";

const CLUSTER_ID: &str = "x-k8s-aws-id";
// The API server accepts presigned URLs for 15 minutes; stop using them a minute earlier.
const TOKEN_LIFETIME_MINUTES: i64 = 14;

/// Where the cluster name is bound into the presigned request.
///
/// Stock `aws-iam-authenticator` servers, including the one EKS runs, only accept tokens
/// where `x-k8s-aws-id` is listed in `X-Amz-SignedHeaders`. Use
/// [`SignedHeader`](Self::SignedHeader) against them; the query parameter form is
/// for verifiers that read the cluster name from the query string.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClusterIdBinding {
    /// `x-k8s-aws-id` is a signed query parameter
    #[default]
    QueryParameter,
    /// `x-k8s-aws-id` is a signed header, as `aws-iam-authenticator` does
    SignedHeader,
}

/// STS endpoint host for a region.
pub fn sts_host(region: &str) -> String {
    if region.starts_with("cn-") {
        format!("sts.{region}.amazonaws.com.cn")
    } else {
        format!("sts.{region}.amazonaws.com")
    }
}

/// Mint a bearer token for `cluster` from `credentials` as of `now`.
///
/// The token expires after 14 minutes, or with the credentials if they expire first.
pub(crate) fn generate(
    credentials: &Credentials,
    cluster: &str,
    region: &str,
    binding: ClusterIdBinding,
    now: DateTime<Utc>,
) -> Result<CachedToken, SigningError> {
    let request = UnsignedRequest::get(sts_host(region), "/")
        .with_param("Action", "GetCallerIdentity")
        .with_param("Version", "2011-06-15");
    let request = match binding {
        ClusterIdBinding::QueryParameter => request.with_param(CLUSTER_ID, cluster),
        ClusterIdBinding::SignedHeader => request.with_header(CLUSTER_ID, cluster),
    };
    let url = RequestSigner::new(region, "sts").presign(&request, credentials, now)?;
    let token = format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(url));

    let mut expires_at = now + Duration::minutes(TOKEN_LIFETIME_MINUTES);
    if let Some(limit) = credentials.expires_at {
        expires_at = expires_at.min(limit);
    }
    Ok(Cached::new(SecretString::from(token), Some(expires_at)))
}
