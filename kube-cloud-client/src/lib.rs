//! Kubernetes client core with cloud identity authentication
//!
//! This crate produces, caches and refreshes bearer tokens for clusters that
//! delegate authentication to a cloud provider's identity system:
//!
//! - [`IamAuthProvider`] mints EKS tokens from AWS credentials with a presigned
//!   `sts:GetCallerIdentity` URL
//! - [`OidcAuthProvider`] exchanges a projected service account token for AWS session
//!   credentials (IRSA) and mints EKS tokens from them
//! - [`AzureAuthProvider`] and [`GcpAuthProvider`] wrap Azure AD and Google credentials
//!
//! A [`Client`] attaches the current token to every request it sends and can upgrade
//! an authenticated request to a WebSocket to run a [port-forward](crate::portforward).
//!
//! # Example
//!
//! ```rust,no_run
//! use kube_cloud_client::{auth::aws::IamConfig, AuthProvider, Client, Config, IamAuthProvider};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let auth = IamAuthProvider::new(IamConfig::new("my-cluster").with_region("eu-west-1"))?;
//!     let config = Config::new("https://ABCDEF.gr7.eu-west-1.eks.amazonaws.com".parse()?);
//!     let client = Client::try_from_config(config, AuthProvider::from(auth))?;
//!
//!     let res = client.get("/api/v1/namespaces/default/pods").await?;
//!     if res.is_success() {
//!         println!("{}", res.text()?);
//!     }
//!     client.close();
//!     Ok(())
//! }
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod portforward;

#[doc(inline)]
pub use auth::{
    aws::{IamAuthProvider, OidcAuthProvider},
    azure::AzureAuthProvider,
    gcp::GcpAuthProvider,
    AuthProvider,
};
#[doc(inline)] pub use client::{Client, Response};
#[doc(inline)] pub use config::Config;
#[doc(inline)] pub use error::{ConfigError, Error};

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
