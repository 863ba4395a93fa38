//! # mapepire-channel
//!
//! Secure transport to a Mapepire daemon.
//!
//! A [`SecureChannel`] is a WebSocket over TLS to `wss://host:port/db/`,
//! authenticated with HTTP Basic credentials in the upgrade request. Each
//! text frame carries exactly one JSON object. Inbound objects, transport
//! errors and the final close are delivered to the channel's owner as
//! [`ChannelEvent`]s; the channel never reconnects or retries on its own.
//!
//! ## TLS trust
//!
//! Trust is selected from the endpoint's [`TlsOptions`]:
//!
//! | CA supplied | CA is self-signed | `reject_unauthorized` | trust |
//! |---|---|---|---|
//! | no | - | default (`true`) | `webpki-roots` |
//! | no | - | `false` | any certificate |
//! | yes | yes | default (`false`) | pinned to the CA |
//! | yes | no | default (`true`) | the CA is the only root |
//!
//! [`get_certificate`] retrieves a server's root certificate without
//! validating it, so it can be supplied as the CA afterwards.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod certificate;
pub mod channel;
pub mod endpoint;
pub mod error;
pub mod framed;
pub mod tls;

pub use certificate::{PeerCertificate, get_certificate, get_certificate_chain};
pub use channel::{ChannelEvent, SecureChannel};
pub use endpoint::{Endpoint, TlsOptions};
pub use error::ChannelError;
pub use framed::JsonFrames;
pub use tls::{build_client_config, is_self_signed, parse_pem_certificate, reject_unauthorized};
