//! Short-lived signed tokens gating access to a session's CDP proxy.
//!
//! A token is a compact two-part string: `base64url(json(claims)) + "." +
//! base64url(hmac_sha256(signing_key, payload))`. The MAC key is the
//! session's [`SigningKey`], so a token is only ever valid for the one
//! session it was minted for. The proxy rejects each failure mode with a
//! distinct WebSocket close code, see [`TokenError::close_code`].

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::session::{ProjectId, SessionId, SigningKey, now_ts};

type HmacSha256 = Hmac<Sha256>;

/// Upper bound on token lifetime. Mint-side TTLs are clamped to this.
pub const MAX_TOKEN_TTL_SECS: u64 = 600;

/// Labeled subset of the CDP surface a token authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
	/// Full CDP, used by automation SDKs.
	CdpDirect,
	/// Full CDP plus the DevTools HTTP discovery endpoints.
	Debug,
	/// CDP restricted to the domains screencasting needs.
	Screencast,
}

impl Scope {
	/// Whether the HTTP target-discovery endpoints (`/json`, `/json/version`)
	/// are permitted.
	pub fn allows_http_discovery(self) -> bool {
		matches!(self, Scope::Debug)
	}

	/// Whether a client-originated CDP method may be forwarded.
	///
	/// Screencast tokens are limited to page/target lifecycle and input;
	/// every other domain is refused at the proxy.
	pub fn allows_method(self, method: &str) -> bool {
		match self {
			Scope::CdpDirect | Scope::Debug => true,
			Scope::Screencast => {
				method.starts_with("Page.") || method.starts_with("Target.") || method.starts_with("Input.")
			}
		}
	}
}

impl std::fmt::Display for Scope {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			Scope::CdpDirect => "cdp-direct",
			Scope::Debug => "debug",
			Scope::Screencast => "screencast",
		};
		f.write_str(name)
	}
}

impl std::str::FromStr for Scope {
	type Err = TokenError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"cdp-direct" => Ok(Scope::CdpDirect),
			"debug" => Ok(Scope::Debug),
			"screencast" => Ok(Scope::Screencast),
			_ => Err(TokenError::Malformed),
		}
	}
}

/// Claim set carried by a connection token. Field names are kept short on
/// the wire, JWT-style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectClaims {
	/// Session id the token is bound to.
	pub sid: String,
	/// Project id, for audit and ingress cross-checks.
	pub pid: String,
	/// Optional end-user identity supplied by the façade.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub uid: Option<String>,
	pub scope: Scope,
	/// Optional client IP binding; enforced only when present.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ip: Option<String>,
	pub iat: u64,
	pub exp: u64,
}

impl ConnectClaims {
	/// Builds a claim set expiring `ttl_secs` from `now`, clamped to
	/// [`MAX_TOKEN_TTL_SECS`].
	pub fn new(session_id: &SessionId, project_id: &ProjectId, scope: Scope, ttl_secs: u64, now: u64) -> Self {
		let ttl = ttl_secs.min(MAX_TOKEN_TTL_SECS);
		Self {
			sid: session_id.as_str().to_string(),
			pid: project_id.as_str().to_string(),
			uid: None,
			scope,
			ip: None,
			iat: now,
			exp: now + ttl,
		}
	}

	pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
		self.uid = Some(user_id.into());
		self
	}

	pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
		self.ip = Some(ip.into());
		self
	}

	/// Serializes and MACs the claims into the compact token form.
	pub fn sign(&self, key: &SigningKey) -> Result<String, TokenError> {
		let payload = serde_json::to_vec(self).map_err(|_| TokenError::Malformed)?;
		let encoded = URL_SAFE_NO_PAD.encode(&payload);
		let mac = mac_over(key, encoded.as_bytes())?;
		Ok(format!("{}.{}", encoded, URL_SAFE_NO_PAD.encode(mac)))
	}

	/// Enforces the optional IP binding against the observed peer address.
	pub fn check_client_ip(&self, peer_ip: &str) -> Result<(), TokenError> {
		match self.ip.as_deref() {
			Some(bound) if bound != peer_ip => Err(TokenError::IpMismatch),
			_ => Ok(()),
		}
	}
}

/// Verifies a compact token against a session's signing key.
///
/// Order matters: the MAC is checked before any claim is trusted, then the
/// expiry. Scope and IP checks are endpoint-dependent and left to the caller.
pub fn verify(token: &str, key: &SigningKey, now: u64) -> Result<ConnectClaims, TokenError> {
	let (payload_b64, mac_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;
	let expected = URL_SAFE_NO_PAD.decode(mac_b64).map_err(|_| TokenError::Malformed)?;

	let mut mac = HmacSha256::new_from_slice(key.as_str().as_bytes()).map_err(|_| TokenError::Malformed)?;
	mac.update(payload_b64.as_bytes());
	mac.verify_slice(&expected).map_err(|_| TokenError::BadSignature)?;

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| TokenError::Malformed)?;
	let claims: ConnectClaims = serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;

	if claims.exp <= now {
		return Err(TokenError::Expired);
	}
	Ok(claims)
}

/// Convenience for minting against current wall-clock time.
pub fn mint(session_id: &SessionId, project_id: &ProjectId, scope: Scope, ttl_secs: u64, key: &SigningKey) -> Result<String, TokenError> {
	ConnectClaims::new(session_id, project_id, scope, ttl_secs, now_ts()).sign(key)
}

/// Builds the client-facing CDP WebSocket URL for a ready session.
pub fn connect_url(host: &str, port: u16, token: &str) -> String {
	format!("ws://{host}:{port}/devtools/browser?token={token}")
}

fn mac_over(key: &SigningKey, payload: &[u8]) -> Result<Vec<u8>, TokenError> {
	let mut mac = HmacSha256::new_from_slice(key.as_str().as_bytes()).map_err(|_| TokenError::Malformed)?;
	mac.update(payload);
	Ok(mac.finalize().into_bytes().to_vec())
}

/// Reasons a token is refused, each with its own proxy close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
	#[error("malformed token")]
	Malformed,
	#[error("token signature mismatch")]
	BadSignature,
	#[error("token expired")]
	Expired,
	#[error("scope does not permit this endpoint")]
	ScopeMismatch,
	#[error("client address does not match token binding")]
	IpMismatch,
}

impl TokenError {
	/// WebSocket close code the proxy answers with.
	pub fn close_code(self) -> u16 {
		match self {
			TokenError::Malformed | TokenError::BadSignature => 4001,
			TokenError::Expired => 4002,
			TokenError::ScopeMismatch => 4003,
			TokenError::IpMismatch => 4004,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ids() -> (SessionId, ProjectId, SigningKey) {
		(SessionId::new("s1"), ProjectId::new("p1"), SigningKey::generate())
	}

	#[test]
	fn signed_token_verifies_and_preserves_claims() {
		let (sid, pid, key) = ids();
		let claims = ConnectClaims::new(&sid, &pid, Scope::CdpDirect, 300, 1000).with_user("u-7");
		let token = claims.sign(&key).unwrap();
		let back = verify(&token, &key, 1100).unwrap();
		assert_eq!(back, claims);
	}

	#[test]
	fn expired_token_is_rejected_with_4002() {
		let (sid, pid, key) = ids();
		let token = ConnectClaims::new(&sid, &pid, Scope::CdpDirect, 60, 1000).sign(&key).unwrap();
		let err = verify(&token, &key, 1061).unwrap_err();
		assert_eq!(err, TokenError::Expired);
		assert_eq!(err.close_code(), 4002);
	}

	#[test]
	fn wrong_key_fails_before_claims_are_read() {
		let (sid, pid, key) = ids();
		let token = ConnectClaims::new(&sid, &pid, Scope::CdpDirect, 60, 1000).sign(&key).unwrap();
		let err = verify(&token, &SigningKey::generate(), 1001).unwrap_err();
		assert_eq!(err, TokenError::BadSignature);
		assert_eq!(err.close_code(), 4001);
	}

	#[test]
	fn tampered_payload_fails_the_mac() {
		let (sid, pid, key) = ids();
		let token = ConnectClaims::new(&sid, &pid, Scope::Screencast, 60, 1000).sign(&key).unwrap();
		let (payload, mac) = token.split_once('.').unwrap();
		let other = ConnectClaims::new(&sid, &pid, Scope::CdpDirect, 60, 1000).sign(&key).unwrap();
		let (other_payload, _) = other.split_once('.').unwrap();
		assert_ne!(payload, other_payload);
		let forged = format!("{other_payload}.{mac}");
		assert_eq!(verify(&forged, &key, 1001).unwrap_err(), TokenError::BadSignature);
	}

	#[test]
	fn ttl_clamps_to_the_maximum() {
		let (sid, pid, _) = ids();
		let claims = ConnectClaims::new(&sid, &pid, Scope::Debug, 86_400, 1000);
		assert_eq!(claims.exp, 1000 + MAX_TOKEN_TTL_SECS);
	}

	#[test]
	fn ip_binding_enforced_only_when_present() {
		let (sid, pid, _) = ids();
		let unbound = ConnectClaims::new(&sid, &pid, Scope::CdpDirect, 60, 1000);
		assert!(unbound.check_client_ip("10.0.0.1").is_ok());

		let bound = unbound.clone().with_client_ip("10.0.0.1");
		assert!(bound.check_client_ip("10.0.0.1").is_ok());
		assert_eq!(bound.check_client_ip("10.0.0.2").unwrap_err(), TokenError::IpMismatch);
	}

	#[test]
	fn screencast_scope_limits_methods() {
		assert!(Scope::Screencast.allows_method("Page.startScreencast"));
		assert!(Scope::Screencast.allows_method("Target.getTargets"));
		assert!(Scope::Screencast.allows_method("Input.dispatchMouseEvent"));
		assert!(!Scope::Screencast.allows_method("DOM.setAttributeValue"));
		assert!(!Scope::Screencast.allows_method("Network.enable"));
		assert!(Scope::CdpDirect.allows_method("DOM.setAttributeValue"));
	}

	#[test]
	fn only_debug_scope_reaches_http_discovery() {
		assert!(Scope::Debug.allows_http_discovery());
		assert!(!Scope::CdpDirect.allows_http_discovery());
		assert!(!Scope::Screencast.allows_http_discovery());
	}

	#[test]
	fn scope_round_trips_kebab_case() {
		let json = serde_json::to_string(&Scope::CdpDirect).unwrap();
		assert_eq!(json, r#""cdp-direct""#);
		assert_eq!("screencast".parse::<Scope>().unwrap(), Scope::Screencast);
		assert!("admin".parse::<Scope>().is_err());
	}

	#[test]
	fn connect_url_shape() {
		assert_eq!(connect_url("1.2.3.4", 9223, "abc.def"), "ws://1.2.3.4:9223/devtools/browser?token=abc.def");
	}
}
