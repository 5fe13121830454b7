//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Outbound requests always sign `(request-target) host date` with
//! RSA-SHA256 (PKCS#1 v1.5).

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use http::HeaderMap;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Headers covered by every outbound signature, in signing order
pub const SIGNED_HEADERS: [&str; 3] = ["(request-target)", "host", "date"];

/// RFC 1123 date with a literal GMT zone
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Format a timestamp for the `Date` header.
pub fn format_http_date(at: DateTime<Utc>) -> String {
    at.format(HTTP_DATE_FORMAT).to_string()
}

/// Build the canonical signing string.
///
/// ```text
/// (request-target): post /u/test/inbox
/// host: example.social
/// date: Tue, 07 Jun 2022 20:51:35 GMT
/// ```
pub fn build_signing_string(method: &str, path: &str, host: &str, date: &str) -> String {
    format!(
        "(request-target): {} {}\nhost: {}\ndate: {}",
        method.to_lowercase(),
        path,
        host,
        date
    )
}

/// RSA-SHA256 PKCS#1 v1.5 signer
pub type RequestSigner = SigningKey<Sha256>;

/// Build the signer for `private_key`. Holders of a long-lived key keep the
/// result instead of rebuilding it per request.
pub fn signer_for(private_key: &RsaPrivateKey) -> RequestSigner {
    RequestSigner::new(private_key.clone())
}

/// RSA-SHA256 over `signing_string`
///
/// # Errors
/// `Signing` if the key cannot produce a signature.
pub fn sign(signing_string: &str, signing_key: &RequestSigner) -> Result<Vec<u8>, AppError> {
    let mut rng = rand::thread_rng();
    let signature = signing_key
        .try_sign_with_rng(&mut rng, signing_string.as_bytes())
        .map_err(|e| AppError::Signing(e.to_string()))?;
    Ok(signature.to_vec())
}

/// Encode the `Signature` header value.
pub fn encode_signature_header(key_id: &str, headers: &[&str], signature: &[u8]) -> String {
    format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers.join(" "),
        BASE64.encode(signature)
    )
}

/// Everything needed to send one signed request
#[derive(Debug, Clone)]
pub struct SignedRequestContext {
    pub target_url: String,
    pub method: String,
    /// Host header value (includes a non-default port)
    pub host: String,
    /// Path plus query, as used in `(request-target)`
    pub path: String,
    /// Date header value
    pub date: String,
    pub signing_string: String,
    /// Signature header value
    pub signature: String,
}

/// Sign an HTTP request
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `signer` - Local actor signing key
/// * `key_id` - Full URL to the public key (actor#main-key)
/// * `now` - Timestamp placed in the Date header
pub fn sign_request(
    method: &str,
    url: &str,
    signer: &RequestSigner,
    key_id: &str,
    now: DateTime<Utc>,
) -> Result<SignedRequestContext, AppError> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = host_header_value(&parsed_url)?;
    let path = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };
    let date = format_http_date(now);

    let signing_string = build_signing_string(method, &path, &host, &date);
    let signature_bytes = sign(&signing_string, signer)?;
    let signature = encode_signature_header(key_id, &SIGNED_HEADERS, &signature_bytes);

    Ok(SignedRequestContext {
        target_url: url.to_string(),
        method: method.to_uppercase(),
        host,
        path,
        date,
        signing_string,
        signature,
    })
}

/// `host[:port]` as a client sends it in the Host header
pub fn host_header_value(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// A missing `headers` parameter defaults to `date`, as the draft specifies.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((key, value)) = part.split_once('=') else {
            return Err(AppError::MalformedSignature(format!(
                "Unparsable parameter: {}",
                part
            )));
        };
        let value = value.trim().trim_matches('"');

        match key.trim() {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_ascii_lowercase()),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect(),
                )
            }
            "signature" => signature = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(ParsedSignature {
        key_id: key_id
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::MalformedSignature("Missing keyId".to_string()))?,
        algorithm: algorithm.unwrap_or_else(|| "rsa-sha256".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::MalformedSignature("Missing signature".to_string()))?,
    })
}

/// Extract the parsed Signature header from a request's headers.
pub fn signature_from_headers(headers: &HeaderMap) -> Result<ParsedSignature, AppError> {
    let value = headers
        .get("signature")
        .ok_or_else(|| AppError::MalformedSignature("Missing Signature header".to_string()))?
        .to_str()
        .map_err(|_| AppError::MalformedSignature("Invalid Signature header".to_string()))?;
    parse_signature_header(value)
}

/// An inbound request as seen by the verifier
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub method: &'a str,
    /// Path plus query
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::MalformedSignature(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::MalformedSignature(format!("Invalid {} header", name)))
}

/// Verify an inbound request signature
///
/// # Returns
/// `Ok(false)` when the signature does not match the key or the signed
/// content. `Ok(true)` when it does.
///
/// # Errors
/// - `MalformedSignature` if the Signature header is absent or unparsable,
///   or a header it covers is missing
/// - `StaleSignature` if the Date header is outside `clock_skew` of `now`
pub fn verify(
    request: &InboundRequest<'_>,
    public_key: &RsaPublicKey,
    clock_skew: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let parsed = signature_from_headers(request.headers)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::MalformedSignature(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in SIGNED_HEADERS {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::MalformedSignature(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    let date_str = header_str(request.headers, "date")?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| AppError::MalformedSignature("Invalid Date format".to_string()))?
        .with_timezone(&Utc);

    let skew = (now - date).abs();
    if skew > clock_skew {
        return Err(AppError::StaleSignature(format!(
            "Date {} is {}s away from server time",
            date_str,
            skew.num_seconds()
        )));
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", request.method.to_lowercase(), request.path),
            "digest" => {
                let digest = header_str(request.headers, "digest")?;
                if digest != generate_digest(request.body) {
                    tracing::debug!("Digest header does not match request body");
                    return Ok(false);
                }
                digest.to_string()
            }
            name => header_str(request.headers, name)?.to_string(),
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::MalformedSignature("Invalid signature encoding".to_string()))?;

    Ok(verify_signature_bytes(&signing_string, &signature_bytes, public_key))
}

/// Check raw signature bytes against a signing string.
pub fn verify_signature_bytes(
    signing_string: &str,
    signature: &[u8],
    public_key: &RsaPublicKey,
) -> bool {
    let Ok(signature) = Pkcs1v15Signature::try_from(signature) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(public_key.clone())
        .verify(signing_string.as_bytes(), &signature)
        .is_ok()
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// Decode a remote public key advertised as SPKI or PKCS#1 PEM.
pub fn decode_public_key_pem(pem: &str) -> Option<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem.trim())
        .ok()
        .or_else(|| RsaPublicKey::from_pkcs1_pem(pem.trim()).ok())
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("SHA-256={}", BASE64.encode(hasher.finalize()))
}
