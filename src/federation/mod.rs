//! ActivityPub federation module
//!
//! Handles:
//! - Local actor identity and keys
//! - HTTP Signatures
//! - Remote actor resolution
//! - Activity delivery (outbox)
//! - Activity processing (inbox)
//! - WebFinger

mod activity;
mod delivery;
mod identity;
mod inbox;
mod resolver;
mod signature;
#[cfg(test)]
pub(crate) mod testing;
mod transport;
mod webfinger;

pub use activity::{
    Accept, Activity, ActivityType, Create, Follow, Note, ObjectRef, UnknownActivity,
    build_accept_activity, build_create_note_activity, new_activity_id,
};
pub use delivery::{ActivityDelivery, DeliveryOutcome, DeliveryResult, RetryPolicy};
pub use identity::{
    ACTIVITY_JSON, ACTIVITYSTREAMS_CONTEXT, ActorDocument, HostIdentity, IdentityManager,
    LocalActor, PublicKeyDocument, SECURITY_CONTEXT,
};
pub use inbox::{InboxOutcome, InboxProcessor, InboxState};
pub use resolver::{RemoteActorRecord, RemoteActorResolver, parse_actor_document};
pub use signature::{
    HTTP_DATE_FORMAT, InboundRequest, ParsedSignature, RequestSigner, SIGNED_HEADERS,
    SignedRequestContext,
    build_signing_string, encode_signature_header, format_http_date, generate_digest,
    key_id_matches_actor, parse_signature_header, sign, sign_request, signer_for, verify,
};
pub use transport::{
    HttpTransport, OutboundRequest, ReqwestTransport, TransportError, TransportResponse,
};
pub use webfinger::{
    JRD_JSON, WebFingerLink, WebFingerResponse, generate_webfinger_response, parse_acct_resource,
};
