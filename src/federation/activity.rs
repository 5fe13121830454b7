//! ActivityPub activities
//!
//! Inbound JSON is parsed once into [`Activity`]; each known type carries only
//! the fields it needs. Anything else is kept verbatim as
//! [`Activity::Unknown`] so newer vocabularies pass through untouched.

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use ulid::Ulid;

use super::identity::{ACTIVITYSTREAMS_CONTEXT, LocalActor};
use crate::error::AppError;

/// Activity types the engine reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityType {
    Follow,
    Accept,
    Create,
    Note,
}

impl ActivityType {
    /// Parse activity type from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Follow" => Some(Self::Follow),
            "Accept" => Some(Self::Accept),
            "Create" => Some(Self::Create),
            "Note" => Some(Self::Note),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Create => "Create",
            Self::Note => "Note",
        }
    }
}

/// A reference to another object: either its id or the embedded object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Id(String),
    Object {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
}

impl ObjectRef {
    pub fn id(&self) -> Option<&str> {
        match self {
            ObjectRef::Id(id) => Some(id),
            ObjectRef::Object { id, .. } => id.as_deref(),
        }
    }
}

/// Audience properties (`to`) hold a single URI or a list of them.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(uri)) => vec![uri],
        Some(OneOrMany::Many(uris)) => uris,
        None => Vec::new(),
    })
}

/// Follow: `object` is the actor being followed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Follow {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub id: String,
    pub actor: String,
    pub object: ObjectRef,
}

/// Accept of an earlier activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accept {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub id: String,
    pub actor: String,
    pub object: ObjectRef,
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub to: Vec<String>,
}

/// Create: `object` is the content entity being published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Create {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub id: String,
    pub actor: String,
    pub object: Value,
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub id: String,
    pub attributed_to: String,
    #[serde(default)]
    pub content: String,
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
}

/// Activity of a type the engine does not handle, kept as received
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownActivity {
    pub kind: String,
    pub raw: Value,
}

impl UnknownActivity {
    pub fn id(&self) -> Option<&str> {
        self.raw.get("id").and_then(Value::as_str)
    }

    pub fn actor(&self) -> Option<&str> {
        match self.raw.get("actor")? {
            Value::String(actor) => Some(actor),
            Value::Object(actor) => actor.get("id").and_then(Value::as_str),
            _ => None,
        }
    }
}

/// A parsed activity
#[derive(Debug, Clone, PartialEq)]
pub enum Activity {
    Follow(Follow),
    Accept(Accept),
    Create(Create),
    Note(Note),
    Unknown(UnknownActivity),
}

impl Activity {
    /// Parse a request body.
    ///
    /// # Errors
    /// `MalformedActivity` for invalid JSON, a missing `type`, or a known type
    /// without its required fields.
    pub fn parse(body: &[u8]) -> Result<Self, AppError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| AppError::MalformedActivity(format!("Invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, AppError> {
        if !value.is_object() {
            return Err(AppError::MalformedActivity(
                "Activity must be a JSON object".to_string(),
            ));
        }

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::MalformedActivity("Missing type".to_string()))?
            .to_string();

        fn typed<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T, AppError> {
            serde_json::from_value(value)
                .map_err(|e| AppError::MalformedActivity(format!("Invalid {}: {}", kind, e)))
        }

        match ActivityType::from_str(&kind) {
            Some(ActivityType::Follow) => typed(&kind, value).map(Activity::Follow),
            Some(ActivityType::Accept) => typed(&kind, value).map(Activity::Accept),
            Some(ActivityType::Create) => {
                let create: Create = typed(&kind, value)?;
                if !create.object.is_object() {
                    return Err(AppError::MalformedActivity(
                        "Create object must be an embedded object".to_string(),
                    ));
                }
                Ok(Activity::Create(create))
            }
            Some(ActivityType::Note) => typed(&kind, value).map(Activity::Note),
            None => Ok(Activity::Unknown(UnknownActivity { kind, raw: value })),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Activity::Follow(a) => Some(&a.id),
            Activity::Accept(a) => Some(&a.id),
            Activity::Create(a) => Some(&a.id),
            Activity::Note(a) => Some(&a.id),
            Activity::Unknown(a) => a.id(),
        }
    }

    /// Wire value of `type`
    pub fn kind(&self) -> &str {
        match self {
            Activity::Follow(_) => ActivityType::Follow.as_str(),
            Activity::Accept(_) => ActivityType::Accept.as_str(),
            Activity::Create(_) => ActivityType::Create.as_str(),
            Activity::Note(_) => ActivityType::Note.as_str(),
            Activity::Unknown(a) => &a.kind,
        }
    }

    /// Bounded label for metrics
    pub fn metric_label(&self) -> &'static str {
        match self {
            Activity::Unknown(_) => "Unknown",
            Activity::Follow(_) => "Follow",
            Activity::Accept(_) => "Accept",
            Activity::Create(_) => "Create",
            Activity::Note(_) => "Note",
        }
    }

    /// The actor the activity claims to come from
    pub fn actor_id(&self) -> Option<&str> {
        match self {
            Activity::Follow(a) => Some(&a.actor),
            Activity::Accept(a) => Some(&a.actor),
            Activity::Create(a) => Some(&a.actor),
            Activity::Note(a) => Some(&a.attributed_to),
            Activity::Unknown(a) => a.actor(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AppError> {
        serde_json::to_vec(self)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("activity serialization: {}", e)))
    }
}

impl Serialize for Activity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Tagged<'a, T> {
            #[serde(rename = "type")]
            kind: &'static str,
            #[serde(flatten)]
            inner: &'a T,
        }

        match self {
            Activity::Follow(inner) => Tagged { kind: "Follow", inner }.serialize(serializer),
            Activity::Accept(inner) => Tagged { kind: "Accept", inner }.serialize(serializer),
            Activity::Create(inner) => Tagged { kind: "Create", inner }.serialize(serializer),
            Activity::Note(inner) => Tagged { kind: "Note", inner }.serialize(serializer),
            Activity::Unknown(unknown) => unknown.raw.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Activity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Activity::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Fresh activity id under the actor: `<actor>/activities/<ulid>`
pub fn new_activity_id(actor_id: &str) -> String {
    format!("{}/activities/{}", actor_id, Ulid::new())
}

fn context() -> Option<Value> {
    Some(Value::String(ACTIVITYSTREAMS_CONTEXT.to_string()))
}

/// Accept for an inbound Follow, from the local actor to the follower.
///
/// `object` names the follower, as the reply is addressed to them.
pub fn build_accept_activity(local: &LocalActor, follow: &Follow) -> Activity {
    Activity::Accept(Accept {
        context: context(),
        id: new_activity_id(local.id()),
        actor: local.id().to_string(),
        object: ObjectRef::Id(follow.actor.clone()),
        to: vec![follow.actor.clone()],
    })
}

/// Create wrapping a new Note addressed to `recipient`.
pub fn build_create_note_activity(local: &LocalActor, content: &str, recipient: &str) -> Activity {
    let published = Utc::now().to_rfc3339();
    let note = Activity::Note(Note {
        context: None,
        id: format!("{}/notes/{}", local.id(), Ulid::new()),
        attributed_to: local.id().to_string(),
        content: content.to_string(),
        to: vec![recipient.to_string()],
        published: Some(published.clone()),
    });

    Activity::Create(Create {
        context: context(),
        id: new_activity_id(local.id()),
        actor: local.id().to_string(),
        object: serde_json::to_value(&note).unwrap_or(Value::Null),
        to: vec![recipient.to_string()],
        published: Some(published),
    })
}
