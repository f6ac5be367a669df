use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{ObjectMeta, Resource};

/// Arbitrary bytes, base64 encoded on the wire.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ByteString(pub Vec<u8>);

impl From<Vec<u8>> for ByteString {
    fn from(data: Vec<u8>) -> Self {
        ByteString(data)
    }
}

impl Serialize for ByteString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for ByteString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;

        STANDARD
            .decode(encoded.as_bytes())
            .map(ByteString)
            .map_err(D::Error::custom)
    }
}

/// Secret holds secret data of a certain type.
///
/// See https://kubernetes.io/docs/reference/generated/kubernetes-api/v1.31/#secret-v1-core
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Secret {
    pub metadata: ObjectMeta,

    /// Data contains the secret data. Each key must consist of alphanumeric
    /// characters, '-', '_' or '.'.
    #[serde(default)]
    pub data: BTreeMap<String, ByteString>,

    /// Used to facilitate programmatic handling of secret data.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,

    /// e.g. `immutable`
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Resource for Secret {
    const GROUP: &'static str = "";
    const VERSION: &'static str = "v1";
    const KIND: &'static str = "Secret";
    const PLURAL: &'static str = "secrets";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
