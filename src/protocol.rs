// MIT License - Copyright (c) 2026 Peter Wright

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::CbcDecrypter;
use crate::error::{BridgeError, Result};

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

/// Optionally-encrypted data carried by requests, responses and messages.
///
/// When `is_encrypted` is set, `data` is base64 AES-128-CBC ciphertext and
/// `time` is the millisecond timestamp the IV was derived from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataPayload {
    #[serde(rename = "isEncrypted", default, skip_serializing_if = "is_false")]
    pub is_encrypted: bool,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub time: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
}

impl DataPayload {
    /// Read this payload, transparently decrypting if required.
    pub fn read_data(&self, key: &[u8]) -> Result<Vec<u8>> {
        if !self.is_encrypted {
            return Ok(self.data.clone().into_bytes());
        }

        let cipher_bytes = BASE64
            .decode(&self.data)
            .map_err(|e| BridgeError::CryptoDecode(format!("base64 decode: {}", e)))?;
        let mut cipher = CbcDecrypter::new(key, self.time)?;
        cipher.decrypt(&cipher_bytes)
    }

    /// Convenience over [`read_data`](Self::read_data) that unmarshals the
    /// payload as JSON. An empty plaintext is reported distinctly from a
    /// decrypt failure.
    pub fn decode<T: DeserializeOwned>(&self, key: &[u8]) -> Result<T> {
        let bytes = self.read_data(key)?;
        if bytes.is_empty() {
            return Err(BridgeError::EmptyPayload);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// The JSON envelope sent for every basestation request.
///
/// Field names are fixed on the wire. Signed requests carry only `bsid`
/// from the credential plus the session/process identity and the two
/// signatures; the connect request instead carries the full credential and
/// a `communicationType`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestEnvelope {
    #[serde(rename = "bsid", skip_serializing_if = "String::is_empty")]
    pub basestation: String,
    #[serde(rename = "sessionId", skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(rename = "processId", skip_serializing_if = "String::is_empty")]
    pub process_id: String,
    #[serde(rename = "sessionSig", skip_serializing_if = "String::is_empty")]
    pub session_sig: String,
    #[serde(rename = "phoneSig", skip_serializing_if = "String::is_empty")]
    pub phone_sig: String,
    /// Cleared before sending unless the envelope is routed through the
    /// online relay, in which case the relay needs it to forward.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,

    // Connect only.
    #[serde(rename = "phoneId", skip_serializing_if = "String::is_empty")]
    pub phone: String,
    #[serde(rename = "phonePassword", skip_serializing_if = "String::is_empty")]
    pub phone_password: String,
    #[serde(rename = "userPassword", skip_serializing_if = "String::is_empty")]
    pub user_password: String,
    #[serde(rename = "communicationType", skip_serializing_if = "is_zero_i32")]
    pub communication_type: i32,

    #[serde(flatten)]
    pub payload: DataPayload,
}

/// The JSON envelope of every basestation response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GenericResponse {
    #[serde(rename = "sessionSig")]
    pub session_sig: String,
    /// Pending messages, double-encoded as a JSON string.
    #[serde(rename = "messages")]
    pub raw_messages: String,
    pub message: String,
    #[serde(rename = "bsid")]
    pub basestation: String,

    // Connect response.
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "isBasestationOnline")]
    pub is_basestation_online: bool,
    #[serde(rename = "hubVersion")]
    pub hub_version: i32,
    #[serde(rename = "communicationType")]
    pub communication_type: i32,
    #[serde(rename = "sessionSecret")]
    pub session_secret: String,
    #[serde(rename = "serverTime")]
    pub server_time: i64,
    #[serde(rename = "isAdmin")]
    pub is_admin: bool,

    #[serde(flatten)]
    pub payload: DataPayload,
}

impl GenericResponse {
    /// Decode the list of [`Message`]s carried in this response, if any.
    pub fn messages(&self) -> Result<Vec<Message>> {
        if self.raw_messages.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&self.raw_messages)?)
    }
}

/// A queued event from the basestation, returned inside [`GenericResponse`].
///
/// An empty `process_id` marks a status broadcast. A set `process_id` with a
/// null or zero `process_state` is the final reply to an in-flight request;
/// a positive `process_state` marks an in-progress intermediate.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Message {
    #[serde(rename = "appTimeout")]
    pub app_timeout: i32,
    #[serde(rename = "processId")]
    pub process_id: String,
    pub sequence: i32,
    #[serde(rename = "processState")]
    pub process_state: Option<i32>,
    #[serde(rename = "phoneSig")]
    pub phone_sig: String,
    #[serde(rename = "type")]
    pub message_type: i32,

    #[serde(flatten)]
    pub payload: DataPayload,
}

impl Message {
    /// Status broadcasts have no process ID to correlate on.
    pub fn is_status(&self) -> bool {
        self.process_id.is_empty()
    }

    /// A positive process state marks an in-progress intermediate; the
    /// final reply carries a null or zero state.
    pub fn is_intermediate(&self) -> bool {
        matches!(self.process_state, Some(state) if state > 0)
    }
}

/// Every decoded RPC reply is first checked for this shape; a nonzero
/// `code` fails the call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatusReply {
    pub code: i32,
    pub description: String,
}

/// Decrypted body of the connect response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectData {
    pub user_access: UserAccess,
    pub is_password_expired: bool,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserAccess {
    pub is_access_ready: bool,
    /// Seeds the session's scheduling cursor.
    pub next_access: i64,
    pub is_expired: bool,
    pub is_currently_restricted: bool,
    pub description_restriction_details: String,
    pub hash_code: i64,
    pub next_restricted: i64,
    pub is_hub_clock_accurate: bool,
    pub description_next_event: String,
    pub one_time_limit: i64,
    pub has_restrictions: bool,
}

/// Body for `/app/remoteregister` on the remote target.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub remote_registration_code: String,
    pub user_password: String,
    pub phone_model: String,
    /// Can be renamed by the user in the app later.
    pub phone_name: String,
}

/// Registration response: the credential body plus descriptive fields.
/// The user password is not actually part of the response; the caller
/// fills it in before persisting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterResponse {
    #[serde(flatten)]
    pub credential: crate::config::Credential,
    #[serde(rename = "isAdmin")]
    pub is_admin: bool,
    pub name: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "userName")]
    pub user_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_key, CbcEncrypter};
    use serde_json::json;

    #[test]
    fn test_read_data_unencrypted_passthrough() {
        let payload = DataPayload {
            is_encrypted: false,
            time: 0,
            data: "test_plaintext_data".to_string(),
        };
        let out = payload.read_data(b"dummy_key").unwrap();
        assert_eq!(out, b"test_plaintext_data");
    }

    #[test]
    fn test_read_data_invalid_base64() {
        let payload = DataPayload {
            is_encrypted: true,
            time: 1000,
            data: "!!!invalid-base64!!!".to_string(),
        };
        let err = payload.read_data(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, BridgeError::CryptoDecode(_)));
    }

    #[test]
    fn test_read_data_bad_key_is_cipher_init() {
        let payload = DataPayload {
            is_encrypted: true,
            time: 1000,
            data: BASE64.encode([0u8; 16]),
        };
        let err = payload.read_data(b"short").unwrap_err();
        assert!(matches!(err, BridgeError::CryptoInit(_)));
    }

    #[test]
    fn test_decode_roundtrip() {
        let key = derive_key("gSFVYjhgNFdHs8hq");
        let body = json!({"deviceId": "abc", "value": 3}).to_string();
        let t = 1520743556636;

        let mut enc = CbcEncrypter::new(&key, t).unwrap();
        let payload = DataPayload {
            is_encrypted: true,
            time: t,
            data: BASE64.encode(enc.encrypt(body.as_bytes())),
        };

        let out: serde_json::Value = payload.decode(&key).unwrap();
        assert_eq!(out["deviceId"], "abc");
        assert_eq!(out["value"], 3);
    }

    #[test]
    fn test_decode_empty_payload_is_distinct() {
        let payload = DataPayload::default();
        let err = payload.decode::<serde_json::Value>(b"key").unwrap_err();
        assert!(matches!(err, BridgeError::EmptyPayload));
    }

    #[test]
    fn test_signed_envelope_wire_names() {
        let envelope = RequestEnvelope {
            basestation: "bs01".to_string(),
            session_id: "sess".to_string(),
            process_id: "123-E-9-1".to_string(),
            session_sig: "s==".to_string(),
            phone_sig: "p==".to_string(),
            payload: DataPayload {
                is_encrypted: true,
                time: 1000,
                data: "AAAA".to_string(),
            },
            ..Default::default()
        };

        let value = serde_json::to_value(&envelope).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj["bsid"], "bs01");
        assert_eq!(obj["sessionId"], "sess");
        assert_eq!(obj["processId"], "123-E-9-1");
        assert_eq!(obj["sessionSig"], "s==");
        assert_eq!(obj["phoneSig"], "p==");
        assert_eq!(obj["isEncrypted"], true);
        assert_eq!(obj["time"], 1000);
        assert_eq!(obj["data"], "AAAA");
        // Credential passwords never appear in signed envelopes; the path
        // is elided when empty.
        assert!(!obj.contains_key("phonePassword"));
        assert!(!obj.contains_key("userPassword"));
        assert!(!obj.contains_key("phoneId"));
        assert!(!obj.contains_key("path"));
        assert!(!obj.contains_key("communicationType"));
    }

    #[test]
    fn test_connect_envelope_wire_names() {
        let envelope = RequestEnvelope {
            basestation: "bs01".to_string(),
            phone: "phone01".to_string(),
            phone_password: "pp".to_string(),
            user_password: "up".to_string(),
            communication_type: 3,
            path: "app/connect".to_string(),
            ..Default::default()
        };

        let value = serde_json::to_value(&envelope).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj["phoneId"], "phone01");
        assert_eq!(obj["phonePassword"], "pp");
        assert_eq!(obj["userPassword"], "up");
        assert_eq!(obj["communicationType"], 3);
        assert_eq!(obj["path"], "app/connect");
        assert!(!obj.contains_key("sessionId"));
        assert!(!obj.contains_key("isEncrypted"));
    }

    #[test]
    fn test_response_messages_double_encoding() {
        let raw = json!({
            "sessionId": "sess",
            "sessionSecret": "secret",
            "messages": "[{\"processId\":\"a-1\",\"sequence\":2,\"processState\":0,\"type\":1,\"data\":\"x\"},{\"processId\":\"\",\"sequence\":3,\"type\":2}]"
        });
        let resp: GenericResponse = serde_json::from_value(raw).unwrap();
        let messages = resp.messages().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].process_id, "a-1");
        assert_eq!(messages[0].process_state, Some(0));
        assert!(!messages[0].is_status());
        assert!(messages[1].is_status());
    }

    #[test]
    fn test_response_without_messages() {
        let resp: GenericResponse = serde_json::from_value(json!({})).unwrap();
        assert!(resp.messages().unwrap().is_empty());
    }

    #[test]
    fn test_message_classification() {
        let mut msg = Message {
            process_id: "a-1".to_string(),
            process_state: None,
            ..Default::default()
        };
        // Unset state means a final reply.
        assert!(!msg.is_intermediate());
        msg.process_state = Some(0);
        assert!(!msg.is_intermediate());
        msg.process_state = Some(2);
        assert!(msg.is_intermediate());

        msg.process_id = String::new();
        assert!(msg.is_status());
    }

    #[test]
    fn test_status_reply_defaults() {
        let ok: StatusReply = serde_json::from_str("{}").unwrap();
        assert_eq!(ok.code, 0);
        assert!(ok.description.is_empty());

        let err: StatusReply =
            serde_json::from_str(r#"{"code":7,"description":"device busy","extra":1}"#).unwrap();
        assert_eq!(err.code, 7);
        assert_eq!(err.description, "device busy");
    }

    #[test]
    fn test_connect_data_next_access() {
        let raw = json!({
            "userAccess": {
                "isAccessReady": true,
                "nextAccess": 1520743556636_i64,
                "hashCode": 99
            },
            "isAdmin": true
        });
        let data: ConnectData = serde_json::from_value(raw).unwrap();
        assert_eq!(data.user_access.next_access, 1520743556636);
        assert!(data.is_admin);
    }

    #[test]
    fn test_register_response_flattens_credential() {
        let raw = json!({
            "phoneSecret": "shh",
            "bsid": "bs01",
            "phoneId": "phone01",
            "phonePassword": "pp",
            "name": "Home",
            "userName": "sam"
        });
        let resp: RegisterResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(resp.credential.phone_secret, "shh");
        assert_eq!(resp.credential.bsid, "bs01");
        assert_eq!(resp.user_name, "sam");
    }
}
