//! Control-plane message types exchanged between server and client.
//!
//! On the wire every message travels inside a `{Type, Payload}` envelope
//! (see [`crate::codec`]); field names are PascalCase. All string fields
//! decode as empty when absent.

use serde::{Deserialize, Serialize};

/// Client to server: first message on a new control connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct AuthRequest {
    pub user: String,
    pub password: String,
    /// Empty on a first connection; the server assigns one.
    pub client_id: String,
}

/// Server to client: outcome of authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct AuthResponse {
    pub client_id: String,
    pub error_msg: String,
}

/// Client to server: ask for one or more tunnels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct TunnelRequest {
    pub request_id: String,
    /// Comma-joined protocol list on the wire; single protocol after the
    /// server splits it.
    pub protocol: String,

    // http/https only
    pub host_name: String,
    pub sub_domain: String,
    pub http_auth: String,

    // tcp only
    pub remote_port: u16,
}

/// Server to client: outcome of one per-protocol tunnel registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct TunnelResponse {
    pub request_id: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub protocol: String,
    pub error_msg: String,
}

/// Client to server: first message on a fresh proxy leg, naming the
/// control it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ProxyRegister {
    pub client_id: String,
}

/// Server to client: dial a new proxy leg.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {}

/// Server to client, on a proxy leg: which public URL this leg services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ProxyStart {
    #[serde(rename = "URL")]
    pub url: String,
    pub client_addr: String,
}

/// Heartbeat, either direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {}

/// Heartbeat reply, either direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {}

/// Tagged union over every control-plane message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    AuthRequest(AuthRequest),
    AuthResponse(AuthResponse),
    TunnelRequest(TunnelRequest),
    TunnelResponse(TunnelResponse),
    ProxyRegister(ProxyRegister),
    ProxyRequest(ProxyRequest),
    ProxyStart(ProxyStart),
    Ping(Ping),
    Pong(Pong),
}

impl Message {
    /// The wire name carried in the envelope's `Type` field.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::AuthRequest(_) => "AuthRequest",
            Message::AuthResponse(_) => "AuthResponse",
            Message::TunnelRequest(_) => "TunnelRequest",
            Message::TunnelResponse(_) => "TunnelResponse",
            Message::ProxyRegister(_) => "ProxyRegister",
            Message::ProxyRequest(_) => "ProxyRequest",
            Message::ProxyStart(_) => "ProxyStart",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_field_names_are_pascal_case() {
        let req = TunnelRequest {
            request_id: "42".into(),
            protocol: "http,tcp".into(),
            host_name: "h".into(),
            sub_domain: "s".into(),
            http_auth: "Basic xyz".into(),
            remote_port: 19999,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["RequestId"], "42");
        assert_eq!(json["Protocol"], "http,tcp");
        assert_eq!(json["HostName"], "h");
        assert_eq!(json["SubDomain"], "s");
        assert_eq!(json["HttpAuth"], "Basic xyz");
        assert_eq!(json["RemotePort"], 19999);
    }

    #[test]
    fn url_fields_keep_their_acronym_casing() {
        let resp = TunnelResponse {
            url: "http://x.example.test:80".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("URL").is_some());
        assert!(json.get("Url").is_none());

        let start = ProxyStart {
            url: "tcp://example.test:19999".into(),
            client_addr: "1.2.3.4:5".into(),
        };
        let json = serde_json::to_value(&start).unwrap();
        assert_eq!(json["URL"], "tcp://example.test:19999");
        assert_eq!(json["ClientAddr"], "1.2.3.4:5");
    }

    #[test]
    fn missing_string_fields_decode_as_empty() {
        let req: AuthRequest = serde_json::from_str("{\"User\":\"tok\"}").unwrap();
        assert_eq!(req.user, "tok");
        assert_eq!(req.password, "");
        assert_eq!(req.client_id, "");
    }
}
