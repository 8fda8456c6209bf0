use serde::{Deserialize, Serialize};

/// Protocols the engine config builder understands.
pub const SUPPORTED_TYPES: [&str; 3] = ["vless", "vmess", "trojan"];

/// 单个出站候选节点，解析后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub server: String,
    pub port: u16,

    // vless / vmess
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(
        default,
        rename = "alterId",
        skip_serializing_if = "Option::is_none"
    )]
    pub alter_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// vless 里是 "none"/"tls" 字符串，Clash 的 vmess 里是布尔
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,

    // trojan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(
        default,
        rename = "skip-cert-verify",
        skip_serializing_if = "Option::is_none"
    )]
    pub skip_cert_verify: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TlsField {
    Flag(bool),
    Name(String),
}

impl Node {
    pub fn is_valid(&self) -> bool {
        !self.server.is_empty()
            && self.port > 0
            && SUPPORTED_TYPES.contains(&self.node_type.as_str())
    }

    /// 去重键：(server, port, type)，保留首个出现的节点
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.server, self.port, self.node_type)
    }

    pub fn tls_enabled(&self) -> bool {
        match &self.tls {
            Some(TlsField::Flag(b)) => *b,
            Some(TlsField::Name(s)) => !s.is_empty() && s != "none",
            None => false,
        }
    }

    pub fn empty(name: String, node_type: String, server: String, port: u16) -> Self {
        Self {
            name,
            node_type,
            server,
            port,
            uuid: None,
            alter_id: None,
            cipher: None,
            network: None,
            tls: None,
            host: None,
            path: None,
            sni: None,
            password: None,
            skip_cert_verify: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vless_node() -> Node {
        let mut node = Node::empty(
            "n1".to_string(),
            "vless".to_string(),
            "example.com".to_string(),
            443,
        );
        node.uuid = Some("uuid-1".to_string());
        node
    }

    #[test]
    fn valid_node() {
        assert!(vless_node().is_valid());
    }

    #[test]
    fn empty_server_invalid() {
        let mut node = vless_node();
        node.server.clear();
        assert!(!node.is_valid());
    }

    #[test]
    fn zero_port_invalid() {
        let mut node = vless_node();
        node.port = 0;
        assert!(!node.is_valid());
    }

    #[test]
    fn unsupported_type_invalid() {
        let mut node = vless_node();
        node.node_type = "ssr".to_string();
        assert!(!node.is_valid());
    }

    #[test]
    fn tls_field_string_and_bool() {
        let mut node = vless_node();
        assert!(!node.tls_enabled());
        node.tls = Some(TlsField::Name("none".to_string()));
        assert!(!node.tls_enabled());
        node.tls = Some(TlsField::Name("tls".to_string()));
        assert!(node.tls_enabled());
        node.tls = Some(TlsField::Flag(true));
        assert!(node.tls_enabled());
    }

    #[test]
    fn dedup_key_ignores_name() {
        let mut a = vless_node();
        let mut b = vless_node();
        a.name = "first".to_string();
        b.name = "second".to_string();
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn serde_round_trip_uses_wire_names() {
        let mut node = vless_node();
        node.alter_id = Some(0);
        node.skip_cert_verify = Some(true);
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"type\":\"vless\""));
        assert!(json.contains("\"alterId\":0"));
        assert!(json.contains("\"skip-cert-verify\":true"));
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }
}
